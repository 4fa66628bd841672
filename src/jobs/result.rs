//! Per-job measurement results.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{JobDescriptor, JobId};
use crate::resources::NetworkClass;

/// Free-form measurement payload.
pub type Payload = BTreeMap<String, serde_json::Value>;

/// Error marker carried by cancelled results.
pub const CANCELLED_MARKER: &str = "cancelled";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    Paused,
    Failed,
    Rescheduled,
    Cancelled,
    /// Not run because of battery or data policy. Not a failure.
    Skipped,
}

/// Device context captured while a job runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSample {
    pub timestamp: DateTime<Utc>,
    pub network: NetworkClass,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_dbm: Option<i32>,
    /// Network class differs from the previous sample.
    #[serde(default)]
    pub connectivity_changed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementResult {
    pub job_id: JobId,
    #[serde(rename = "type")]
    pub kind: String,
    pub outcome: Outcome,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<ContextSample>,
}

impl MeasurementResult {
    pub fn new(job_id: JobId, descriptor: &JobDescriptor, outcome: Outcome) -> Self {
        Self {
            job_id,
            kind: descriptor.kind.clone(),
            outcome,
            timestamp: Utc::now(),
            payload: Payload::new(),
            error: None,
            parameters: descriptor.parameters.clone(),
            context: Vec::new(),
        }
    }

    pub fn completed(job_id: JobId, descriptor: &JobDescriptor, payload: Payload) -> Self {
        Self {
            payload,
            ..Self::new(job_id, descriptor, Outcome::Completed)
        }
    }

    pub fn failed(job_id: JobId, descriptor: &JobDescriptor, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(job_id, descriptor, Outcome::Failed)
        }
    }

    pub fn cancelled(job_id: JobId, descriptor: &JobDescriptor) -> Self {
        Self {
            error: Some(CANCELLED_MARKER.to_string()),
            ..Self::new(job_id, descriptor, Outcome::Cancelled)
        }
    }

    pub fn skipped(job_id: JobId, descriptor: &JobDescriptor, reason: &str) -> Self {
        let mut result = Self::new(job_id, descriptor, Outcome::Skipped);
        result
            .payload
            .insert("skip_reason".to_string(), serde_json::Value::from(reason));
        result
    }

    pub fn with_timestamp(mut self, at: DateTime<Utc>) -> Self {
        self.timestamp = at;
        self
    }

    /// Skipped results describe policy, not the network; they stay local.
    pub fn is_uploadable(&self) -> bool {
        self.outcome != Outcome::Skipped
    }

    /// Copy with execution-local parameters removed.
    pub fn for_upload(&self) -> Self {
        let mut out = self.clone();
        out.parameters
            .retain(|k, _| !k.starts_with(super::LOCAL_PARAM_PREFIX));
        out
    }
}
