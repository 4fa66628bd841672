//! Job lifecycle status and ownership, keyed by job id.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::jobs::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Scheduled,
    Running,
    Paused,
    Cancelled,
    Finished,
    /// Returned for unknown ids; never stored.
    NotFound,
}

impl JobStatus {
    /// Still queued or executing.
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Scheduled | JobStatus::Running | JobStatus::Paused)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Scheduled => "scheduled",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Finished => "finished",
            JobStatus::NotFound => "not_found",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Default)]
pub struct JobRegistry {
    status: HashMap<JobId, JobStatus>,
    owners: HashMap<JobId, String>,
}

impl JobRegistry {
    /// Record a newly admitted job as `Scheduled` under `submitter`.
    pub fn record(&mut self, id: &JobId, submitter: &str) {
        self.status.insert(id.clone(), JobStatus::Scheduled);
        self.owners.insert(id.clone(), submitter.to_string());
    }

    pub fn set(&mut self, id: &JobId, status: JobStatus) {
        if status != JobStatus::NotFound {
            self.status.insert(id.clone(), status);
        }
    }

    pub fn status(&self, id: &JobId) -> JobStatus {
        self.status.get(id).copied().unwrap_or(JobStatus::NotFound)
    }

    pub fn owner(&self, id: &JobId) -> Option<&str> {
        self.owners.get(id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.status.len()
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_empty()
    }
}
