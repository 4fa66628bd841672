//! Job descriptors: the timing, identity and protocol parameters of a job.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::JobError;
use crate::config::SchedulerConfig;

/// Priority value reserved for interactive (user-initiated) jobs.
pub const USER_PRIORITY: i32 = i32::MIN;
/// Priority value meaning "not assigned".
pub const INVALID_PRIORITY: i32 = i32::MAX;
/// Submitter key owning every server-originated job.
pub const SERVER_SUBMITTER: &str = "server";
/// Parameters with this prefix never leave the device.
pub const LOCAL_PARAM_PREFIX: &str = "local.";

const DEFAULT_CONTEXT_INTERVAL_SEC: u64 = 5;

// ---------------------------------------------------------------------------
// JobId
// ---------------------------------------------------------------------------

/// Content-derived job identifier. Identical descriptors hash to the same id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    fn from_content(content: &str) -> Self {
        let digest = Sha256::digest(content.as_bytes());
        let hex: String = digest[..16].iter().map(|b| format!("{:02x}", b)).collect();
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Repeat
// ---------------------------------------------------------------------------

/// How many more times a job runs. On the wire a negative count is infinite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum Repeat {
    Infinite,
    Times(u32),
}

impl Repeat {
    /// Whether another occurrence follows this one.
    pub fn recurs(self) -> bool {
        match self {
            Repeat::Infinite => true,
            Repeat::Times(n) => n > 1,
        }
    }

    pub fn decremented(self) -> Self {
        match self {
            Repeat::Infinite => Repeat::Infinite,
            Repeat::Times(n) => Repeat::Times(n.saturating_sub(1).max(1)),
        }
    }

    pub fn is_infinite(self) -> bool {
        matches!(self, Repeat::Infinite)
    }
}

impl From<i64> for Repeat {
    fn from(n: i64) -> Self {
        if n < 0 {
            Repeat::Infinite
        } else {
            Repeat::Times(n.clamp(1, u32::MAX as i64) as u32)
        }
    }
}

impl From<Repeat> for i64 {
    fn from(r: Repeat) -> Self {
        match r {
            Repeat::Infinite => -1,
            Repeat::Times(n) => n as i64,
        }
    }
}

// ---------------------------------------------------------------------------
// Priority class
// ---------------------------------------------------------------------------

/// Which execution wrapper a job gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityClass {
    /// Interactive; runs without resource gating.
    User,
    /// Background; gated by the resource guard.
    Server,
}

// ---------------------------------------------------------------------------
// JobRequest (wire form)
// ---------------------------------------------------------------------------

/// A job as submitted by a client or returned by the checkin server.
/// Unset fields are filled in by [`JobDescriptor::from_request`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<Repeat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_interval_seconds: Option<u64>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<JobRequest>,
}

impl JobRequest {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Default::default()
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }
}

/// Normalization bounds taken from the scheduler configuration.
#[derive(Debug, Clone, Copy)]
pub struct DescriptorLimits {
    pub max_lifetime: Duration,
    pub default_interval_sec: i64,
}

impl From<&SchedulerConfig> for DescriptorLimits {
    fn from(cfg: &SchedulerConfig) -> Self {
        Self {
            max_lifetime: Duration::seconds(cfg.max_job_lifetime_sec),
            default_interval_sec: cfg.default_interval_sec,
        }
    }
}

impl Default for DescriptorLimits {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

// ---------------------------------------------------------------------------
// JobDescriptor
// ---------------------------------------------------------------------------

/// Normalized, immutable description of a job.
///
/// A descriptor never changes after creation; recurrences are new
/// descriptors produced by [`JobDescriptor::next_occurrence`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    #[serde(rename = "type")]
    pub kind: String,
    pub submitter: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub interval_seconds: i64,
    pub count: Repeat,
    pub priority: i32,
    pub context_interval_seconds: u64,
    pub parameters: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<JobDescriptor>,
}

impl JobDescriptor {
    /// Apply defaults: start defaults to `now`, end is clamped to
    /// `start + max_lifetime`, a non-positive interval takes the default.
    pub fn from_request(
        request: JobRequest,
        submitter: &str,
        now: DateTime<Utc>,
        limits: &DescriptorLimits,
    ) -> Result<Self, JobError> {
        Self::normalize(request, submitter, INVALID_PRIORITY, now, limits)
    }

    fn normalize(
        request: JobRequest,
        submitter: &str,
        inherited_priority: i32,
        now: DateTime<Utc>,
        limits: &DescriptorLimits,
    ) -> Result<Self, JobError> {
        let kind = request.kind.trim().to_string();
        if kind.is_empty() {
            return Err(JobError::MissingType);
        }

        let start_time = request.start_time.unwrap_or(now);
        let latest_end = start_time
            .checked_add_signed(limits.max_lifetime)
            .ok_or(JobError::TimeOverflow)?;
        let end_time = match request.end_time {
            Some(end) if end <= latest_end => end,
            _ => latest_end,
        };

        let interval_seconds = match request.interval_seconds {
            Some(i) if i > 0 => i,
            _ => limits.default_interval_sec,
        };

        let priority = request.priority.unwrap_or(inherited_priority);

        let children = request
            .children
            .into_iter()
            .map(|child| Self::normalize(child, submitter, priority, start_time, limits))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            kind,
            submitter: submitter.to_string(),
            start_time,
            end_time,
            interval_seconds,
            count: request.count.unwrap_or(Repeat::Times(1)),
            priority,
            context_interval_seconds: request
                .context_interval_seconds
                .unwrap_or(DEFAULT_CONTEXT_INTERVAL_SEC),
            parameters: request.parameters,
            children,
        })
    }

    pub fn class(&self) -> PriorityClass {
        if self.priority == USER_PRIORITY {
            PriorityClass::User
        } else {
            PriorityClass::Server
        }
    }

    pub fn is_server_job(&self) -> bool {
        self.submitter == SERVER_SUBMITTER
    }

    /// Content hash over type, submitter, start/end time, interval, priority
    /// and the sorted parameter pairs (plus child ids for composites).
    pub fn job_id(&self) -> JobId {
        let mut content = format!(
            "{}|{}|{}|{}|{}|{}",
            self.kind,
            self.submitter,
            self.start_time.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.end_time.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.interval_seconds,
            self.priority,
        );
        for (k, v) in &self.parameters {
            content.push_str(&format!("|{}={}", k, v));
        }
        for child in &self.children {
            content.push_str(&format!("|child:{}", child.job_id()));
        }
        JobId::from_content(&content)
    }

    /// Canonical lineage signature: everything except timing and count.
    pub fn signature(&self) -> String {
        let mut sig = format!(
            "{}|{}|{}|{}",
            self.kind, self.submitter, self.interval_seconds, self.priority
        );
        for (k, v) in &self.parameters {
            sig.push_str(&format!("|{}={}", k, v));
        }
        for child in &self.children {
            sig.push_str(&format!("|[{}]", child.signature()));
        }
        sig
    }

    /// The descriptor of the next recurrence, if any remains before `end_time`.
    pub fn next_occurrence(&self) -> Result<Option<Self>, JobError> {
        if !self.count.recurs() {
            return Ok(None);
        }
        let start_time = self
            .start_time
            .checked_add_signed(Duration::seconds(self.interval_seconds))
            .ok_or(JobError::TimeOverflow)?;
        if start_time > self.end_time {
            return Ok(None);
        }
        Ok(Some(Self {
            start_time,
            count: self.count.decremented(),
            ..self.clone()
        }))
    }

    pub fn deadline_passed(&self, now: DateTime<Utc>) -> bool {
        self.end_time < now
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    /// Parse an optional parameter, reporting malformed values.
    pub fn parse_param<T>(&self, key: &str) -> Result<Option<T>, JobError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.param(key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|e| JobError::InvalidParameter {
                    key: key.to_string(),
                    reason: e.to_string(),
                }),
        }
    }

    pub fn require_param(&self, key: &str) -> Result<&str, JobError> {
        self.param(key)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| JobError::InvalidParameter {
                key: key.to_string(),
                reason: "missing".to_string(),
            })
    }

    /// Parameters safe to send off the device.
    pub fn upload_parameters(&self) -> BTreeMap<String, String> {
        self.parameters
            .iter()
            .filter(|(k, _)| !k.starts_with(LOCAL_PARAM_PREFIX))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
