//! Atomic measurements run by the scheduler.
//!
//! Each probe parses its parameters from a [`JobDescriptor`] up front, then
//! runs through the [`Measurement`](crate::jobs::Measurement) contract,
//! checking the job control at safe points.

pub mod dns;
pub mod http;
pub mod ping;
pub mod tcp;
pub mod traceroute;
pub mod udp;

use std::time::Duration;

use serde_json::Value;

use crate::jobs::{JobDescriptor, JobError, Payload};

/// Reject targets that could smuggle arguments into a subprocess.
pub(crate) fn validate_target(target: &str) -> Result<String, JobError> {
    let target = target.trim();
    if target.is_empty()
        || target.starts_with('-')
        || target
            .chars()
            .any(|c| !c.is_alphanumeric() && c != '.' && c != ':' && c != '-' && c != '_')
    {
        return Err(JobError::InvalidParameter {
            key: "target".to_string(),
            reason: format!("'{}' is not a hostname or address", target),
        });
    }
    Ok(target.to_string())
}

/// Optional seconds parameter with a default.
pub(crate) fn seconds_param(d: &JobDescriptor, key: &str, default: f64) -> Result<Duration, JobError> {
    let secs = d.parse_param::<f64>(key)?.unwrap_or(default);
    if !secs.is_finite() || secs <= 0.0 {
        return Err(JobError::InvalidParameter {
            key: key.to_string(),
            reason: "must be a positive number of seconds".to_string(),
        });
    }
    Ok(Duration::from_secs_f64(secs))
}

/// Optional integer parameter bounded to `range`.
pub(crate) fn bounded_param(
    d: &JobDescriptor,
    key: &str,
    default: u32,
    range: std::ops::RangeInclusive<u32>,
) -> Result<u32, JobError> {
    let value = d.parse_param::<u32>(key)?.unwrap_or(default);
    if !range.contains(&value) {
        return Err(JobError::InvalidParameter {
            key: key.to_string(),
            reason: format!("must be within {}..={}", range.start(), range.end()),
        });
    }
    Ok(value)
}

pub(crate) fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Mean/min/max/stddev over RTT samples (ms), as payload entries.
pub(crate) fn rtt_summary(payload: &mut Payload, samples: &[f64]) {
    if samples.is_empty() {
        return;
    }
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let min = samples.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = samples.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let variance = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;

    payload.insert("mean_rtt_ms".to_string(), Value::from(mean));
    payload.insert("min_rtt_ms".to_string(), Value::from(min));
    payload.insert("max_rtt_ms".to_string(), Value::from(max));
    payload.insert("stddev_rtt_ms".to_string(), Value::from(variance.sqrt()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_target() {
        assert_eq!(validate_target(" 8.8.8.8 ").unwrap(), "8.8.8.8");
        assert!(validate_target("www.example.com").is_ok());
        assert!(validate_target("2001:db8::1").is_ok());
        assert!(validate_target("-f").is_err());
        assert!(validate_target("host; rm -rf /").is_err());
        assert!(validate_target("").is_err());
    }

    #[test]
    fn test_rtt_summary() {
        let mut p = Payload::new();
        rtt_summary(&mut p, &[10.0, 20.0, 30.0]);
        assert_eq!(p["mean_rtt_ms"], 20.0);
        assert_eq!(p["min_rtt_ms"], 10.0);
        assert_eq!(p["max_rtt_ms"], 30.0);

        let mut empty = Payload::new();
        rtt_summary(&mut empty, &[]);
        assert!(empty.is_empty());
    }
}
