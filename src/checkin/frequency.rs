//! Per-profile frequency scaling of server jobs.
//!
//! The server attaches a multiplier for each data profile
//! (`profile_1_freq` .. `profile_4_freq`, `profile_unlimited_freq`). The job's
//! interval is divided by the multiplier for the device's current profile;
//! a multiplier of zero or less drops the job on this device.

use tracing::{debug, warn};

use crate::jobs::JobRequest;
use crate::resources::DataProfile;

/// Scale `request` for `profile`, or `None` if it should not run here.
pub fn adjust_frequency(mut request: JobRequest, profile: DataProfile) -> Option<JobRequest> {
    let key = profile.frequency_key();
    let multiplier = match request.parameters.get(key) {
        None => return Some(request),
        Some(raw) => match raw.trim().parse::<f64>() {
            Ok(m) if m.is_finite() => m,
            _ => {
                warn!(kind = %request.kind, key, value = %raw, "bad frequency multiplier, ignoring");
                return Some(request);
            }
        },
    };

    if multiplier <= 0.0 {
        debug!(kind = %request.kind, %profile, "job disabled for data profile");
        return None;
    }

    if let Some(interval) = request.interval_seconds.filter(|i| *i > 0) {
        let scaled = (interval as f64 / multiplier).round().max(1.0);
        request.interval_seconds = Some(scaled.min(i64::MAX as f64) as i64);
    }
    Some(request)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(interval: i64) -> JobRequest {
        let mut req = JobRequest::new("ping")
            .param("target", "8.8.8.8")
            .param("profile_1_freq", "0.5")
            .param("profile_2_freq", "0")
            .param("profile_unlimited_freq", "4");
        req.interval_seconds = Some(interval);
        req
    }

    #[test]
    fn test_multiplier_scales_interval() {
        let slower = adjust_frequency(job(600), DataProfile::Profile1).unwrap();
        assert_eq!(slower.interval_seconds, Some(1200));

        let faster = adjust_frequency(job(600), DataProfile::Unlimited).unwrap();
        assert_eq!(faster.interval_seconds, Some(150));
    }

    #[test]
    fn test_zero_multiplier_drops_job() {
        assert!(adjust_frequency(job(600), DataProfile::Profile2).is_none());
    }

    #[test]
    fn test_missing_or_bad_multiplier_keeps_job() {
        let unchanged = adjust_frequency(job(600), DataProfile::Profile3).unwrap();
        assert_eq!(unchanged.interval_seconds, Some(600));

        let bad = job(600).param("profile_4_freq", "often");
        let kept = adjust_frequency(bad, DataProfile::Profile4).unwrap();
        assert_eq!(kept.interval_seconds, Some(600));
    }
}
