//! Bounded exponential backoff for failed checkins.

use std::time::Duration;

use crate::config::CheckinConfig;

/// Retry bookkeeping across consecutive checkin failures.
///
/// Each failure doubles the backoff up to the ceiling. Once the retry budget
/// is spent, or the backoff has grown to the natural period, the cycle gives
/// up and waits for the next period; giving up resets the state.
#[derive(Debug, Clone)]
pub struct RetryState {
    floor: Duration,
    ceiling: Duration,
    max_retries: u32,
    retries: u32,
    backoff: Duration,
}

impl RetryState {
    pub fn new(cfg: &CheckinConfig) -> Self {
        let floor = Duration::from_secs(cfg.retry_floor_sec.max(1));
        Self {
            floor,
            ceiling: Duration::from_secs(cfg.retry_ceiling_sec).max(floor),
            max_retries: cfg.max_retries,
            retries: 0,
            backoff: floor,
        }
    }

    pub fn on_success(&mut self) {
        self.retries = 0;
        self.backoff = self.floor;
    }

    /// Delay before the next retry, or `None` to wait for the next period.
    pub fn on_failure(&mut self, period: Duration) -> Option<Duration> {
        self.retries += 1;
        if self.retries > self.max_retries || self.backoff >= period {
            self.on_success();
            return None;
        }
        let delay = self.backoff;
        self.backoff = (self.backoff * 2).min(self.ceiling);
        Some(delay)
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }
}
