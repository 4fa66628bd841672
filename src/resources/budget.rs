//! Battery threshold and monthly cellular byte budget.
//!
//! [`BudgetGuard`] is the default [`ResourceGuard`]. Usage is counted per
//! calendar month and resets when the month rolls over.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Datelike, TimeZone, Utc};
use tracing::{debug, info};

use super::{BatteryMonitor, DataProfile, ResourceGuard};
use crate::clock::Clock;
use crate::config::ResourceConfig;

struct BudgetState {
    battery_threshold: u8,
    profile: DataProfile,
    used_bytes: u64,
    period_start: DateTime<Utc>,
}

pub struct BudgetGuard {
    battery: Arc<dyn BatteryMonitor>,
    clock: Arc<dyn Clock>,
    state: Mutex<BudgetState>,
}

fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

impl BudgetGuard {
    pub fn new(config: &ResourceConfig, battery: Arc<dyn BatteryMonitor>, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            battery,
            clock,
            state: Mutex::new(BudgetState {
                battery_threshold: config.battery_threshold_percent.min(100),
                profile: config.data_profile,
                used_bytes: 0,
                period_start: month_start(now),
            }),
        }
    }

    pub fn used_bytes(&self) -> u64 {
        let mut state = self.lock();
        self.roll_period(&mut state);
        state.used_bytes
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BudgetState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn roll_period(&self, state: &mut BudgetState) {
        let current = month_start(self.clock.now());
        if current > state.period_start {
            info!(used_bytes = state.used_bytes, "data usage period rolled over");
            state.period_start = current;
            state.used_bytes = 0;
        }
    }
}

impl ResourceGuard for BudgetGuard {
    fn can_schedule_experiment(&self) -> bool {
        let threshold = self.lock().battery_threshold;
        match self.battery.read() {
            None => true,
            Some(status) if status.charging => true,
            Some(status) => {
                let allowed = status.percent >= threshold;
                if !allowed {
                    debug!(percent = status.percent, threshold, "battery below threshold");
                }
                allowed
            }
        }
    }

    fn is_over_data_limit(&self, kind: &str, estimated_bytes: u64) -> bool {
        let mut state = self.lock();
        self.roll_period(&mut state);
        let Some(limit) = state.profile.monthly_limit_bytes() else {
            return false;
        };
        let over = state.used_bytes.saturating_add(estimated_bytes) > limit;
        if over {
            debug!(
                kind,
                used = state.used_bytes,
                estimated = estimated_bytes,
                limit,
                "cellular data budget exhausted"
            );
        }
        over
    }

    fn update_data_usage(&self, bytes: u64) {
        let mut state = self.lock();
        self.roll_period(&mut state);
        state.used_bytes = state.used_bytes.saturating_add(bytes);
    }

    fn battery_threshold(&self) -> u8 {
        self.lock().battery_threshold
    }

    fn set_battery_threshold(&self, percent: u8) {
        self.lock().battery_threshold = percent.min(100);
    }

    fn data_profile(&self) -> DataProfile {
        self.lock().profile
    }

    fn set_data_profile(&self, profile: DataProfile) {
        self.lock().profile = profile;
    }
}
