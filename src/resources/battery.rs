//! Battery state from the Linux power-supply class.

use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatteryStatus {
    pub percent: u8,
    pub charging: bool,
}

pub trait BatteryMonitor: Send + Sync {
    /// `None` when the device has no battery (mains powered).
    fn read(&self) -> Option<BatteryStatus>;
}

/// Reads `/sys/class/power_supply/*/{type,capacity,status}`.
#[derive(Debug, Clone)]
pub struct SysfsBattery {
    root: PathBuf,
}

impl SysfsBattery {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl BatteryMonitor for SysfsBattery {
    fn read(&self) -> Option<BatteryStatus> {
        let entries = fs::read_dir(&self.root).ok()?;
        for entry in entries.flatten() {
            let dir = entry.path();
            let kind = fs::read_to_string(dir.join("type")).unwrap_or_default();
            if kind.trim() != "Battery" {
                continue;
            }
            let Some(percent) = fs::read_to_string(dir.join("capacity"))
                .ok()
                .and_then(|s| s.trim().parse::<u8>().ok())
            else {
                debug!(path = %dir.display(), "battery without readable capacity");
                continue;
            };
            // "Charging", "Discharging", "Full", "Not charging"
            let status = fs::read_to_string(dir.join("status")).unwrap_or_default();
            let charging = matches!(status.trim(), "Charging" | "Full");
            return Some(BatteryStatus {
                percent: percent.min(100),
                charging,
            });
        }
        None
    }
}

/// Fixed battery reading, settable at runtime.
#[derive(Debug, Default)]
pub struct StaticBattery {
    status: Mutex<Option<BatteryStatus>>,
}

impl StaticBattery {
    pub fn new(status: Option<BatteryStatus>) -> Self {
        Self {
            status: Mutex::new(status),
        }
    }

    pub fn set(&self, status: Option<BatteryStatus>) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }
}

impl BatteryMonitor for StaticBattery {
    fn read(&self) -> Option<BatteryStatus> {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }
}
