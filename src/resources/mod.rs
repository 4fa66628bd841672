//! Resource admission: battery headroom, cellular data budget, and the
//! network class oracle consulted before and during execution.

pub mod battery;
pub mod budget;
pub mod network;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use self::battery::{BatteryMonitor, BatteryStatus, StaticBattery, SysfsBattery};
pub use self::budget::BudgetGuard;
pub use self::network::{NetworkClass, NetworkMonitor, StaticNetworkMonitor, SystemNetworkMonitor};

const MB: u64 = 1024 * 1024;

/// Policy oracle gating execution on battery and data budget.
pub trait ResourceGuard: Send + Sync {
    /// Enough battery headroom to run background work.
    fn can_schedule_experiment(&self) -> bool;

    /// Running one more `kind` job would exceed the cellular budget.
    fn is_over_data_limit(&self, kind: &str, estimated_bytes: u64) -> bool;

    /// Account bytes consumed on a metered network.
    fn update_data_usage(&self, bytes: u64);

    fn battery_threshold(&self) -> u8;
    fn set_battery_threshold(&self, percent: u8);

    fn data_profile(&self) -> DataProfile;
    fn set_data_profile(&self, profile: DataProfile);
}

/// Monthly cellular data tier, ordered from tightest to loosest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataProfile {
    Profile1,
    Profile2,
    Profile3,
    Profile4,
    Unlimited,
}

impl DataProfile {
    pub fn monthly_limit_bytes(self) -> Option<u64> {
        match self {
            DataProfile::Profile1 => Some(50 * MB),
            DataProfile::Profile2 => Some(100 * MB),
            DataProfile::Profile3 => Some(250 * MB),
            DataProfile::Profile4 => Some(500 * MB),
            DataProfile::Unlimited => None,
        }
    }

    /// Parameter carrying the server's frequency multiplier for this tier.
    pub fn frequency_key(self) -> &'static str {
        match self {
            DataProfile::Profile1 => "profile_1_freq",
            DataProfile::Profile2 => "profile_2_freq",
            DataProfile::Profile3 => "profile_3_freq",
            DataProfile::Profile4 => "profile_4_freq",
            DataProfile::Unlimited => "profile_unlimited_freq",
        }
    }
}

impl fmt::Display for DataProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataProfile::Profile1 => "profile1",
            DataProfile::Profile2 => "profile2",
            DataProfile::Profile3 => "profile3",
            DataProfile::Profile4 => "profile4",
            DataProfile::Unlimited => "unlimited",
        };
        f.write_str(s)
    }
}

impl FromStr for DataProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "").as_str() {
            "profile1" => Ok(DataProfile::Profile1),
            "profile2" => Ok(DataProfile::Profile2),
            "profile3" => Ok(DataProfile::Profile3),
            "profile4" => Ok(DataProfile::Profile4),
            "unlimited" => Ok(DataProfile::Unlimited),
            other => Err(format!("unknown data profile '{}'", other)),
        }
    }
}
