//! TOML configuration for the crowdprobe daemon.
//!
//! Layered model: an explicit path, then the `CROWDPROBE_CONFIG` environment
//! variable, then `/etc/crowdprobe/crowdprobe.toml`, then compiled-in
//! defaults. Every section is `#[serde(default)]` so partial files work.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::resources::DataProfile;

const SYSTEM_CONFIG_PATH: &str = "/etc/crowdprobe/crowdprobe.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub checkin: CheckinConfig,
    #[serde(default)]
    pub resources: ResourceConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Try, in order: `CROWDPROBE_CONFIG`, the system path, then defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var("CROWDPROBE_CONFIG") {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "CROWDPROBE_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Render the effective configuration back to TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to serialize configuration")
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Timing limits for the scheduling loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Longest a job may stay alive after its start time (seconds).
    pub max_job_lifetime_sec: i64,
    /// Recurrence interval applied when a descriptor gives none (seconds).
    pub default_interval_sec: i64,
    /// A running job older than this is forcibly cancelled (seconds).
    pub max_run_time_sec: i64,
    /// Ceiling for job types known to run long (seconds).
    pub long_run_time_sec: i64,
    /// Delay before reaping a worker that finished but has not reported (ms).
    pub reconcile_delay_ms: i64,
    /// Retry delay while no network is available (seconds).
    pub network_retry_sec: i64,
    /// Start delay applied to jobs that conflict with the current network.
    pub network_conflict_delay_sec: i64,
    /// Composite timeout used when a child declares no duration (seconds).
    pub composite_timeout_sec: u64,
    /// Time a stopped composite child gets to hand back partial results.
    pub stop_grace_sec: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_job_lifetime_sec: 7 * 24 * 3600,
            default_interval_sec: 3600,
            max_run_time_sec: 15 * 60,
            long_run_time_sec: 30 * 60,
            reconcile_delay_ms: 1000,
            network_retry_sec: 30,
            network_conflict_delay_sec: 300,
            composite_timeout_sec: 120,
            stop_grace_sec: 5,
        }
    }
}

// ---------------------------------------------------------------------------
// Checkin
// ---------------------------------------------------------------------------

/// Remote coordination server checkin settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckinConfig {
    /// Checkin endpoint. Empty disables the checkin cycle.
    pub server_url: String,
    /// Identifier reported to the server with every upload.
    pub device_id: String,
    /// Natural checkin period (seconds).
    pub interval_sec: u64,
    pub min_interval_sec: u64,
    pub max_interval_sec: u64,
    /// Delay before the first checkin after start or an interval change.
    pub initial_delay_sec: u64,
    /// First retry delay after a failed checkin (seconds).
    pub retry_floor_sec: u64,
    /// Largest retry delay (seconds).
    pub retry_ceiling_sec: u64,
    /// Retries attempted before waiting for the next natural period.
    pub max_retries: u32,
    /// HTTP request timeout (seconds).
    pub request_timeout_sec: u64,
}

impl Default for CheckinConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            device_id: "crowdprobe-device".to_string(),
            interval_sec: 3600,
            min_interval_sec: 300,
            max_interval_sec: 24 * 3600,
            initial_delay_sec: 60,
            retry_floor_sec: 20,
            retry_ceiling_sec: 600,
            max_retries: 3,
            request_timeout_sec: 30,
        }
    }
}

impl CheckinConfig {
    pub fn enabled(&self) -> bool {
        !self.server_url.is_empty()
    }

    /// Clamp a requested period into the configured bounds.
    pub fn clamp_interval(&self, seconds: u64) -> u64 {
        seconds.clamp(self.min_interval_sec, self.max_interval_sec)
    }
}

// ---------------------------------------------------------------------------
// Resources
// ---------------------------------------------------------------------------

/// Battery and cellular data policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Minimum battery percentage for background experiments.
    pub battery_threshold_percent: u8,
    /// Monthly cellular budget tier.
    pub data_profile: DataProfile,
    /// sysfs directory holding power supply entries.
    pub power_supply_path: PathBuf,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            battery_threshold_percent: 60,
            data_profile: DataProfile::Profile3,
            power_supply_path: PathBuf::from("/sys/class/power_supply"),
        }
    }
}

// ---------------------------------------------------------------------------
// API / storage / logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/crowdprobe.db"),
        }
    }
}

/// Output format for the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
