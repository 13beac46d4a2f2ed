//! TOML configuration.
//!
//! Every field has a default, so an empty file (or no file at all) is a valid
//! configuration. Lookup order: explicit path, `JOBPULSE_CONFIG`, then
//! `/etc/jobpulse/jobpulse.toml`, then compiled-in defaults.

use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::SystemClock;
use crate::tracker::HeartbeatSettings;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "JOBPULSE_CONFIG";

/// Standard system location of the config file.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/jobpulse/jobpulse.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobPulseConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl JobPulseConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Load from `explicit` if given (errors are fatal), otherwise search the
    /// environment variable and the system location, falling back to
    /// defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        Ok(Self::load_or_default())
    }

    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "JOBPULSE_CONFIG set but file could not be loaded, trying fallback"
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
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite database file.
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/jobpulse.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Minimum seconds between two persisted heartbeats.
    pub interval_seconds: u32,
    /// Minutes without a heartbeat before a job is assumed crashed.
    pub crash_threshold_minutes: u32,
    /// Timezone for generated job names and displayed times, in minutes east
    /// of UTC.
    pub utc_offset_minutes: i32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        let settings = HeartbeatSettings::default();
        Self {
            interval_seconds: settings.interval_seconds,
            crash_threshold_minutes: settings.crash_threshold_minutes,
            utc_offset_minutes: 0,
        }
    }
}

impl HeartbeatConfig {
    pub fn settings(&self) -> HeartbeatSettings {
        HeartbeatSettings {
            interval_seconds: self.interval_seconds,
            crash_threshold_minutes: self.crash_threshold_minutes,
        }
    }

    pub fn clock(&self) -> SystemClock {
        SystemClock::from_offset_minutes(self.utc_offset_minutes)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Seconds between sweeps in watch mode.
    pub poll_interval_seconds: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 60,
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.poll_interval_seconds.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
