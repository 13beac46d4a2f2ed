//! jobpulse -- heartbeat and crash tracking for cron jobs and batch processes.
//!
//! A job process reports liveness through a [`tracker::HeartbeatTracker`];
//! a separate [`monitor::Monitor`] marks jobs whose heartbeat went stale as
//! crashed. Records live in a [`store::JobStore`], normally SQLite.

pub mod clock;
pub mod config;
pub mod job;
pub mod monitor;
pub mod registry;
pub mod store;
pub mod tracker;
pub mod wrapper;

use anyhow::Result;

use crate::config::JobPulseConfig;
use crate::store::SqliteJobStore;

/// Open the SQLite store named by the configuration, creating its directory
/// if needed.
pub fn open_store(config: &JobPulseConfig) -> Result<SqliteJobStore> {
    let path = &config.database.path;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    tracing::debug!(path = %path.display(), "Opening job store");
    Ok(SqliteJobStore::open(path)?)
}

/// Run the stale-heartbeat monitor until Ctrl-C.
pub async fn watch(config: &JobPulseConfig) -> Result<()> {
    let store = open_store(config)?;
    let monitor = monitor::Monitor::new(
        store,
        config.heartbeat.clock(),
        config.heartbeat.crash_threshold_minutes,
    );
    monitor::run_monitor_loop(monitor, config.monitor.poll_interval()).await;
    Ok(())
}
