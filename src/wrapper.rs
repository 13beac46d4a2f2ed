//! Run a command under a heartbeat tracker.
//!
//! This is what a crontab entry invokes: the wrapped command gets a heartbeat
//! for as long as it runs, and its exit status becomes `idle` or `crashed`.
//!
//! Store calls are synchronous and run inline on the runtime thread, between
//! polls of the child. The CLI drives this on a current-thread runtime, where
//! a slow write (at most the SQLite busy timeout) only delays reaping the
//! child and the next tick. The child itself keeps running meanwhile.

use std::io;
use std::process::ExitStatus;
use std::time::Duration as StdDuration;

use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::store::{JobStore, StoreError};
use crate::tracker::HeartbeatTracker;

#[derive(Debug, Error)]
pub enum WrapperError {
    #[error("job '{name}' is already running (or crashed); not starting another instance")]
    AlreadyRunning { name: String },

    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed waiting for child process: {0}")]
    Wait(#[source] io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct WrapperOptions {
    /// How often to call `heartbeat()` while the child runs.
    pub poll: StdDuration,
    /// Start even if the stored status says the job is not idle.
    pub allow_concurrent: bool,
}

impl Default for WrapperOptions {
    fn default() -> Self {
        Self {
            poll: StdDuration::from_secs(1),
            allow_concurrent: false,
        }
    }
}

/// Run `program args...` to completion, reporting liveness through `tracker`.
///
/// The tracker must already be initiated. Heartbeat failures while the child
/// runs are logged and retried on the next tick; the final `stop`/`crash`
/// write is propagated.
pub async fn run_wrapped<S: JobStore, C: Clock>(
    tracker: &mut HeartbeatTracker<S, C>,
    program: &str,
    args: &[String],
    options: &WrapperOptions,
) -> Result<ExitStatus, WrapperError> {
    if !options.allow_concurrent && tracker.is_already_running()? {
        return Err(WrapperError::AlreadyRunning {
            name: tracker.name().unwrap_or_default().to_string(),
        });
    }
    let name = tracker.name().unwrap_or_default().to_string();

    let mut child = match Command::new(program).args(args).kill_on_drop(true).spawn() {
        Ok(child) => child,
        Err(source) => {
            warn!(job = %name, %program, error = %source, "failed to start job");
            tracker.crash()?;
            return Err(WrapperError::Spawn {
                program: program.to_string(),
                source,
            });
        }
    };
    info!(job = %name, %program, pid = ?child.id(), "job started");

    if let Err(e) = tracker.heartbeat() {
        warn!(job = %name, error = %e, "heartbeat failed");
    }

    let mut ticker = tokio::time::interval(options.poll);
    let waited = loop {
        tokio::select! {
            status = child.wait() => break status,
            _ = ticker.tick() => {
                if let Err(e) = tracker.heartbeat() {
                    warn!(job = %name, error = %e, "heartbeat failed");
                }
            }
        }
    };

    let status = match waited {
        Ok(status) => status,
        Err(e) => {
            tracker.crash()?;
            return Err(WrapperError::Wait(e));
        }
    };

    if status.success() {
        tracker.stop()?;
        info!(job = %name, "job finished");
    } else {
        tracker.crash()?;
        warn!(job = %name, code = ?status.code(), "job exited with failure");
    }
    Ok(status)
}
