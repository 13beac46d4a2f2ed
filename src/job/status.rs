//! Liveness status of a tracked job.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The three states a job can report. Stored as lower-case text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Not running; the last run finished (or the job never ran).
    #[default]
    Idle,
    /// Running and heartbeating.
    Running,
    /// Reported a failure, or was flagged by the monitor for a stale heartbeat.
    Crashed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Idle => "idle",
            JobStatus::Running => "running",
            JobStatus::Crashed => "crashed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Returned when a stored status string is not one of the known values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown job status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(JobStatus::Idle),
            "running" => Ok(JobStatus::Running),
            "crashed" => Ok(JobStatus::Crashed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}
