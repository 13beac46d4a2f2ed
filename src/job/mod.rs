//! The persisted job entity.

pub mod status;

pub use self::status::JobStatus;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A named job's persisted liveness record.
///
/// `name` is the only key used for lookup. `id`, `created_at` and `updated_at`
/// belong to the store; the tracker only ever changes `status` and
/// `heartbeat_at`, and always both together.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub id: Option<i64>,
    pub name: String,
    pub status: JobStatus,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub command: Option<String>,
    pub schedule: Option<String>,
    pub description: Option<String>,
    pub enabled: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,

    /// Store session this copy was attached to, if any.
    #[serde(skip)]
    pub(crate) session: Option<u64>,
}

impl JobRecord {
    /// A fresh, unsaved record: idle, never heartbeated.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            status: JobStatus::Idle,
            heartbeat_at: None,
            command: None,
            schedule: None,
            description: None,
            enabled: true,
            created_at: None,
            updated_at: None,
            session: None,
        }
    }

    /// Whether the store has ever assigned this record an identity.
    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }
}

impl std::fmt::Display for JobRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}
