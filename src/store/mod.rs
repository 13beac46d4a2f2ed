//! Job record persistence: the `JobStore` contract and its implementations.
//!
//! A store keeps a *session*: the set of records it currently recognizes as
//! the live representation of their rows. Copies handed out by `find_by_name`,
//! `list` and `save` are attached to the session; `reset_session()` on a
//! concrete store detaches every copy handed out so far. Saving a detached
//! copy is an insert, which fails on the unique name if the row exists.

pub mod memory;
pub mod schema;
pub mod session;
pub mod sqlite;

pub use self::memory::MemoryJobStore;
pub use self::sqlite::{open_pool, Pool, SqliteJobStore};

use std::sync::Arc;

use thiserror::Error;

use crate::job::JobRecord;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("a job named '{name}' already exists")]
    DuplicateName { name: String },

    #[error("job store unavailable: {0}")]
    Unavailable(#[from] r2d2::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("corrupt value in column {column}: '{value}'")]
    Corrupt { column: &'static str, value: String },
}

/// Persistence collaborator of the heartbeat tracker. Lookup is by name only.
pub trait JobStore {
    /// Fetch the record with this name, attached to the current session.
    fn find_by_name(&self, name: &str) -> Result<Option<JobRecord>, StoreError>;

    /// A new, unsaved record: idle, no heartbeat.
    fn create(&self, name: &str) -> JobRecord {
        JobRecord::new(name)
    }

    /// Insert-or-update, committed immediately. Fills in `id` and the
    /// bookkeeping timestamps and attaches the record on success.
    fn save(&self, record: &mut JobRecord) -> Result<(), StoreError>;

    /// Write only `status` and `heartbeat_at` of an attached record, leaving
    /// its metadata columns as they are in the store. A record that is not
    /// attached is inserted in full, like `save`.
    fn save_status(&self, record: &mut JobRecord) -> Result<(), StoreError>;

    /// True when the store's session does not recognize this copy as the live
    /// row: never persisted, or handed out before a session reset.
    fn is_detached(&self, record: &JobRecord) -> bool;

    /// Every record, ordered by name, attached to the current session.
    fn list(&self) -> Result<Vec<JobRecord>, StoreError>;
}

impl<S: JobStore + ?Sized> JobStore for &S {
    fn find_by_name(&self, name: &str) -> Result<Option<JobRecord>, StoreError> {
        (**self).find_by_name(name)
    }

    fn create(&self, name: &str) -> JobRecord {
        (**self).create(name)
    }

    fn save(&self, record: &mut JobRecord) -> Result<(), StoreError> {
        (**self).save(record)
    }

    fn save_status(&self, record: &mut JobRecord) -> Result<(), StoreError> {
        (**self).save_status(record)
    }

    fn is_detached(&self, record: &JobRecord) -> bool {
        (**self).is_detached(record)
    }

    fn list(&self) -> Result<Vec<JobRecord>, StoreError> {
        (**self).list()
    }
}

impl<S: JobStore + ?Sized> JobStore for Arc<S> {
    fn find_by_name(&self, name: &str) -> Result<Option<JobRecord>, StoreError> {
        (**self).find_by_name(name)
    }

    fn create(&self, name: &str) -> JobRecord {
        (**self).create(name)
    }

    fn save(&self, record: &mut JobRecord) -> Result<(), StoreError> {
        (**self).save(record)
    }

    fn save_status(&self, record: &mut JobRecord) -> Result<(), StoreError> {
        (**self).save_status(record)
    }

    fn is_detached(&self, record: &JobRecord) -> bool {
        (**self).is_detached(record)
    }

    fn list(&self) -> Result<Vec<JobRecord>, StoreError> {
        (**self).list()
    }
}
