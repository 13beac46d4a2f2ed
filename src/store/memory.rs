//! In-process job store.
//!
//! Same contract as the SQLite store, including the unique name and session
//! detachment, without a database. Counts committed writes so callers can
//! observe heartbeat throttling.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;

use super::session::Session;
use super::{JobStore, StoreError};
use crate::job::JobRecord;

#[derive(Debug, Default)]
struct Inner {
    rows: BTreeMap<i64, JobRecord>,
    next_id: i64,
    session: Session,
    writes: usize,
}

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    inner: Mutex<Inner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Detach every record handed out so far.
    pub fn reset_session(&self) {
        self.lock().session.reset();
    }

    /// Number of committed saves.
    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    /// Number of stored rows carrying this name.
    pub fn count_named(&self, name: &str) -> usize {
        self.lock().rows.values().filter(|r| r.name == name).count()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Inner {
    fn insert(&mut self, record: &mut JobRecord) -> Result<(), StoreError> {
        if self.rows.values().any(|r| r.name == record.name) {
            return Err(StoreError::DuplicateName {
                name: record.name.clone(),
            });
        }
        self.next_id += 1;
        let now = Utc::now();
        record.id = Some(self.next_id);
        record.created_at = Some(now);
        record.updated_at = Some(now);
        self.rows.insert(self.next_id, stored(record));
        Ok(())
    }
}

impl JobStore for MemoryJobStore {
    fn find_by_name(&self, name: &str) -> Result<Option<JobRecord>, StoreError> {
        let mut inner = self.lock();
        let Some(mut found) = inner.rows.values().find(|r| r.name == name).cloned() else {
            return Ok(None);
        };
        inner.session.attach(&mut found);
        Ok(Some(found))
    }

    fn save(&self, record: &mut JobRecord) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let live_id = record
            .id
            .filter(|id| inner.session.is_attached(record) && inner.rows.contains_key(id));

        match live_id {
            Some(id) => {
                record.updated_at = Some(Utc::now());
                inner.rows.insert(id, stored(record));
            }
            None => inner.insert(record)?,
        }

        inner.session.attach(record);
        inner.writes += 1;
        Ok(())
    }

    fn save_status(&self, record: &mut JobRecord) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let live_id = record
            .id
            .filter(|id| inner.session.is_attached(record) && inner.rows.contains_key(id));

        match live_id {
            Some(id) => {
                let now = Utc::now();
                if let Some(row) = inner.rows.get_mut(&id) {
                    row.status = record.status;
                    row.heartbeat_at = record.heartbeat_at;
                    row.updated_at = Some(now);
                }
                record.updated_at = Some(now);
            }
            None => inner.insert(record)?,
        }

        inner.session.attach(record);
        inner.writes += 1;
        Ok(())
    }

    fn is_detached(&self, record: &JobRecord) -> bool {
        !self.lock().session.is_attached(record)
    }

    fn list(&self) -> Result<Vec<JobRecord>, StoreError> {
        let mut inner = self.lock();
        let mut records: Vec<JobRecord> = inner.rows.values().cloned().collect();
        for record in &mut records {
            inner.session.attach(record);
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }
}

fn stored(record: &JobRecord) -> JobRecord {
    let mut row = record.clone();
    row.session = None;
    row
}
