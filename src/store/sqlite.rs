//! SQLite-backed job store over an r2d2 connection pool.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, warn};

use super::schema;
use super::session::Session;
use super::{JobStore, StoreError};
use crate::job::{JobRecord, JobStatus};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: impl AsRef<Path>) -> Result<Pool, StoreError> {
    let manager = SqliteConnectionManager::file(path.as_ref()).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

const SELECT_COLUMNS: &str = "SELECT id, name, status, heartbeat_at, command, schedule, \
     description, enabled, created_at, updated_at FROM job_records";

pub struct SqliteJobStore {
    pool: Pool,
    session: Mutex<Session>,
}

impl SqliteJobStore {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            session: Mutex::new(Session::new()),
        }
    }

    /// Open the database at `path` and wrap it in a store.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Ok(Self::new(open_pool(path)?))
    }

    pub fn get_pool(&self) -> &Pool {
        &self.pool
    }

    /// Detach every record handed out so far.
    pub fn reset_session(&self) {
        let mut session = self.session();
        debug!(attached = session.len(), "resetting store session");
        session.reset();
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert the full row. Fails on an existing name.
    fn insert(&self, conn: &Connection, record: &mut JobRecord) -> Result<(), StoreError> {
        let now = Utc::now();
        let inserted = conn.execute(
            "INSERT INTO job_records
                (name, status, heartbeat_at, command, schedule, description, enabled, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                record.name,
                record.status.as_str(),
                record.heartbeat_at.map(format_ts),
                record.command,
                record.schedule,
                record.description,
                record.enabled,
                format_ts(now)
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(StoreError::DuplicateName {
                    name: record.name.clone(),
                })
            }
            Err(e) => return Err(e.into()),
        }

        record.id = Some(conn.last_insert_rowid());
        record.created_at = Some(now);
        record.updated_at = Some(now);
        self.session().attach(record);
        Ok(())
    }
}

impl JobStore for SqliteJobStore {
    fn find_by_name(&self, name: &str) -> Result<Option<JobRecord>, StoreError> {
        let conn = self.pool.get()?;
        let sql = format!("{SELECT_COLUMNS} WHERE name = ?1");
        let raw = conn
            .query_row(&sql, params![name], RawRow::from_row)
            .optional()?;

        let Some(raw) = raw else {
            return Ok(None);
        };
        let mut record = raw.into_record()?;
        self.session().attach(&mut record);
        Ok(Some(record))
    }

    fn save(&self, record: &mut JobRecord) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        let now = Utc::now();
        let stamp = format_ts(now);

        if let Some(id) = record.id.filter(|_| self.session().is_attached(record)) {
            let changed = conn.execute(
                "UPDATE job_records
                 SET status = ?2, heartbeat_at = ?3, command = ?4, schedule = ?5,
                     description = ?6, enabled = ?7, updated_at = ?8
                 WHERE id = ?1",
                params![
                    id,
                    record.status.as_str(),
                    record.heartbeat_at.map(format_ts),
                    record.command,
                    record.schedule,
                    record.description,
                    record.enabled,
                    stamp
                ],
            )?;
            if changed == 1 {
                record.updated_at = Some(now);
                self.session().attach(record);
                return Ok(());
            }
            warn!(job = %record.name, id, "attached row no longer exists, inserting");
        }

        self.insert(&conn, record)
    }

    fn save_status(&self, record: &mut JobRecord) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        let now = Utc::now();

        if let Some(id) = record.id.filter(|_| self.session().is_attached(record)) {
            let changed = conn.execute(
                "UPDATE job_records SET status = ?2, heartbeat_at = ?3, updated_at = ?4 WHERE id = ?1",
                params![
                    id,
                    record.status.as_str(),
                    record.heartbeat_at.map(format_ts),
                    format_ts(now)
                ],
            )?;
            if changed == 1 {
                record.updated_at = Some(now);
                self.session().attach(record);
                return Ok(());
            }
            warn!(job = %record.name, id, "attached row no longer exists, inserting");
        }

        self.insert(&conn, record)
    }

    fn is_detached(&self, record: &JobRecord) -> bool {
        !self.session().is_attached(record)
    }

    fn list(&self) -> Result<Vec<JobRecord>, StoreError> {
        let conn = self.pool.get()?;
        let sql = format!("{SELECT_COLUMNS} ORDER BY name");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], RawRow::from_row)?;

        let mut records = Vec::new();
        let mut session = self.session();
        for r in rows {
            let mut record = r?.into_record()?;
            session.attach(&mut record);
            records.push(record);
        }
        Ok(records)
    }
}

/// A row as stored, before text columns are parsed.
struct RawRow {
    id: i64,
    name: String,
    status: String,
    heartbeat_at: Option<String>,
    command: Option<String>,
    schedule: Option<String>,
    description: Option<String>,
    enabled: bool,
    created_at: String,
    updated_at: String,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            status: row.get(2)?,
            heartbeat_at: row.get(3)?,
            command: row.get(4)?,
            schedule: row.get(5)?,
            description: row.get(6)?,
            enabled: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn into_record(self) -> Result<JobRecord, StoreError> {
        let status: JobStatus = self.status.parse().map_err(|_| StoreError::Corrupt {
            column: "status",
            value: self.status.clone(),
        })?;

        let mut record = JobRecord::new(self.name);
        record.id = Some(self.id);
        record.status = status;
        record.heartbeat_at = self
            .heartbeat_at
            .map(|s| parse_ts("heartbeat_at", s))
            .transpose()?;
        record.command = self.command;
        record.schedule = self.schedule;
        record.description = self.description;
        record.enabled = self.enabled;
        record.created_at = Some(parse_ts("created_at", self.created_at)?);
        record.updated_at = Some(parse_ts("updated_at", self.updated_at)?);
        Ok(record)
    }
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(column: &'static str, value: String) -> Result<DateTime<Utc>, StoreError> {
    match DateTime::parse_from_rfc3339(&value) {
        Ok(ts) => Ok(ts.with_timezone(&Utc)),
        Err(_) => Err(StoreError::Corrupt { column, value }),
    }
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}
