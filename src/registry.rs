//! Job metadata: the command a job runs, its cron schedule, a description and
//! whether it is enabled.
//!
//! Registration only touches metadata. Status and heartbeat stay owned by the
//! tracker, and nothing here decides when a job runs.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use thiserror::Error;
use tracing::info;

use crate::job::JobRecord;
use crate::store::{JobStore, StoreError};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidSchedule { expr: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Metadata to attach to a job name.
#[derive(Debug, Clone, Default)]
pub struct JobDefinition {
    pub name: String,
    pub command: Option<String>,
    pub schedule: Option<String>,
    pub description: Option<String>,
    pub enabled: bool,
}

/// Parse a 5-field (minute precision) or 6/7-field (with seconds) cron
/// expression.
pub fn parse_schedule(expr: &str) -> Result<CronSchedule, RegistryError> {
    let fields = expr.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };
    CronSchedule::from_str(&normalized).map_err(|e| RegistryError::InvalidSchedule {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

/// Next time the schedule fires after `after`, if any.
pub fn next_run(expr: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    parse_schedule(expr).ok()?.after(&after).next()
}

/// Create or update the metadata of a job, leaving status and heartbeat alone.
pub fn register<S: JobStore + ?Sized>(
    store: &S,
    definition: &JobDefinition,
) -> Result<JobRecord, RegistryError> {
    if let Some(expr) = &definition.schedule {
        parse_schedule(expr)?;
    }

    let mut record = match store.find_by_name(&definition.name)? {
        Some(found) => found,
        None => store.create(&definition.name),
    };
    let created = !record.is_persisted();

    record.command = definition.command.clone();
    record.schedule = definition.schedule.clone();
    record.description = definition.description.clone();
    record.enabled = definition.enabled;
    store.save(&mut record)?;

    info!(job = %record.name, created, enabled = record.enabled, "job registered");
    Ok(record)
}
