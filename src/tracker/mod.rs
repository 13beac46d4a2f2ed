//! Heartbeat tracking for one named job.
//!
//! A job process builds one [`HeartbeatTracker`], calls
//! [`initiate`](HeartbeatTracker::initiate) once, then
//! [`heartbeat`](HeartbeatTracker::heartbeat) from its work loop and
//! [`stop`](HeartbeatTracker::stop) or [`crash`](HeartbeatTracker::crash) when
//! it ends. Heartbeats are throttled so they can be called per item in a tight
//! loop; status changes are always written.
//!
//! The tracker caches the job record between calls. Before trusting the cache
//! it asks the store whether the copy is still attached; a detached copy is
//! dropped and the record is looked up again by name, so a job that resets its
//! store session mid-run keeps updating the same row instead of inserting a
//! duplicate.

pub mod staleness;

pub use self::staleness::{heartbeat_age, is_stale};

use chrono::{DateTime, Duration, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::job::{JobRecord, JobStatus};
use crate::store::{JobStore, StoreError};

/// Prefix of the name used when a tracker is never given one.
pub const NAMELESS_PREFIX: &str = "nameless_process_";

/// Timing knobs of a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatSettings {
    /// Minimum spacing between two persisted heartbeats.
    pub interval_seconds: u32,
    /// Heartbeat age after which a job is assumed to have crashed.
    pub crash_threshold_minutes: u32,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval_seconds: 10,
            crash_threshold_minutes: 15,
        }
    }
}

impl HeartbeatSettings {
    pub fn interval(&self) -> Duration {
        Duration::seconds(i64::from(self.interval_seconds))
    }
}

pub struct HeartbeatTracker<S, C = SystemClock> {
    store: S,
    clock: C,
    settings: HeartbeatSettings,
    name: Option<String>,
    cached: Option<JobRecord>,
    skew_warned: bool,
}

impl<S: JobStore> HeartbeatTracker<S, SystemClock> {
    /// Tracker on the system clock in UTC.
    pub fn new(store: S, settings: HeartbeatSettings) -> Self {
        Self::with_clock(store, SystemClock::utc(), settings)
    }
}

impl<S: JobStore, C: Clock> HeartbeatTracker<S, C> {
    pub fn with_clock(store: S, clock: C, settings: HeartbeatSettings) -> Self {
        Self {
            store,
            clock,
            settings,
            name: None,
            cached: None,
            skew_warned: false,
        }
    }

    /// Bind the tracker to a job name and forget any cached record.
    ///
    /// Without a name, one is generated from the current time the first time
    /// it is needed.
    pub fn initiate(&mut self, name: Option<&str>) {
        self.name = name.map(str::to_string);
        self.cached = None;
        self.skew_warned = false;
        debug!(job = ?self.name, "tracker initiated");
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn settings(&self) -> &HeartbeatSettings {
        &self.settings
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// The record as last resolved or written by this tracker.
    pub fn record(&self) -> Option<&JobRecord> {
        self.cached.as_ref()
    }

    /// Record that the job is still running, if the last known heartbeat is
    /// older than the heartbeat interval. Returns whether a write happened.
    pub fn heartbeat(&mut self) -> Result<bool, StoreError> {
        let now = self.clock.now();
        if !self.should_heartbeat(now)? {
            return Ok(false);
        }
        self.set_status(JobStatus::Running, now)?;
        Ok(true)
    }

    /// Mark the job idle. Always written.
    pub fn stop(&mut self) -> Result<(), StoreError> {
        let now = self.clock.now();
        self.set_status(JobStatus::Idle, now)
    }

    /// Mark the job crashed. Always written.
    pub fn crash(&mut self) -> Result<(), StoreError> {
        let now = self.clock.now();
        self.set_status(JobStatus::Crashed, now)
    }

    /// Whether the job's stored status is anything but idle.
    ///
    /// Advisory only: nothing stops another process from starting the same
    /// job between this check and its first heartbeat.
    pub fn is_already_running(&mut self) -> Result<bool, StoreError> {
        let now = self.clock.now();
        Ok(self.job_record(now)?.status != JobStatus::Idle)
    }

    pub fn has_status_running(&mut self) -> Result<bool, StoreError> {
        let now = self.clock.now();
        Ok(self.job_record(now)?.status == JobStatus::Running)
    }

    /// Whether `heartbeat` is old enough, as of now, to assume a crash.
    pub fn is_stale(&self, heartbeat: Option<DateTime<Utc>>) -> bool {
        let now = self.clock.now().with_timezone(&Utc);
        is_stale(heartbeat, now, self.settings.crash_threshold_minutes)
    }

    fn should_heartbeat(&mut self, now: DateTime<FixedOffset>) -> Result<bool, StoreError> {
        let mut last = self.cached.as_ref().and_then(|r| r.heartbeat_at);
        if last.is_none() {
            last = self.job_record(now)?.heartbeat_at;
        }
        let now = now.with_timezone(&Utc);
        if let Some(last) = last.filter(|last| *last > now) {
            if !self.skew_warned {
                self.skew_warned = true;
                warn!(
                    job = ?self.name,
                    heartbeat = %last,
                    %now,
                    skew_ms = (last - now).num_milliseconds(),
                    "last heartbeat is in the future, clocks may be skewed"
                );
            }
        }
        Ok(heartbeat_age(last, now) > self.settings.interval())
    }

    fn set_status(&mut self, status: JobStatus, now: DateTime<FixedOffset>) -> Result<(), StoreError> {
        let name = self.bound_name(now);
        let record = resolve(&self.store, &mut self.cached, &name)?;
        write_status(&self.store, record, status, now.with_timezone(&Utc))
    }

    fn job_record(&mut self, now: DateTime<FixedOffset>) -> Result<&mut JobRecord, StoreError> {
        let name = self.bound_name(now);
        resolve(&self.store, &mut self.cached, &name)
    }

    fn bound_name(&mut self, now: DateTime<FixedOffset>) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        let generated = format!("{NAMELESS_PREFIX}{}", now.format("%Y%m%d_%H%M%S"));
        info!(job = %generated, "no job name given, using generated name");
        self.name = Some(generated.clone());
        generated
    }
}

/// Return the cached record if the store still recognizes it, otherwise look
/// the job up by name, otherwise start a new unsaved record.
fn resolve<'a, S: JobStore + ?Sized>(
    store: &S,
    cached: &'a mut Option<JobRecord>,
    name: &str,
) -> Result<&'a mut JobRecord, StoreError> {
    if let Some(record) = cached.as_ref() {
        if store.is_detached(record) {
            debug!(job = %name, persisted = record.is_persisted(), "cached record detached, re-resolving");
            *cached = None;
        }
    }

    let record = match cached.take() {
        Some(record) => record,
        None => match store.find_by_name(name)? {
            Some(found) => found,
            None => {
                debug!(job = %name, "no stored record, creating");
                store.create(name)
            }
        },
    };
    Ok(cached.insert(record))
}

/// Set `status`, stamp the heartbeat with `now` and save those two fields.
/// Metadata columns written by someone else in the meantime are kept.
///
/// On failure the record keeps its previous status and heartbeat, so the next
/// heartbeat is not throttled by a write that never happened.
pub fn write_status<S: JobStore + ?Sized>(
    store: &S,
    record: &mut JobRecord,
    status: JobStatus,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let previous = (record.status, record.heartbeat_at);
    record.status = status;
    record.heartbeat_at = Some(now);

    if let Err(e) = store.save_status(record) {
        (record.status, record.heartbeat_at) = previous;
        return Err(e);
    }

    if previous.0 != status {
        info!(job = %record.name, from = %previous.0, to = %status, "job status changed");
    } else {
        debug!(job = %record.name, %status, "heartbeat written");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryJobStore;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    type TestTracker = HeartbeatTracker<Arc<MemoryJobStore>, Arc<ManualClock>>;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 3, 0, 0).unwrap()
    }

    fn setup() -> (Arc<MemoryJobStore>, Arc<ManualClock>, TestTracker) {
        let store = Arc::new(MemoryJobStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let tracker = HeartbeatTracker::with_clock(
            store.clone(),
            clock.clone(),
            HeartbeatSettings::default(),
        );
        (store, clock, tracker)
    }

    fn stored(store: &MemoryJobStore, name: &str) -> JobRecord {
        store.find_by_name(name).unwrap().unwrap()
    }

    #[test]
    fn test_heartbeats_within_interval_write_once() {
        let (store, clock, mut tracker) = setup();
        tracker.initiate(Some("batch"));

        assert!(tracker.heartbeat().unwrap());
        clock.advance(Duration::seconds(10));
        assert!(!tracker.heartbeat().unwrap());

        assert_eq!(store.write_count(), 1);
        assert_eq!(stored(&store, "batch").heartbeat_at, Some(t0()));
    }

    #[test]
    fn test_heartbeats_past_interval_write_twice() {
        let (store, clock, mut tracker) = setup();
        tracker.initiate(Some("batch"));

        assert!(tracker.heartbeat().unwrap());
        assert_eq!(stored(&store, "batch").status, JobStatus::Running);

        clock.advance(Duration::seconds(10) + Duration::milliseconds(1));
        assert!(tracker.heartbeat().unwrap());

        assert_eq!(store.write_count(), 2);
        let record = stored(&store, "batch");
        assert_eq!(record.status, JobStatus::Running);
        assert_eq!(
            record.heartbeat_at,
            Some(t0() + Duration::seconds(10) + Duration::milliseconds(1))
        );
    }

    #[test]
    fn test_crash_then_queries() {
        let (_store, _clock, mut tracker) = setup();
        tracker.initiate(Some("batch"));
        tracker.heartbeat().unwrap();
        tracker.crash().unwrap();

        assert!(!tracker.has_status_running().unwrap());
        assert!(tracker.is_already_running().unwrap());
    }

    #[test]
    fn test_stop_clears_already_running() {
        let (store, clock, mut tracker) = setup();
        tracker.initiate(Some("batch"));
        tracker.heartbeat().unwrap();
        assert!(tracker.is_already_running().unwrap());
        assert!(tracker.has_status_running().unwrap());

        clock.advance(Duration::seconds(1));
        tracker.stop().unwrap();
        assert!(!tracker.is_already_running().unwrap());

        // stop is never throttled
        assert_eq!(store.write_count(), 2);
        assert_eq!(
            stored(&store, "batch").heartbeat_at,
            Some(t0() + Duration::seconds(1))
        );
    }

    #[test]
    fn test_fresh_job_is_not_running() {
        let (store, _clock, mut tracker) = setup();
        tracker.initiate(Some("never-ran"));
        assert!(!tracker.is_already_running().unwrap());
        assert!(!tracker.has_status_running().unwrap());
        // queries never persist a record
        assert_eq!(store.write_count(), 0);
        assert!(store.find_by_name("never-ran").unwrap().is_none());
    }

    #[test]
    fn test_detached_cache_is_re_resolved() {
        let (store, clock, mut tracker) = setup();
        tracker.initiate(Some("batch"));
        tracker.heartbeat().unwrap();

        // the job clears its store session between writes
        store.reset_session();
        assert!(store.is_detached(tracker.record().unwrap()));

        clock.advance(Duration::seconds(3));
        tracker.crash().unwrap();

        assert_eq!(store.count_named("batch"), 1);
        let record = stored(&store, "batch");
        assert_eq!(record.status, JobStatus::Crashed);
        assert_eq!(record.heartbeat_at, Some(t0() + Duration::seconds(3)));
        assert_eq!(record.id, tracker.record().unwrap().id);
    }

    #[test]
    fn test_import_scenario() {
        let (store, clock, mut tracker) = setup();
        tracker.initiate(Some("import-x"));

        assert!(tracker.heartbeat().unwrap());
        let record = stored(&store, "import-x");
        assert_eq!(record.status, JobStatus::Running);
        assert_eq!(record.heartbeat_at, Some(t0()));

        clock.set(t0() + Duration::seconds(5));
        assert!(!tracker.heartbeat().unwrap());
        let record = stored(&store, "import-x");
        assert_eq!(record.status, JobStatus::Running);
        assert_eq!(record.heartbeat_at, Some(t0()));

        clock.set(t0() + Duration::seconds(12));
        assert!(tracker.heartbeat().unwrap());
        assert_eq!(
            stored(&store, "import-x").heartbeat_at,
            Some(t0() + Duration::seconds(12))
        );

        clock.set(t0() + Duration::seconds(20));
        tracker.stop().unwrap();
        let record = stored(&store, "import-x");
        assert_eq!(record.status, JobStatus::Idle);
        assert_eq!(record.heartbeat_at, Some(t0() + Duration::seconds(20)));
        assert_eq!(store.write_count(), 3);
    }

    #[test]
    fn test_nameless_tracker_generates_name() {
        let store = Arc::new(MemoryJobStore::new());
        let offset = FixedOffset::east_opt(2 * 3600).unwrap();
        let clock = ManualClock::with_offset(t0(), offset);
        let mut tracker =
            HeartbeatTracker::with_clock(store.clone(), clock, HeartbeatSettings::default());

        assert!(tracker.heartbeat().unwrap());

        // rendered in the injected timezone, not UTC
        let name = tracker.name().unwrap().to_string();
        assert_eq!(name, "nameless_process_20240601_050000");
        let suffix = name.strip_prefix(NAMELESS_PREFIX).unwrap();
        assert_eq!(suffix.len(), 15);
        assert!(suffix
            .chars()
            .enumerate()
            .all(|(i, c)| if i == 8 { c == '_' } else { c.is_ascii_digit() }));

        assert_eq!(stored(&store, &name).status, JobStatus::Running);
    }

    #[test]
    fn test_initiate_switches_jobs() {
        let (store, _clock, mut tracker) = setup();
        tracker.initiate(Some("first"));
        tracker.heartbeat().unwrap();

        tracker.initiate(Some("second"));
        assert!(tracker.record().is_none());
        assert!(tracker.heartbeat().unwrap());

        assert_eq!(store.count_named("first"), 1);
        assert_eq!(store.count_named("second"), 1);
    }

    #[test]
    fn test_throttle_uses_stored_heartbeat_of_previous_process() {
        let (store, clock, mut first) = setup();
        first.initiate(Some("batch"));
        first.heartbeat().unwrap();

        let mut second =
            HeartbeatTracker::with_clock(store.clone(), clock.clone(), HeartbeatSettings::default());
        second.initiate(Some("batch"));
        clock.advance(Duration::seconds(4));
        assert!(!second.heartbeat().unwrap());

        clock.advance(Duration::seconds(7));
        assert!(second.heartbeat().unwrap());
        assert_eq!(store.count_named("batch"), 1);
    }

    #[test]
    fn test_tracker_is_stale_uses_threshold() {
        let (_store, clock, tracker) = setup();
        let hb = t0();
        clock.advance(Duration::minutes(15));
        assert!(!tracker.is_stale(Some(hb)));
        clock.advance(Duration::seconds(1));
        assert!(tracker.is_stale(Some(hb)));
        assert!(tracker.is_stale(None));
    }

    #[test]
    fn test_heartbeat_keeps_registered_metadata() {
        let (store, clock, mut tracker) = setup();
        tracker.initiate(Some("import-x"));
        assert!(tracker.heartbeat().unwrap());

        crate::registry::register(
            &*store,
            &crate::registry::JobDefinition {
                name: "import-x".to_string(),
                command: Some("bin/import".to_string()),
                schedule: Some("*/5 * * * *".to_string()),
                description: Some("nightly import".to_string()),
                enabled: false,
            },
        )
        .unwrap();

        clock.advance(Duration::seconds(11));
        assert!(tracker.heartbeat().unwrap());
        clock.advance(Duration::seconds(1));
        tracker.stop().unwrap();

        let record = stored(&store, "import-x");
        assert_eq!(record.status, JobStatus::Idle);
        assert_eq!(record.command.as_deref(), Some("bin/import"));
        assert_eq!(record.schedule.as_deref(), Some("*/5 * * * *"));
        assert_eq!(record.description.as_deref(), Some("nightly import"));
        assert!(!record.enabled);
    }

    #[test]
    fn test_future_heartbeat_warns_once_and_still_throttles() {
        let (store, clock, mut tracker) = setup();
        let mut record = store.create("batch");
        record.status = JobStatus::Running;
        record.heartbeat_at = Some(t0() + Duration::seconds(5));
        store.save(&mut record).unwrap();

        tracker.initiate(Some("batch"));
        assert!(!tracker.heartbeat().unwrap());
        assert!(tracker.skew_warned);
        assert!(!tracker.heartbeat().unwrap());

        // 16s is more than the interval away from the future stamp
        clock.advance(Duration::seconds(16));
        assert!(tracker.heartbeat().unwrap());
        assert!(tracker.skew_warned);

        tracker.initiate(Some("batch"));
        assert!(!tracker.skew_warned);
    }

    /// Memory store whose saves can be made to fail.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryJobStore,
        down: AtomicBool,
    }

    impl JobStore for FlakyStore {
        fn find_by_name(&self, name: &str) -> Result<Option<JobRecord>, StoreError> {
            self.inner.find_by_name(name)
        }

        fn save(&self, record: &mut JobRecord) -> Result<(), StoreError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(StoreError::Sqlite(rusqlite::Error::InvalidQuery));
            }
            self.inner.save(record)
        }

        fn save_status(&self, record: &mut JobRecord) -> Result<(), StoreError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(StoreError::Sqlite(rusqlite::Error::InvalidQuery));
            }
            self.inner.save_status(record)
        }

        fn is_detached(&self, record: &JobRecord) -> bool {
            self.inner.is_detached(record)
        }

        fn list(&self) -> Result<Vec<JobRecord>, StoreError> {
            self.inner.list()
        }
    }

    #[test]
    fn test_failed_write_propagates_and_does_not_throttle() {
        let store = FlakyStore::default();
        let clock = ManualClock::new(t0());
        let mut tracker =
            HeartbeatTracker::with_clock(&store, &clock, HeartbeatSettings::default());
        tracker.initiate(Some("batch"));
        tracker.heartbeat().unwrap();

        clock.advance(Duration::seconds(11));
        store.down.store(true, Ordering::SeqCst);
        assert!(tracker.heartbeat().is_err());
        assert!(tracker.crash().is_err());

        // cached copy still reflects what is stored
        let cached = tracker.record().unwrap();
        assert_eq!(cached.status, JobStatus::Running);
        assert_eq!(cached.heartbeat_at, Some(t0()));

        store.down.store(false, Ordering::SeqCst);
        clock.advance(Duration::seconds(1));
        assert!(tracker.heartbeat().unwrap());
        assert_eq!(store.inner.write_count(), 2);
    }
}
