//! Stale-heartbeat sweep.
//!
//! Runs in a process of its own. Any job that is not idle and whose last
//! heartbeat is older than the crash threshold is marked crashed, through the
//! same status write the tracker uses.

use std::time::Duration as StdDuration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::job::JobStatus;
use crate::store::{JobStore, StoreError};
use crate::tracker::{is_stale, write_status};

/// Outcome of one sweep.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct SweepReport {
    /// Records inspected.
    pub checked: usize,
    /// Non-idle jobs with a stale heartbeat, including ones already crashed.
    pub stale: Vec<String>,
    /// Jobs this sweep moved to `crashed`.
    pub marked_crashed: Vec<String>,
}

pub struct Monitor<S, C = SystemClock> {
    store: S,
    clock: C,
    crash_threshold_minutes: u32,
}

impl<S: JobStore, C: Clock> Monitor<S, C> {
    pub fn new(store: S, clock: C, crash_threshold_minutes: u32) -> Self {
        Self {
            store,
            clock,
            crash_threshold_minutes,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Inspect every job once.
    ///
    /// Jobs already marked crashed are reported but not rewritten, so their
    /// heartbeat keeps pointing at the last sign of life.
    ///
    /// A failed write is logged and the sweep moves on to the next job; the
    /// first such error is returned once every job has been inspected.
    pub fn sweep(&self) -> Result<SweepReport, StoreError> {
        let now = self.clock.now().with_timezone(&Utc);
        let mut records = self.store.list()?;
        let mut report = SweepReport {
            checked: records.len(),
            ..Default::default()
        };
        let mut first_error: Option<StoreError> = None;

        for record in &mut records {
            if record.status == JobStatus::Idle {
                continue;
            }
            if !is_stale(record.heartbeat_at, now, self.crash_threshold_minutes) {
                continue;
            }
            report.stale.push(record.name.clone());

            if record.status == JobStatus::Crashed {
                debug!(job = %record.name, "stale job already marked crashed");
                continue;
            }

            warn!(
                job = %record.name,
                last_heartbeat = ?record.heartbeat_at,
                threshold_minutes = self.crash_threshold_minutes,
                "heartbeat is stale, marking job crashed"
            );
            match write_status(&self.store, record, JobStatus::Crashed, now) {
                Ok(()) => report.marked_crashed.push(record.name.clone()),
                Err(e) => {
                    error!(job = %record.name, error = %e, "failed to mark job crashed");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => {
                warn!(marked = ?report.marked_crashed, "sweep finished with failed writes");
                Err(e)
            }
            None => Ok(report),
        }
    }
}

/// Sweep every `poll` until Ctrl-C.
pub async fn run_monitor_loop<S: JobStore, C: Clock>(monitor: Monitor<S, C>, poll: StdDuration) {
    info!(poll_secs = poll.as_secs(), "Monitor started");

    let mut interval = tokio::time::interval(poll);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match monitor.sweep() {
                    Ok(report) => {
                        if !report.marked_crashed.is_empty() {
                            info!(crashed = ?report.marked_crashed, "Sweep marked jobs crashed");
                        }
                        debug!(checked = report.checked, stale = report.stale.len(), "Sweep finished");
                    }
                    Err(e) => error!("Sweep failed: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Monitor stopping");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::job::JobRecord;
    use crate::store::MemoryJobStore;
    use crate::tracker::{HeartbeatSettings, HeartbeatTracker};
    use chrono::{DateTime, Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 3, 0, 0).unwrap()
    }

    fn report_job(store: &MemoryJobStore, clock: &ManualClock, name: &str, status: JobStatus) {
        let mut tracker = HeartbeatTracker::with_clock(store, clock, HeartbeatSettings::default());
        tracker.initiate(Some(name));
        match status {
            JobStatus::Idle => tracker.stop().unwrap(),
            JobStatus::Running => {
                tracker.heartbeat().unwrap();
            }
            JobStatus::Crashed => tracker.crash().unwrap(),
        }
    }

    #[test]
    fn test_sweep_marks_only_stale_running_jobs() {
        let store = MemoryJobStore::new();
        let clock = ManualClock::new(t0());
        report_job(&store, &clock, "old-running", JobStatus::Running);
        report_job(&store, &clock, "old-idle", JobStatus::Idle);
        report_job(&store, &clock, "old-crashed", JobStatus::Crashed);

        clock.advance(Duration::minutes(10));
        report_job(&store, &clock, "fresh-running", JobStatus::Running);

        clock.advance(Duration::minutes(6));
        let monitor = Monitor::new(&store, &clock, 15);
        let report = monitor.sweep().unwrap();

        assert_eq!(report.checked, 4);
        assert_eq!(report.stale, vec!["old-crashed", "old-running"]);
        assert_eq!(report.marked_crashed, vec!["old-running"]);

        let marked = store.find_by_name("old-running").unwrap().unwrap();
        assert_eq!(marked.status, JobStatus::Crashed);
        assert_eq!(marked.heartbeat_at, Some(t0() + Duration::minutes(16)));

        let untouched = store.find_by_name("old-crashed").unwrap().unwrap();
        assert_eq!(untouched.heartbeat_at, Some(t0()));
        let fresh = store.find_by_name("fresh-running").unwrap().unwrap();
        assert_eq!(fresh.status, JobStatus::Running);
    }

    #[test]
    fn test_running_job_without_heartbeat_is_stale() {
        let store = MemoryJobStore::new();
        let mut record = store.create("odd");
        record.status = JobStatus::Running;
        store.save(&mut record).unwrap();

        let clock = ManualClock::new(t0());
        let report = Monitor::new(&store, &clock, 15).sweep().unwrap();
        assert_eq!(report.marked_crashed, vec!["odd"]);
    }

    #[test]
    fn test_sweep_on_empty_store() {
        let store = MemoryJobStore::new();
        let clock = ManualClock::new(t0());
        let report = Monitor::new(&store, &clock, 15).sweep().unwrap();
        assert_eq!(report, SweepReport::default());
    }

    /// Memory store that refuses status writes for one job name.
    struct RefusingStore {
        inner: MemoryJobStore,
        refuse: &'static str,
    }

    impl JobStore for RefusingStore {
        fn find_by_name(&self, name: &str) -> Result<Option<JobRecord>, StoreError> {
            self.inner.find_by_name(name)
        }

        fn save(&self, record: &mut JobRecord) -> Result<(), StoreError> {
            self.inner.save(record)
        }

        fn save_status(&self, record: &mut JobRecord) -> Result<(), StoreError> {
            if record.name == self.refuse {
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
    fn test_failed_write_does_not_stop_the_sweep() {
        let store = RefusingStore {
            inner: MemoryJobStore::new(),
            refuse: "a-job",
        };
        let clock = ManualClock::new(t0());
        report_job(&store.inner, &clock, "a-job", JobStatus::Running);
        report_job(&store.inner, &clock, "b-job", JobStatus::Running);

        clock.advance(Duration::minutes(16));
        let err = Monitor::new(&store, &clock, 15).sweep().unwrap_err();
        assert!(matches!(err, StoreError::Sqlite(_)));

        let failed = store.find_by_name("a-job").unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Running);
        let marked = store.find_by_name("b-job").unwrap().unwrap();
        assert_eq!(marked.status, JobStatus::Crashed);
    }

    #[test]
    fn test_tracker_keeps_working_after_monitor_write() {
        let store = MemoryJobStore::new();
        let clock = ManualClock::new(t0());
        let mut tracker = HeartbeatTracker::with_clock(&store, &clock, HeartbeatSettings::default());
        tracker.initiate(Some("slow"));
        tracker.heartbeat().unwrap();

        clock.advance(Duration::minutes(20));
        Monitor::new(&store, &clock, 15).sweep().unwrap();

        // the job wakes up and reports again
        clock.advance(Duration::seconds(30));
        assert!(tracker.heartbeat().unwrap());
        let record = store.find_by_name("slow").unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Running);
        assert_eq!(store.count_named("slow"), 1);
    }
}
