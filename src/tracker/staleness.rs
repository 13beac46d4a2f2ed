//! Heartbeat age and crash inference.
//!
//! These are plain functions so a monitor can judge a record without building
//! a tracker.

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

/// How old a heartbeat is. A missing heartbeat is infinitely old.
///
/// The age is the absolute distance to `now`, so a heartbeat stamped in the
/// future ages the same way as one in the past.
pub fn heartbeat_age(heartbeat: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Duration {
    let Some(heartbeat) = heartbeat else {
        return Duration::MAX;
    };
    let delta = now - heartbeat;
    if delta < Duration::zero() {
        debug!(
            %heartbeat,
            %now,
            skew_ms = delta.num_milliseconds().abs(),
            "heartbeat is in the future, clocks may be skewed"
        );
    }
    delta.abs()
}

/// True when the heartbeat is older than `crash_threshold_minutes`.
pub fn is_stale(
    heartbeat: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    crash_threshold_minutes: u32,
) -> bool {
    heartbeat_age(heartbeat, now) > Duration::minutes(i64::from(crash_threshold_minutes))
}
