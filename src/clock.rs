//! Wall clock with an explicitly configured timezone.
//!
//! Nothing in the crate reads the process-wide timezone; the offset used for
//! display and for generated job names is handed in at construction.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, FixedOffset, Offset, Utc};

/// Source of "now". Read once per tracker operation.
pub trait Clock {
    fn now(&self) -> DateTime<FixedOffset>;
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> DateTime<FixedOffset> {
        (**self).now()
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> DateTime<FixedOffset> {
        (**self).now()
    }
}

/// System time, rendered in a fixed UTC offset.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    offset: FixedOffset,
}

impl SystemClock {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    /// Build from an offset in minutes east of UTC. Out-of-range values fall
    /// back to UTC.
    pub fn from_offset_minutes(minutes: i32) -> Self {
        let offset = minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .unwrap_or_else(utc);
        if offset.local_minus_utc() != minutes.saturating_mul(60) {
            tracing::warn!(minutes, "utc offset out of range, using UTC");
        }
        Self { offset }
    }

    pub fn utc() -> Self {
        Self { offset: utc() }
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::utc()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<FixedOffset> {
        Utc::now().with_timezone(&self.offset)
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<FixedOffset>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self::with_offset(start, utc())
    }

    pub fn with_offset(start: DateTime<Utc>, offset: FixedOffset) -> Self {
        Self {
            now: Mutex::new(start.with_timezone(&offset)),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        let offset = *now.offset();
        *now = at.with_timezone(&offset);
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<FixedOffset> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn utc() -> FixedOffset {
    Utc.fix()
}
