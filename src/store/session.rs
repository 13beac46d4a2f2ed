//! Tracking of which record copies a store currently considers live.

use std::collections::HashSet;

use crate::job::JobRecord;

/// Identity set for one store session. Resetting bumps the generation, which
/// detaches every copy stamped with an older one.
#[derive(Debug, Default)]
pub struct Session {
    generation: u64,
    attached: HashSet<i64>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamp a persisted record as live in this session.
    pub fn attach(&mut self, record: &mut JobRecord) {
        if let Some(id) = record.id {
            self.attached.insert(id);
            record.session = Some(self.generation);
        }
    }

    pub fn is_attached(&self, record: &JobRecord) -> bool {
        match (record.id, record.session) {
            (Some(id), Some(generation)) => {
                generation == self.generation && self.attached.contains(&id)
            }
            _ => false,
        }
    }

    /// Forget every attached record.
    pub fn reset(&mut self) {
        self.generation += 1;
        self.attached.clear();
    }

    pub fn len(&self) -> usize {
        self.attached.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attached.is_empty()
    }
}
