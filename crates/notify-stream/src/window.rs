//! Bounded in-memory window of streamed notifications.
//!
//! Streamed records are kept newest-first. Once the window is full the oldest
//! records are evicted and reported back to the caller, which uses the "full"
//! signal to schedule a history refresh: by then those records are expected to
//! be in the persisted store.

use std::collections::{HashSet, VecDeque};

use crate::record::{NotificationRecord, RecordKey};

/// Default number of streamed records kept in memory.
pub const DEFAULT_WINDOW_CAPACITY: usize = 50;

/// Result of pushing a streamed record into the window.
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    /// A record with the same key is already held; nothing changed.
    Duplicate,
    /// The record was prepended.
    Inserted {
        /// Records dropped from the tail to make room, oldest last.
        evicted: Vec<NotificationRecord>,
        /// Whether the window is at capacity after the insert.
        full: bool,
    },
}

#[derive(Debug, Clone)]
pub struct StreamWindow {
    capacity: usize,
    records: VecDeque<NotificationRecord>,
    keys: HashSet<RecordKey>,
}

impl Default for StreamWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_CAPACITY)
    }
}

impl StreamWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            records: VecDeque::with_capacity(capacity),
            keys: HashSet::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.records.len() >= self.capacity
    }

    /// Prepend a record unless one with the same key is already held.
    pub fn push(&mut self, record: NotificationRecord) -> PushOutcome {
        let key = record.key();
        if self.keys.contains(&key) {
            return PushOutcome::Duplicate;
        }

        self.keys.insert(key);
        self.records.push_front(record);

        let mut evicted = Vec::new();
        while self.records.len() > self.capacity {
            if let Some(oldest) = self.records.pop_back() {
                self.keys.remove(&oldest.key());
                evicted.push(oldest);
            }
        }

        PushOutcome::Inserted {
            evicted,
            full: self.is_full(),
        }
    }

    /// Flip the read flag of the record with this id. Returns whether it changed.
    pub fn mark_read(&mut self, id: i64) -> bool {
        let mut changed = false;
        for record in self.records.iter_mut().filter(|r| r.id == Some(id)) {
            changed |= !record.is_read;
            record.is_read = true;
        }
        changed
    }

    pub fn mark_all_read(&mut self) {
        for record in &mut self.records {
            record.is_read = true;
        }
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.keys.clear();
    }

    /// Records newest-first.
    pub fn iter(&self) -> impl Iterator<Item = &NotificationRecord> {
        self.records.iter()
    }
}
