//! Processed-event deduplication
//!
//! One store per project runtime, persisted as a JSON array in insertion
//! order so reload preserves FIFO eviction exactly. The store is
//! single-writer within its runtime, which is what makes the seen/mark
//! pair atomic per event id.

use nostr::prelude::EventId;
use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;

use crate::store::{self, StoreError};

/// Minimum retained history. A relay replaying a large backlog will evict
/// the oldest ids first.
pub const DEDUP_CAPACITY: usize = 10_000;

pub const DEDUP_FILE: &str = "processed-events.json";

pub struct DedupStore {
    path: PathBuf,
    order: VecDeque<String>,
    seen: HashSet<String>,
    capacity: usize,
    dirty: bool,
}

impl DedupStore {
    /// Open the store for a project directory, quarantining a corrupt file.
    pub fn open(project_dir: &std::path::Path) -> Self {
        let path = project_dir.join(DEDUP_FILE);
        let ids: Vec<String> = store::load_json_or_quarantine(&path).unwrap_or_default();

        let mut seen = HashSet::with_capacity(ids.len());
        let mut order = VecDeque::with_capacity(ids.len());
        for id in ids {
            if seen.insert(id.clone()) {
                order.push_back(id);
            }
        }

        Self {
            path,
            order,
            seen,
            capacity: DEDUP_CAPACITY,
            dirty: false,
        }
    }

    #[cfg(test)]
    fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn seen(&self, id: &EventId) -> bool {
        self.seen.contains(&id.to_hex())
    }

    /// Record an id. Idempotent.
    pub fn mark(&mut self, id: &EventId) {
        self.insert(id);
    }

    /// The atomic seen+mark pair: returns `true` exactly once per id.
    pub fn insert(&mut self, id: &EventId) -> bool {
        let hex = id.to_hex();
        if !self.seen.insert(hex.clone()) {
            return false;
        }
        self.order.push_back(hex);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.dirty = true;
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Write the store to disk if anything changed since the last flush.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        if !self.dirty {
            return Ok(());
        }
        let ids: Vec<&String> = self.order.iter().collect();
        store::write_json_atomic(&self.path, &ids)?;
        self.dirty = false;
        Ok(())
    }
}
