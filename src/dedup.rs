//! Transaction ID deduplication.
//!
//! A plain `HashSet` behind one lock. Entries are never evicted, so the store
//! grows with every distinct transaction for the lifetime of the process.

use parking_lot::Mutex;
use std::collections::HashSet;

#[derive(Default)]
pub struct TransactionDedupStore {
    seen: Mutex<HashSet<String>>,
}

impl TransactionDedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.lock().contains(id)
    }

    /// Returns true if the ID was not seen before.
    pub fn mark_seen(&self, id: &str) -> bool {
        self.seen.lock().insert(id.to_string())
    }

    /// Check and insert under a single lock acquisition.
    /// Returns true if the ID was already seen.
    ///
    /// Two read loops racing on the same ID cannot both observe it as new.
    pub fn check_and_mark(&self, id: &str) -> bool {
        let mut seen = self.seen.lock();
        if seen.contains(id) {
            return true;
        }
        seen.insert(id.to_string());
        false
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
