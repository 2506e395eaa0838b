//! Per-entity lock registry.
//!
//! Writes to a given heartbeat or case are serialized through the slot for
//! that entity's id; unrelated entities never contend. A slot lives only as
//! long as someone holds or waits on it.

use dashmap::DashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Registry of one mutex per key, created on first use.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    slots: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the lock for `key`.
    ///
    /// The slots guard `()`, so a panic in another holder leaves nothing
    /// inconsistent behind and poisoning is ignored.
    pub fn with_lock<R>(&self, key: &str, f: impl FnOnce() -> R) -> R {
        // The map shard guard must be gone before blocking on the slot
        let slot = self
            .slots
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let result = {
            let _guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
            f()
        };

        drop(slot);
        self.slots
            .remove_if(key, |_, slot| Arc::strong_count(slot) == 1);
        result
    }

    /// Number of live slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
