//! Fixed-size open-addressed identity cache.
//!
//! Maps a 64-bit packet-derived table identity to the in-memory table
//! currently materialized for it. Collisions resolve by linear probing
//! with wraparound; every operation probes at most `capacity` slots
//! before concluding absence. The table never grows — callers size it
//! for the expected identity cardinality up front, and a full table
//! reports failure instead of evicting.
//!
//! All operations run through an explicit [`CacheGuard`] so that
//! read-decide-write sequences (look up cached version, decide, mutate)
//! are atomic across threads handling the same identity.

use std::sync::Arc;

use log::debug;
use parking_lot::{Mutex, MutexGuard};

struct Slot<T> {
    key: u64,
    value: Arc<T>,
}

/// Open-addressed hash table keyed by table identity.
pub struct TableCache<T> {
    slots: Mutex<Vec<Option<Slot<T>>>>,
    capacity: usize,
}

impl<T> TableCache<T> {
    /// Allocate a cache with a fixed number of slots.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "cache capacity must be nonzero");
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        TableCache {
            slots: Mutex::new(slots),
            capacity,
        }
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Acquire the cache lock. Multi-step sequences against one identity
    /// must hold the guard across the whole read-decide-write window.
    pub fn lock(&self) -> CacheGuard<'_, T> {
        CacheGuard {
            slots: self.slots.lock(),
            capacity: self.capacity,
        }
    }
}

/// Exclusive view over the slot array.
pub struct CacheGuard<'a, T> {
    slots: MutexGuard<'a, Vec<Option<Slot<T>>>>,
    capacity: usize,
}

impl<T> CacheGuard<'_, T> {
    /// Number of slots in the underlying table.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn start_index(&self, key: u64) -> usize {
        (key % self.capacity as u64) as usize
    }

    /// Look up the table bound to `key`.
    pub fn get(&self, key: u64) -> Option<Arc<T>> {
        let mut index = self.start_index(key);
        for _ in 0..self.capacity {
            match &self.slots[index] {
                None => return None,
                Some(slot) if slot.key == key => return Some(slot.value.clone()),
                Some(_) => index = (index + 1) % self.capacity,
            }
        }
        None
    }

    /// Bind `key` to `value`. An existing binding for the same key is
    /// overwritten (last-writer-wins); callers dispose of a displaced
    /// value first if they need it. Returns false when the table is
    /// full.
    pub fn add(&mut self, key: u64, value: Arc<T>) -> bool {
        let mut index = self.start_index(key);
        for _ in 0..self.capacity {
            match &self.slots[index] {
                None => {
                    self.slots[index] = Some(Slot { key, value });
                    return true;
                }
                Some(slot) if slot.key == key => {
                    debug!("overwriting previous contents (key={:#x})", key);
                    self.slots[index] = Some(Slot { key, value });
                    return true;
                }
                Some(_) => index = (index + 1) % self.capacity,
            }
        }
        false
    }

    /// Remove the binding for `key`. Returns true once the key is
    /// absent; false only when the probe exhausted a full table without
    /// finding it.
    pub fn del(&mut self, key: u64) -> bool {
        let mut index = self.start_index(key);
        for _ in 0..self.capacity {
            match &self.slots[index] {
                None => return true,
                Some(slot) if slot.key == key => {
                    self.slots[index] = None;
                    return true;
                }
                Some(_) => index = (index + 1) % self.capacity,
            }
        }
        false
    }

    /// Detach every entry without disposing of the values. Used during
    /// teardown races where the subtrees are owned elsewhere.
    pub fn invalidate(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
