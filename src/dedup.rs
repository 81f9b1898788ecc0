//! Bounded dedup cache for world events.
//!
//! Pages of the `world_event` collection overlap at their boundary timestamp,
//! so the same capture can arrive twice. [`DedupCache`] remembers the most
//! recently seen fingerprints and evicts the least recently used ones once
//! full. Deduplication is therefore only guaranteed within the cache's
//! window: a fingerprint evicted under sustained load can be accepted again.

use crate::event::EventFingerprint;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

/// Default number of fingerprints retained
pub const DEFAULT_DEDUP_CAPACITY: usize = 2048;

/// Thread-safe, fixed-capacity set of recently seen fingerprints.
pub struct DedupCache {
    seen: Mutex<LruCache<EventFingerprint, ()>>,
}

impl DedupCache {
    /// Create a cache holding up to `capacity` fingerprints (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            seen: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Whether `key` is currently retained. Refreshes its recency.
    pub fn contains(&self, key: &EventFingerprint) -> bool {
        self.seen.lock().get(key).is_some()
    }

    /// Remember `key`, evicting the least recently used entry when full.
    pub fn insert(&self, key: EventFingerprint) {
        self.seen.lock().put(key, ());
    }

    /// Atomically check and remember `key`.
    ///
    /// Returns `true` when the key was not present (the caller saw it first).
    pub fn insert_if_absent(&self, key: EventFingerprint) -> bool {
        let mut seen = self.seen.lock();
        if seen.get(&key).is_some() {
            false
        } else {
            seen.put(key, ());
            true
        }
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.seen.lock().cap().get()
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY)
    }
}
