//! Bounded LRU cache with per-entry TTL.
//!
//! Thin wrapper over `quick_cache` that stamps each value with its insertion
//! time and treats entries past the TTL as absent. Hit/miss counters feed the
//! substrate stats and the analytics cache-hit rate.

use std::sync::atomic::{AtomicU64, Ordering};

use quick_cache::sync::Cache;

/// LRU + TTL cache keyed by `String`.
pub struct LruTtlCache<V: Clone> {
    cache: Cache<String, (i64, V)>,
    ttl_ms: i64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V: Clone> LruTtlCache<V> {
    /// Creates a cache bounded at `capacity` entries with the given TTL.
    /// A non-positive TTL disables age-based expiry.
    #[must_use]
    pub fn new(capacity: usize, ttl_ms: i64) -> Self {
        Self {
            cache: Cache::new(capacity.max(1)),
            ttl_ms,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Looks up `key`, treating entries older than the TTL as absent.
    pub fn get(&self, key: &str, now: i64) -> Option<V> {
        match self.cache.get(key) {
            Some((inserted_at, value)) => {
                if self.ttl_ms > 0 && now - inserted_at >= self.ttl_ms {
                    self.cache.remove(key);
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    None
                } else {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    Some(value)
                }
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Inserts or replaces `key`, stamping it with `now`.
    pub fn insert(&self, key: String, value: V, now: i64) {
        self.cache.insert(key, (now, value));
    }

    /// Removes one key.
    pub fn invalidate(&self, key: &str) {
        self.cache.remove(key);
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.cache.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Hit rate in `[0, 1]`; 1.0 when the cache has never been read.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits();
        let total = hits + self.misses();
        if total == 0 {
            1.0
        } else {
            hits as f64 / total as f64
        }
    }
}
