//! Bounded, time-expiring key/value store.
//!
//! Used for discovered schema metadata and for per-query execution
//! statistics. Eviction is least-recently-used at capacity; entries older
//! than the TTL are never returned.

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

struct Inner<V> {
    entries: LruCache<String, Entry<V>>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_ratio: f64,
}

pub struct IntelligentCache<V> {
    inner: Mutex<Inner<V>>,
    capacity: NonZeroUsize,
    ttl: Duration,
}

impl<V: Clone> IntelligentCache<V> {
    /// A zero capacity is treated as one.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(capacity),
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
            capacity,
            ttl,
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        match inner.entries.get(key) {
            None => {
                inner.misses += 1;
                return None;
            }
            Some(entry) if entry.inserted_at.elapsed() <= self.ttl => {
                let value = entry.value.clone();
                inner.hits += 1;
                return Some(value);
            }
            Some(_) => {}
        }

        inner.entries.pop(key);
        inner.evictions += 1;
        inner.misses += 1;
        debug!(target: "cache", key, "Entry expired");
        None
    }

    pub fn set(&self, key: impl Into<String>, value: V) {
        let key = key.into();
        let mut inner = self.inner.lock();
        if !inner.entries.contains(&key) && inner.entries.len() >= self.capacity.get() {
            if let Some((evicted, _)) = inner.entries.pop_lru() {
                inner.evictions += 1;
                debug!(target: "cache", key = %evicted, "Evicted least recently used entry");
            }
        }
        inner.entries.put(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Remove keys containing `pattern`, or everything when `None`.
    /// Returns the number of removed entries.
    pub fn invalidate(&self, pattern: Option<&str>) -> usize {
        let mut inner = self.inner.lock();
        let removed = match pattern {
            None => {
                let n = inner.entries.len();
                inner.entries.clear();
                n
            }
            Some(pattern) => {
                let keys: Vec<String> = inner
                    .entries
                    .iter()
                    .filter(|(k, _)| k.contains(pattern))
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in &keys {
                    inner.entries.pop(key);
                }
                keys.len()
            }
        };
        debug!(target: "cache", ?pattern, removed, "Invalidated entries");
        removed
    }

    pub fn remove(&self, key: &str) -> bool {
        self.inner.lock().entries.pop(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        let lookups = inner.hits + inner.misses;
        CacheStats {
            size: inner.entries.len(),
            capacity: self.capacity.get(),
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            hit_ratio: if lookups == 0 {
                0.0
            } else {
                inner.hits as f64 / lookups as f64
            },
        }
    }
}
