//! In-memory path-info cache and per-store statistics.

use keg_core::ValidPathInfo;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// One cached lookup result. `info: None` is the distinguished
/// "does not exist" value (negative caching).
#[derive(Clone)]
pub struct CacheEntry {
    pub time_point: Instant,
    pub info: Option<Arc<ValidPathInfo>>,
}

impl CacheEntry {
    pub fn present(info: Arc<ValidPathInfo>) -> Self {
        Self { time_point: Instant::now(), info: Some(info) }
    }

    pub fn missing() -> Self {
        Self { time_point: Instant::now(), info: None }
    }

    pub fn did_exist(&self) -> bool {
        self.info.is_some()
    }

    /// Whether the entry is still fresh under the applicable TTL.
    pub fn is_known_now(&self, positive_ttl: Duration, negative_ttl: Duration) -> bool {
        let ttl = if self.did_exist() { positive_ttl } else { negative_ttl };
        Instant::now() < self.time_point + ttl
    }
}

/// Lookup counters, mirrored into tracing output by callers.
#[derive(Debug, Default)]
pub struct StoreStats {
    /// Uncached path-info fetches.
    pub path_info_read: AtomicU64,
    /// Lookups answered from a cache layer.
    pub path_info_read_averted: AtomicU64,
    /// Lookups that established the path does not exist.
    pub path_info_missing: AtomicU64,
}

impl StoreStats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// The hot cache: a mutex-guarded LRU keyed by hash part. Critical sections
/// are a map lookup or insert.
pub struct PathInfoCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
    positive_ttl: Duration,
    negative_ttl: Duration,
}

impl PathInfoCache {
    pub fn new(capacity: usize, positive_ttl: Duration, negative_ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least one");
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            positive_ttl,
            negative_ttl,
        }
    }

    /// Fresh entry for a hash part, or `None` when unknown or expired.
    pub fn get(&self, hash_part: &str) -> Option<CacheEntry> {
        let mut entries = self.entries.lock().expect("path info cache poisoned");
        let entry = entries.get(hash_part)?.clone();
        if entry.is_known_now(self.positive_ttl, self.negative_ttl) {
            Some(entry)
        } else {
            entries.pop(hash_part);
            None
        }
    }

    pub fn insert_present(&self, hash_part: &str, info: Arc<ValidPathInfo>) {
        self.entries
            .lock()
            .expect("path info cache poisoned")
            .put(hash_part.to_string(), CacheEntry::present(info));
    }

    pub fn insert_missing(&self, hash_part: &str) {
        self.entries
            .lock()
            .expect("path info cache poisoned")
            .put(hash_part.to_string(), CacheEntry::missing());
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("path info cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
