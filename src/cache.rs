//! Retention cache for task payloads
//!
//! A keyed store of shared payload buffers with two ways out: bounded partial
//! eviction through [`RetentionCache::maybe_purge`], and none at all for
//! payloads handed to [`RetentionCache::retain_forever`]. One mutex covers the
//! store and the retention list.

use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// Entries removed by a single purge
const PURGE_BATCH: usize = 3;

/// Payload shared between a task and the cache
pub type SharedBuffer = Arc<Vec<u8>>;

/// Cache occupancy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub stored: usize,
    pub retained: usize,
    pub retained_bytes: usize,
    pub purged: u64,
}

struct CacheInner {
    store: LruCache<String, SharedBuffer>,
    retained: Vec<SharedBuffer>,
    purged: u64,
}

/// Thread-safe payload cache with a permanent retention list
pub struct RetentionCache {
    inner: Mutex<CacheInner>,
}

impl Default for RetentionCache {
    fn default() -> Self {
        Self::new()
    }
}

impl RetentionCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                store: LruCache::unbounded(),
                retained: Vec::new(),
                purged: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or overwrite `key`
    ///
    /// An overwritten payload is dropped by the cache; other holders keep it
    /// alive. Overwriting counts as a fresh insertion for eviction order.
    pub fn put(&self, key: impl Into<String>, payload: SharedBuffer) {
        let key = key.into();
        let replaced = self.lock().store.put(key, payload);
        if let Some(old) = replaced {
            debug!(holders = Arc::strong_count(&old), "Cache entry overwritten");
        }
    }

    /// Evict up to three of the oldest entries; returns how many were removed
    ///
    /// Never touches the retention list.
    pub fn maybe_purge(&self) -> usize {
        let mut inner = self.lock();
        let mut removed = 0;
        while removed < PURGE_BATCH && inner.store.pop_lru().is_some() {
            removed += 1;
        }
        inner.purged += removed as u64;
        removed
    }

    /// Keep `payload` for the rest of the process
    pub fn retain_forever(&self, payload: SharedBuffer) {
        self.lock().retained.push(payload);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().store.contains(key)
    }

    pub fn get(&self, key: &str) -> Option<SharedBuffer> {
        self.lock().store.peek(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            stored: inner.store.len(),
            retained: inner.retained.len(),
            retained_bytes: inner.retained.iter().map(|p| p.len()).sum(),
            purged: inner.purged,
        }
    }
}

impl Drop for RetentionCache {
    fn drop(&mut self) {
        // Report only; retained entries are deliberately left as they are
        let stats = self.stats();
        info!(
            stored = stats.stored,
            retained = stats.retained,
            "Retention cache teardown"
        );
    }
}
