//! Bounded in-memory result cache.
//!
//! Eviction is by insertion order, in batches: when an insert pushes the map
//! over capacity, the oldest-inserted `eviction_batch` entries (at least the
//! overflow) are dropped in one go. Reads do not refresh an entry's position,
//! so this is deliberately not an LRU.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::executor::QueryResult;

/// Hit/miss counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<String, Arc<QueryResult>>,
    order: VecDeque<String>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

#[derive(Debug)]
pub struct ResultCache {
    capacity: usize,
    eviction_batch: usize,
    inner: Mutex<CacheInner>,
}

impl ResultCache {
    pub fn new(capacity: usize, eviction_batch: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            eviction_batch: eviction_batch.max(1),
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<QueryResult>> {
        let mut inner = self.inner.lock();
        match inner.entries.get(key).cloned() {
            Some(value) => {
                inner.hits += 1;
                Some(value)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Store `value` under `key`. Replacing an existing key keeps its
    /// original insertion position.
    pub fn insert(&self, key: impl Into<String>, value: Arc<QueryResult>) {
        let key = key.into();
        let mut inner = self.inner.lock();

        if inner.entries.insert(key.clone(), value).is_some() {
            return;
        }
        inner.order.push_back(key);

        if inner.entries.len() > self.capacity {
            let overflow = inner.entries.len() - self.capacity;
            // Never evict the entry that was just inserted.
            let count = overflow
                .max(self.eviction_batch)
                .min(inner.entries.len() - 1);
            for _ in 0..count {
                if let Some(oldest) = inner.order.pop_front() {
                    inner.entries.remove(&oldest);
                    inner.evictions += 1;
                }
            }
            tracing::debug!(evicted = count, remaining = inner.entries.len(), "Result cache evicted oldest entries");
        }
    }

    pub fn invalidate(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();
        if inner.entries.remove(key).is_some() {
            inner.order.retain(|k| k != key);
            true
        } else {
            false
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.entries.len(),
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
        }
    }
}
