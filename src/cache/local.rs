// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-process entity cache.
//!
//! One instance per schema with `localCache`. Rows are held as shared,
//! already-normalized value vectors so a hit costs one `Arc` clone. The
//! second LRU maps opaque query keys (unique fingerprints, index queries,
//! reference lists, `cacheAll`) to ID lists.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::trace;

use crate::metrics;
use crate::schema::Row;

/// A cached entity slot.
#[derive(Debug, Clone, PartialEq)]
pub enum Cached {
    Row(Arc<Row>),
    /// Known absent: reads must not fall through.
    Tombstone,
}

pub struct LocalCache {
    table: String,
    rows: Mutex<LruCache<u64, Cached>>,
    queries: Mutex<LruCache<String, Arc<Vec<u64>>>>,
}

fn new_lru<K: std::hash::Hash + Eq, V>(limit: usize) -> LruCache<K, V> {
    match NonZeroUsize::new(limit) {
        Some(cap) => LruCache::new(cap),
        None => LruCache::unbounded(),
    }
}

impl LocalCache {
    /// `limit` of 0 means unbounded.
    #[must_use]
    pub fn new(table: impl Into<String>, limit: usize) -> Self {
        Self {
            table: table.into(),
            rows: Mutex::new(new_lru(limit)),
            queries: Mutex::new(new_lru(limit)),
        }
    }

    pub fn get(&self, id: u64) -> Option<Cached> {
        let found = self.rows.lock().get(&id).cloned();
        let outcome = match &found {
            Some(Cached::Row(_)) => "hit",
            Some(Cached::Tombstone) => "tombstone",
            None => "miss",
        };
        trace!(table = %self.table, operation = "get", key = id, hit = found.is_some(), "local cache");
        metrics::record_cache_lookup("local", &self.table, outcome);
        found
    }

    pub fn set(&self, id: u64, value: Cached) {
        trace!(table = %self.table, operation = "set", key = id, tombstone = (value == Cached::Tombstone), "local cache");
        let len = {
            let mut rows = self.rows.lock();
            rows.put(id, value);
            rows.len()
        };
        metrics::set_local_cache_items(&self.table, len);
    }

    pub fn set_row(&self, id: u64, row: Row) {
        self.set(id, Cached::Row(Arc::new(row)));
    }

    pub fn set_tombstone(&self, id: u64) {
        self.set(id, Cached::Tombstone);
    }

    pub fn remove(&self, id: u64) {
        trace!(table = %self.table, operation = "remove", key = id, "local cache");
        self.rows.lock().pop(&id);
    }

    pub fn get_query(&self, key: &str) -> Option<Arc<Vec<u64>>> {
        let found = self.queries.lock().get(key).cloned();
        trace!(table = %self.table, operation = "get_query", key, hit = found.is_some(), "local cache");
        found
    }

    pub fn set_query(&self, key: &str, ids: Vec<u64>) {
        trace!(table = %self.table, operation = "set_query", key, size = ids.len(), "local cache");
        self.queries.lock().put(key.to_string(), Arc::new(ids));
    }

    pub fn remove_query(&self, key: &str) {
        trace!(table = %self.table, operation = "remove_query", key, "local cache");
        self.queries.lock().pop(key);
    }

    pub fn clear(&self) {
        trace!(table = %self.table, operation = "clear", "local cache");
        self.rows.lock().clear();
        self.queries.lock().clear();
        metrics::set_local_cache_items(&self.table, 0);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn test_lru_eviction() {
        let cache = LocalCache::new("t", 2);
        cache.set_row(1, vec![Value::Uint(1)]);
        cache.set_row(2, vec![Value::Uint(2)]);
        assert!(cache.get(1).is_some());
        cache.set_row(3, vec![Value::Uint(3)]);
        // 2 was least recently used
        assert!(cache.get(2).is_none());
        assert!(cache.get(1).is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_zero_limit_is_unbounded() {
        let cache = LocalCache::new("t", 0);
        for id in 0..10_000 {
            cache.set_tombstone(id);
        }
        assert_eq!(cache.len(), 10_000);
        assert_eq!(cache.get(5), Some(Cached::Tombstone));
    }

    #[test]
    fn test_queries() {
        let cache = LocalCache::new("t", 10);
        cache.set_query("abc:all", vec![3, 1, 2]);
        assert_eq!(cache.get_query("abc:all").unwrap().as_slice(), &[3, 1, 2]);
        cache.remove_query("abc:all");
        assert!(cache.get_query("abc:all").is_none());
        cache.set_row(1, vec![]);
        cache.clear();
        assert!(cache.is_empty());
    }
}
