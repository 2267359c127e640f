//! Pluggable storage tiers behind the [`Repository`](crate::Repository).
//!
//! [`KeyValueCache`] is the fast, synchronous, in-process tier. [`AsyncKeyValueStore`] is the
//! optional durable tier (e.g., Redis or a file); records are stored as JSON values under
//! `flags/<identifier>` and `segments/<identifier>` keys.
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;

use crate::{FeatureConfig, Result, Segment};

pub(crate) const FLAG_PREFIX: &str = "flags/";
pub(crate) const SEGMENT_PREFIX: &str = "segments/";

/// A value held by the fast cache.
#[derive(Debug, Clone)]
pub enum CacheValue {
    /// Flag definition.
    Flag(Arc<FeatureConfig>),
    /// Segment definition.
    Segment(Arc<Segment>),
}

/// Fast in-process cache. Implementations must be thread-safe and cannot fail.
pub trait KeyValueCache: Send + Sync {
    /// Insert or replace the value under `key`.
    fn set(&self, key: &str, value: CacheValue);
    /// Get the value under `key`.
    fn get(&self, key: &str) -> Option<CacheValue>;
    /// Remove the value under `key`. Removing a missing key is a no-op.
    fn delete(&self, key: &str);
    /// List all keys currently held.
    fn keys(&self) -> Vec<String>;
}

/// Durable store. Values are JSON-serialized flag and segment records.
#[async_trait]
pub trait AsyncKeyValueStore: Send + Sync {
    /// Insert or replace the value under `key`.
    async fn set(&self, key: &str, value: serde_json::Value) -> Result<()>;
    /// Get the value under `key`.
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>>;
    /// Remove the value under `key`.
    async fn delete(&self, key: &str) -> Result<()>;
    /// List all keys currently held.
    async fn keys(&self) -> Result<Vec<String>>;
}

/// Default [`KeyValueCache`]: an unbounded map guarded by a `RwLock`.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: RwLock<HashMap<String, CacheValue>>,
}

impl InMemoryCache {
    /// Create an empty cache.
    pub fn new() -> InMemoryCache {
        InMemoryCache::default()
    }
}

// The lock is only poisoned if a thread panicked while holding it, which never happens as no
// code below can panic under the lock.
impl KeyValueCache for InMemoryCache {
    fn set(&self, key: &str, value: CacheValue) {
        let mut entries = self
            .entries
            .write()
            .expect("thread holding cache lock should not panic");
        entries.insert(key.to_owned(), value);
    }

    fn get(&self, key: &str) -> Option<CacheValue> {
        let entries = self
            .entries
            .read()
            .expect("thread holding cache lock should not panic");
        entries.get(key).cloned()
    }

    fn delete(&self, key: &str) {
        let mut entries = self
            .entries
            .write()
            .expect("thread holding cache lock should not panic");
        entries.remove(key);
    }

    fn keys(&self) -> Vec<String> {
        let entries = self
            .entries
            .read()
            .expect("thread holding cache lock should not panic");
        entries.keys().cloned().collect()
    }
}

/// [`AsyncKeyValueStore`] backed by memory. Useful in tests and for embedders that want the
/// write-through code path without external infrastructure.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: RwLock<HashMap<String, serde_json::Value>>,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> InMemoryStore {
        InMemoryStore::default()
    }
}

#[async_trait]
impl AsyncKeyValueStore for InMemoryStore {
    async fn set(&self, key: &str, value: serde_json::Value) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .expect("thread holding store lock should not panic");
        entries.insert(key.to_owned(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let entries = self
            .entries
            .read()
            .expect("thread holding store lock should not panic");
        Ok(entries.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .expect("thread holding store lock should not panic");
        entries.remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let entries = self
            .entries
            .read()
            .expect("thread holding store lock should not panic");
        Ok(entries.keys().cloned().collect())
    }
}

pub(crate) fn flag_key(identifier: &str) -> String {
    format!("{FLAG_PREFIX}{identifier}")
}

pub(crate) fn segment_key(identifier: &str) -> String {
    format!("{SEGMENT_PREFIX}{identifier}")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{
        flag_key, segment_key, AsyncKeyValueStore, CacheValue, InMemoryCache, InMemoryStore,
        KeyValueCache,
    };
    use crate::Segment;

    fn segment(identifier: &str) -> Segment {
        Segment {
            identifier: identifier.to_owned(),
            name: identifier.to_owned(),
            included: vec![],
            excluded: vec![],
            rules: vec![],
            version: 1,
        }
    }

    #[test]
    fn keys_are_namespaced() {
        assert_eq!(flag_key("a"), "flags/a");
        assert_eq!(segment_key("a"), "segments/a");
    }

    #[test]
    fn cache_set_get_delete() {
        let cache = InMemoryCache::new();
        cache.set("segments/a", CacheValue::Segment(Arc::new(segment("a"))));

        assert!(matches!(cache.get("segments/a"), Some(CacheValue::Segment(s)) if s.identifier == "a"));
        assert_eq!(cache.keys(), vec!["segments/a".to_owned()]);

        cache.delete("segments/a");
        cache.delete("segments/missing");
        assert!(cache.get("segments/a").is_none());
        assert!(cache.keys().is_empty());
    }

    #[test]
    fn can_set_from_another_thread() {
        let cache = Arc::new(InMemoryCache::new());
        {
            let cache = cache.clone();
            let _ = std::thread::spawn(move || {
                cache.set("segments/a", CacheValue::Segment(Arc::new(segment("a"))));
            })
            .join();
        }
        assert!(cache.get("segments/a").is_some());
    }

    #[tokio::test]
    async fn store_roundtrip() {
        let store = InMemoryStore::new();
        store
            .set("flags/x", serde_json::json!({"version": 1}))
            .await
            .unwrap();
        assert_eq!(
            store.get("flags/x").await.unwrap(),
            Some(serde_json::json!({"version": 1}))
        );
        assert_eq!(store.keys().await.unwrap(), vec!["flags/x".to_owned()]);
        store.delete("flags/x").await.unwrap();
        assert_eq!(store.get("flags/x").await.unwrap(), None);
    }
}
