//! Versioned store of flag and segment definitions. The [`Repository`] is the single source of
//! truth for evaluation: the poller and the streamer write into it, the evaluator only reads.
//!
//! Writes are last-writer-wins *by version*: an update is applied only if its version is strictly
//! greater than the stored one. The version check and the write happen under a per-key lock, so a
//! stale bulk refresh cannot overwrite a newer single-entity update that raced it.
use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex},
};

use serde::{de::DeserializeOwned, Serialize};

use crate::{
    cache::{
        flag_key, segment_key, AsyncKeyValueStore, CacheValue, KeyValueCache, FLAG_PREFIX,
        SEGMENT_PREFIX,
    },
    event_bus::{EventBus, SdkEvent},
    FeatureConfig, Result, Segment,
};

/// Record kinds held by the repository.
trait Entry: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn key(identifier: &str) -> String;
    fn version(&self) -> i64;
    fn into_cache_value(self: Arc<Self>) -> CacheValue;
    fn from_cache_value(value: CacheValue) -> Option<Arc<Self>>;
    fn stored_event(identifier: String) -> SdkEvent;
    fn deleted_event(identifier: String) -> SdkEvent;
}

impl Entry for FeatureConfig {
    fn key(identifier: &str) -> String {
        flag_key(identifier)
    }
    fn version(&self) -> i64 {
        self.version
    }
    fn into_cache_value(self: Arc<Self>) -> CacheValue {
        CacheValue::Flag(self)
    }
    fn from_cache_value(value: CacheValue) -> Option<Arc<Self>> {
        match value {
            CacheValue::Flag(flag) => Some(flag),
            CacheValue::Segment(_) => None,
        }
    }
    fn stored_event(identifier: String) -> SdkEvent {
        SdkEvent::FlagStored(identifier)
    }
    fn deleted_event(identifier: String) -> SdkEvent {
        SdkEvent::FlagDeleted(identifier)
    }
}

impl Entry for Segment {
    fn key(identifier: &str) -> String {
        segment_key(identifier)
    }
    fn version(&self) -> i64 {
        self.version
    }
    fn into_cache_value(self: Arc<Self>) -> CacheValue {
        CacheValue::Segment(self)
    }
    fn from_cache_value(value: CacheValue) -> Option<Arc<Self>> {
        match value {
            CacheValue::Segment(segment) => Some(segment),
            CacheValue::Flag(_) => None,
        }
    }
    fn stored_event(identifier: String) -> SdkEvent {
        SdkEvent::SegmentStored(identifier)
    }
    fn deleted_event(identifier: String) -> SdkEvent {
        SdkEvent::SegmentDeleted(identifier)
    }
}

type LockTable = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// Exclusive hold on one key. The table entry is removed once no holder or waiter remains.
struct KeyLock<'a> {
    table: &'a LockTable,
    key: String,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for KeyLock<'_> {
    fn drop(&mut self) {
        let mut table = self
            .table
            .lock()
            .expect("thread holding key lock table should not panic");
        drop(self.guard.take());
        if table.get(&self.key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            table.remove(&self.key);
        }
    }
}

/// Two-tier versioned cache of flags and segments.
pub struct Repository {
    cache: Arc<dyn KeyValueCache>,
    store: Option<Arc<dyn AsyncKeyValueStore>>,
    bus: Option<EventBus>,
    key_locks: LockTable,
}

impl Repository {
    /// Create a repository over the fast `cache` and an optional durable `store`. Changes are
    /// announced on `bus` if one is given.
    pub fn new(
        cache: Arc<dyn KeyValueCache>,
        store: Option<Arc<dyn AsyncKeyValueStore>>,
        bus: Option<EventBus>,
    ) -> Repository {
        Repository {
            cache,
            store,
            bus,
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Store a flag definition unless a newer or equal version is already stored.
    pub async fn set_flag(&self, identifier: &str, flag: FeatureConfig) -> Result<()> {
        self.set_entry(identifier, flag).await
    }

    /// Store a segment definition unless a newer or equal version is already stored.
    pub async fn set_segment(&self, identifier: &str, segment: Segment) -> Result<()> {
        self.set_entry(identifier, segment).await
    }

    /// Remove a flag definition.
    pub async fn delete_flag(&self, identifier: &str) -> Result<()> {
        self.delete_entry::<FeatureConfig>(identifier).await
    }

    /// Remove a segment definition.
    pub async fn delete_segment(&self, identifier: &str) -> Result<()> {
        self.delete_entry::<Segment>(identifier).await
    }

    /// Get a flag definition. On a durable-store hit the fast cache is populated, unless
    /// `cacheable` is `false`.
    pub async fn get_flag(
        &self,
        identifier: &str,
        cacheable: bool,
    ) -> Result<Option<Arc<FeatureConfig>>> {
        self.get_entry(identifier, cacheable).await
    }

    /// Get a segment definition. On a durable-store hit the fast cache is populated, unless
    /// `cacheable` is `false`.
    pub async fn get_segment(&self, identifier: &str, cacheable: bool) -> Result<Option<Arc<Segment>>> {
        self.get_entry(identifier, cacheable).await
    }

    /// Identifiers of all flags that depend on `segment` through a `segmentMatch` clause or a
    /// target map entry. Sorted.
    pub async fn find_flags_by_segment(&self, segment: &str) -> Result<Vec<String>> {
        let mut identifiers: BTreeSet<String> = self
            .cache
            .keys()
            .iter()
            .filter_map(|key| key.strip_prefix(FLAG_PREFIX).map(str::to_owned))
            .collect();
        if let Some(store) = &self.store {
            identifiers.extend(
                store
                    .keys()
                    .await?
                    .iter()
                    .filter_map(|key| key.strip_prefix(FLAG_PREFIX).map(str::to_owned)),
            );
        }

        let mut flags = Vec::new();
        for identifier in identifiers {
            if let Some(flag) = self.get_flag(&identifier, false).await? {
                if flag.references_segment(segment) {
                    flags.push(identifier);
                }
            }
        }
        Ok(flags)
    }

    /// Identifiers of all segments known to the repository. Sorted.
    pub async fn segment_identifiers(&self) -> Result<Vec<String>> {
        let mut identifiers: BTreeSet<String> = self
            .cache
            .keys()
            .iter()
            .filter_map(|key| key.strip_prefix(SEGMENT_PREFIX).map(str::to_owned))
            .collect();
        if let Some(store) = &self.store {
            identifiers.extend(
                store
                    .keys()
                    .await?
                    .iter()
                    .filter_map(|key| key.strip_prefix(SEGMENT_PREFIX).map(str::to_owned)),
            );
        }
        Ok(identifiers.into_iter().collect())
    }

    async fn set_entry<T: Entry>(&self, identifier: &str, entry: T) -> Result<()> {
        let key = T::key(identifier);
        let _key_lock = self.lock_key(&key).await;

        // Version check read: must not populate the fast cache.
        if let Some(stored) = self.get_entry::<T>(identifier, false).await? {
            if stored.version() >= entry.version() {
                log::trace!(target: "ff",
                            key,
                            stored_version = stored.version(),
                            incoming_version = entry.version();
                            "discarding outdated update");
                return Ok(());
            }
        }

        match &self.store {
            Some(store) => {
                store.set(&key, serde_json::to_value(&entry)?).await?;
                // Next read repopulates from the durable store.
                self.cache.delete(&key);
            }
            None => self.cache.set(&key, Arc::new(entry).into_cache_value()),
        }
        log::debug!(target: "ff", key; "stored");

        self.publish(T::stored_event(identifier.to_owned()));
        Ok(())
    }

    async fn delete_entry<T: Entry>(&self, identifier: &str) -> Result<()> {
        let key = T::key(identifier);
        let _key_lock = self.lock_key(&key).await;

        if let Some(store) = &self.store {
            store.delete(&key).await?;
        }
        self.cache.delete(&key);
        log::debug!(target: "ff", key; "deleted");

        self.publish(T::deleted_event(identifier.to_owned()));
        Ok(())
    }

    async fn get_entry<T: Entry>(&self, identifier: &str, cacheable: bool) -> Result<Option<Arc<T>>> {
        let key = T::key(identifier);
        if let Some(entry) = self.cache.get(&key).and_then(T::from_cache_value) {
            return Ok(Some(entry));
        }
        let Some(store) = &self.store else {
            return Ok(None);
        };
        if !cacheable {
            return read_store(store.as_ref(), &key).await;
        }

        // Fill under the key lock so a concurrent write-through is not shadowed by an older read.
        let _key_lock = self.lock_key(&key).await;
        if let Some(entry) = self.cache.get(&key).and_then(T::from_cache_value) {
            return Ok(Some(entry));
        }
        let entry = read_store::<T>(store.as_ref(), &key).await?;
        if let Some(entry) = &entry {
            self.cache.set(&key, entry.clone().into_cache_value());
        }
        Ok(entry)
    }

    async fn lock_key(&self, key: &str) -> KeyLock<'_> {
        let lock = self
            .key_locks
            .lock()
            .expect("thread holding key lock table should not panic")
            .entry(key.to_owned())
            .or_default()
            .clone();
        // Registered before waiting so a cancelled wait still prunes the entry.
        let mut key_lock = KeyLock {
            table: &self.key_locks,
            key: key.to_owned(),
            guard: None,
        };
        key_lock.guard = Some(lock.lock_owned().await);
        key_lock
    }

    fn publish(&self, event: SdkEvent) {
        if let Some(bus) = &self.bus {
            bus.publish(event);
        }
    }
}

async fn read_store<T: Entry>(store: &dyn AsyncKeyValueStore, key: &str) -> Result<Option<Arc<T>>> {
    match store.get(key).await? {
        Some(value) => Ok(Some(Arc::new(serde_json::from_value::<T>(value)?))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use async_trait::async_trait;

    use crate::{
        cache::{AsyncKeyValueStore, InMemoryCache, InMemoryStore, KeyValueCache},
        event_bus::{EventBus, SdkEvent},
        testing::{bool_flag, segment},
        Repository, Result,
    };

    /// Durable store with latency. Reads return the value as it was when the read started.
    struct SlowStore {
        inner: InMemoryStore,
        read_delay: Duration,
        write_delay: Duration,
    }

    #[async_trait]
    impl AsyncKeyValueStore for SlowStore {
        async fn set(&self, key: &str, value: serde_json::Value) -> Result<()> {
            tokio::time::sleep(self.write_delay).await;
            self.inner.set(key, value).await
        }

        async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
            let snapshot = self.inner.get(key).await;
            tokio::time::sleep(self.read_delay).await;
            snapshot
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.inner.delete(key).await
        }

        async fn keys(&self) -> Result<Vec<String>> {
            self.inner.keys().await
        }
    }

    fn repository() -> Repository {
        Repository::new(Arc::new(InMemoryCache::new()), None, None)
    }

    #[tokio::test]
    async fn stores_and_reads_flag() {
        let repository = repository();
        repository.set_flag("flag", bool_flag("flag", 1)).await.unwrap();

        let flag = repository.get_flag("flag", true).await.unwrap().unwrap();
        assert_eq!(flag.feature, "flag");
        assert!(repository.get_flag("missing", true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn outdated_versions_are_discarded() {
        let repository = repository();
        let mut v2 = bool_flag("flag", 2);
        v2.off_variation = "false".into();
        repository.set_flag("flag", v2).await.unwrap();

        let mut stale = bool_flag("flag", 1);
        stale.off_variation = "stale".into();
        repository.set_flag("flag", stale).await.unwrap();
        let mut same = bool_flag("flag", 2);
        same.off_variation = "same".into();
        repository.set_flag("flag", same).await.unwrap();

        let flag = repository.get_flag("flag", true).await.unwrap().unwrap();
        assert_eq!(flag.version, 2);
        assert_eq!(flag.off_variation, "false");

        repository.set_flag("flag", bool_flag("flag", 3)).await.unwrap();
        let flag = repository.get_flag("flag", true).await.unwrap().unwrap();
        assert_eq!(flag.version, 3);
    }

    #[tokio::test]
    async fn segment_versions_are_monotonic() {
        let repository = repository();
        repository.set_segment("beta", segment("beta", 5)).await.unwrap();
        let mut stale = segment("beta", 4);
        stale.name = "stale".into();
        repository.set_segment("beta", stale).await.unwrap();

        let stored = repository.get_segment("beta", true).await.unwrap().unwrap();
        assert_eq!(stored.version, 5);
        assert_eq!(stored.name, "beta");
    }

    #[tokio::test]
    async fn durable_store_is_written_through_and_cache_invalidated() {
        let cache = Arc::new(InMemoryCache::new());
        let store = Arc::new(InMemoryStore::new());
        let repository = Repository::new(cache.clone(), Some(store.clone()), None);

        repository.set_flag("flag", bool_flag("flag", 1)).await.unwrap();
        assert!(store.get("flags/flag").await.unwrap().is_some());
        assert!(cache.get("flags/flag").is_none());

        // Non-cacheable read does not populate the cache.
        assert!(repository.get_flag("flag", false).await.unwrap().is_some());
        assert!(cache.get("flags/flag").is_none());

        // Cacheable read does.
        assert!(repository.get_flag("flag", true).await.unwrap().is_some());
        assert!(cache.get("flags/flag").is_some());

        // A newer write invalidates the cached copy.
        repository.set_flag("flag", bool_flag("flag", 2)).await.unwrap();
        assert!(cache.get("flags/flag").is_none());
        let flag = repository.get_flag("flag", true).await.unwrap().unwrap();
        assert_eq!(flag.version, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cache_fill_does_not_shadow_concurrent_write() {
        let cache = Arc::new(InMemoryCache::new());
        let store = Arc::new(SlowStore {
            inner: InMemoryStore::new(),
            read_delay: Duration::from_millis(20),
            write_delay: Duration::from_millis(5),
        });
        let repository = Arc::new(Repository::new(cache.clone(), Some(store.clone()), None));
        repository.set_flag("flag", bool_flag("flag", 1)).await.unwrap();
        assert!(cache.get("flags/flag").is_none());

        // Reader misses the fast cache and reads v1 from the store while v2 is written through.
        let reader = {
            let repository = repository.clone();
            tokio::spawn(async move { repository.get_flag("flag", true).await.unwrap() })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;
        repository.set_flag("flag", bool_flag("flag", 2)).await.unwrap();
        assert_eq!(reader.await.unwrap().unwrap().version, 1);

        let durable = store.get("flags/flag").await.unwrap().unwrap();
        assert_eq!(durable["version"], 2);
        let served = repository.get_flag("flag", true).await.unwrap().unwrap();
        assert_eq!(served.version, 2);
    }

    #[tokio::test]
    async fn key_locks_are_released() {
        let store = Arc::new(InMemoryStore::new());
        let repository = Repository::new(Arc::new(InMemoryCache::new()), Some(store), None);

        repository.set_flag("flag", bool_flag("flag", 1)).await.unwrap();
        repository.get_flag("flag", true).await.unwrap();
        repository.delete_flag("flag").await.unwrap();
        repository.set_segment("beta", segment("beta", 1)).await.unwrap();
        repository.delete_segment("beta").await.unwrap();

        assert!(repository.key_locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_removes_from_both_tiers() {
        let cache = Arc::new(InMemoryCache::new());
        let store = Arc::new(InMemoryStore::new());
        let repository = Repository::new(cache.clone(), Some(store.clone()), None);

        repository.set_segment("beta", segment("beta", 1)).await.unwrap();
        repository.get_segment("beta", true).await.unwrap();
        repository.delete_segment("beta").await.unwrap();

        assert!(cache.get("segments/beta").is_none());
        assert!(store.get("segments/beta").await.unwrap().is_none());
        assert!(repository.get_segment("beta", true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn emits_change_events() {
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let repository = Repository::new(Arc::new(InMemoryCache::new()), None, Some(bus));

        repository.set_flag("flag", bool_flag("flag", 1)).await.unwrap();
        // Discarded write emits nothing.
        repository.set_flag("flag", bool_flag("flag", 1)).await.unwrap();
        repository.delete_flag("flag").await.unwrap();
        repository.set_segment("beta", segment("beta", 1)).await.unwrap();
        repository.delete_segment("beta").await.unwrap();

        assert!(matches!(events.recv().await, Ok(SdkEvent::FlagStored(id)) if id == "flag"));
        assert!(matches!(events.recv().await, Ok(SdkEvent::FlagDeleted(id)) if id == "flag"));
        assert!(matches!(events.recv().await, Ok(SdkEvent::SegmentStored(id)) if id == "beta"));
        assert!(matches!(events.recv().await, Ok(SdkEvent::SegmentDeleted(id)) if id == "beta"));
    }

    #[tokio::test]
    async fn finds_flags_by_segment() {
        let repository = repository();
        let mut with_rule = bool_flag("with-rule", 1);
        with_rule.rules = vec![crate::testing::segment_rule(1, &["beta"], "true")];
        let mut with_map = bool_flag("with-map", 1);
        with_map.variation_to_target_map = vec![crate::VariationMap {
            variation: "true".into(),
            targets: vec![],
            target_segments: vec!["beta".into()],
        }];

        repository.set_flag("with-rule", with_rule).await.unwrap();
        repository.set_flag("with-map", with_map).await.unwrap();
        repository.set_flag("unrelated", bool_flag("unrelated", 1)).await.unwrap();
        repository.set_segment("beta", segment("beta", 1)).await.unwrap();

        assert_eq!(
            repository.find_flags_by_segment("beta").await.unwrap(),
            vec!["with-map".to_owned(), "with-rule".to_owned()]
        );
        assert!(repository.find_flags_by_segment("other").await.unwrap().is_empty());
        assert_eq!(repository.segment_identifiers().await.unwrap(), vec!["beta".to_owned()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_keep_highest_version() {
        let repository = Arc::new(repository());
        let mut handles = Vec::new();
        for version in (1..=50).rev() {
            let repository = repository.clone();
            handles.push(tokio::spawn(async move {
                repository
                    .set_flag("flag", bool_flag("flag", version))
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let flag = repository.get_flag("flag", true).await.unwrap().unwrap();
        assert_eq!(flag.version, 50);
        assert!(repository.key_locks.lock().unwrap().is_empty());
    }
}
