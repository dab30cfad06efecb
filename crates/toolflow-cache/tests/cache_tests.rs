//! Integration tests for the tiered cache against manual time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use proptest::prelude::*;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use toolflow_cache::{
    doc_cache_key, project_signature, CacheConfig, CacheError, DurableStore, FileStore, Lookup,
    ManualClock, MemoryStore, PersistedEntry, TieredCache,
};

fn cache_with(config: CacheConfig) -> (TieredCache, ManualClock) {
    let clock = ManualClock::default();
    let cache = TieredCache::with_clock(config, Arc::new(clock.clone()));
    (cache, clock)
}

fn no_swr() -> CacheConfig {
    CacheConfig {
        stale_while_revalidate: false,
        ..CacheConfig::default()
    }
}

/// A durable tier that is always down.
#[derive(Debug)]
struct BrokenStore;

#[async_trait]
impl DurableStore for BrokenStore {
    async fn load(&self, _key: &str) -> Result<Option<PersistedEntry>, CacheError> {
        Err(CacheError::Unavailable("disk offline".into()))
    }

    async fn store(&self, _entry: &PersistedEntry) -> Result<(), CacheError> {
        Err(CacheError::Unavailable("disk offline".into()))
    }

    async fn remove(&self, _key: &str) -> Result<bool, CacheError> {
        Err(CacheError::Unavailable("disk offline".into()))
    }

    async fn remove_by_tag(&self, _tag: &str) -> Result<Vec<String>, CacheError> {
        Err(CacheError::Unavailable("disk offline".into()))
    }

    async fn remove_partition(&self, _partition: &str) -> Result<Vec<String>, CacheError> {
        Err(CacheError::Unavailable("disk offline".into()))
    }

    async fn purge(&self, _now: DateTime<Utc>, _honor_stale: bool) -> Result<usize, CacheError> {
        Err(CacheError::Unavailable("disk offline".into()))
    }

    async fn clear(&self) -> Result<(), CacheError> {
        Err(CacheError::Unavailable("disk offline".into()))
    }
}

/// Wraps a `MemoryStore`; when armed, the next `load` reads its record and
/// then parks until released.
#[derive(Debug, Default)]
struct GatedStore {
    inner: MemoryStore,
    armed: AtomicBool,
    parked: Notify,
    release: Notify,
}

#[async_trait]
impl DurableStore for GatedStore {
    async fn load(&self, key: &str) -> Result<Option<PersistedEntry>, CacheError> {
        let record = self.inner.load(key).await?;
        if self.armed.swap(false, Ordering::SeqCst) {
            self.parked.notify_one();
            self.release.notified().await;
        }
        Ok(record)
    }
    async fn store(&self, entry: &PersistedEntry) -> Result<(), CacheError> {
        self.inner.store(entry).await
    }
    async fn remove(&self, key: &str) -> Result<bool, CacheError> {
        self.inner.remove(key).await
    }
    async fn remove_by_tag(&self, tag: &str) -> Result<Vec<String>, CacheError> {
        self.inner.remove_by_tag(tag).await
    }
    async fn remove_partition(&self, partition: &str) -> Result<Vec<String>, CacheError> {
        self.inner.remove_partition(partition).await
    }
    async fn purge(&self, now: DateTime<Utc>, honor_stale: bool) -> Result<usize, CacheError> {
        self.inner.purge(now, honor_stale).await
    }
    async fn clear(&self) -> Result<(), CacheError> {
        self.inner.clear().await
    }
}

// =============================================================================
// Expiry
// =============================================================================

#[tokio::test]
async fn test_expired_entry_is_a_miss() {
    let (cache, clock) = cache_with(no_swr());
    cache.set("k", "v", Some(Duration::from_secs(1)), &[]).await.unwrap();
    assert_eq!(cache.get("k").await.as_deref(), Some("v"));

    clock.advance(Duration::from_millis(1_100));

    assert_eq!(cache.get("k").await, None);
    let stats = cache.stats().await;
    assert_eq!(stats.total_entries, 0);
    assert_eq!(stats.expirations, 1);
}

#[tokio::test]
async fn test_stale_entry_served_inside_window() {
    let config = CacheConfig {
        stale_while_revalidate_secs: 60,
        ..CacheConfig::default()
    };
    let (cache, clock) = cache_with(config);
    cache.set("k", "old docs", Some(Duration::from_secs(10)), &[]).await.unwrap();

    clock.advance(Duration::from_secs(11));
    assert_eq!(cache.get("k").await, None, "plain get never serves stale");
    let lookup = cache.get_stale_while_revalidate("k").await;
    assert_eq!(lookup, Lookup::Stale("old docs".into()));
    assert!(lookup.is_stale());

    clock.advance(Duration::from_secs(60));
    assert_eq!(cache.get_stale_while_revalidate("k").await, Lookup::Miss);
    assert_eq!(cache.stats().await.stale_hits, 1);
}

#[tokio::test]
async fn test_stale_window_capped_by_max_age() {
    let config = CacheConfig {
        stale_while_revalidate_secs: 60,
        max_age_secs: 30,
        ..CacheConfig::default()
    };
    let (cache, clock) = cache_with(config);
    cache.set("k", "v", Some(Duration::from_secs(10)), &[]).await.unwrap();

    clock.advance(Duration::from_secs(29));
    assert!(cache.get_stale_while_revalidate("k").await.is_stale());

    clock.advance(Duration::from_secs(2));
    assert_eq!(cache.get_stale_while_revalidate("k").await, Lookup::Miss);
}

#[tokio::test]
async fn test_ttl_capped_by_max_age() {
    let config = CacheConfig {
        max_age_secs: 5,
        ..no_swr()
    };
    let (cache, clock) = cache_with(config);
    cache.set("k", "v", Some(Duration::from_secs(3_600)), &[]).await.unwrap();

    clock.advance(Duration::from_secs(6));
    assert_eq!(cache.get("k").await, None);
}

#[tokio::test]
async fn test_stale_not_served_when_disabled() {
    let (cache, clock) = cache_with(no_swr());
    cache.set("k", "v", Some(Duration::from_secs(1)), &[]).await.unwrap();
    clock.advance(Duration::from_secs(2));
    assert_eq!(cache.get_stale_while_revalidate("k").await, Lookup::Miss);
}

#[tokio::test]
async fn test_sweep_purges_without_reads() {
    let (cache, clock) = cache_with(no_swr());
    cache.set("a", "1", Some(Duration::from_secs(1)), &[]).await.unwrap();
    cache.set("b", "2", Some(Duration::from_secs(1)), &[]).await.unwrap();
    cache.set("c", "3", Some(Duration::from_secs(60)), &[]).await.unwrap();

    clock.advance(Duration::from_secs(2));
    assert_eq!(cache.sweep().await, 2);

    let stats = cache.stats().await;
    assert_eq!(stats.total_entries, 1);
    assert_eq!(stats.expirations, 2);
    assert_eq!(cache.get("c").await.as_deref(), Some("3"));
}

// =============================================================================
// Invalidation
// =============================================================================

#[tokio::test]
async fn test_invalidate_by_tag_removes_exactly_tagged() {
    let (cache, _) = cache_with(CacheConfig::default());
    cache.set("react-hooks", "a", None, &["react"]).await.unwrap();
    cache.set("react-router", "b", None, &["react", "routing"]).await.unwrap();
    cache.set("vue-setup", "c", None, &["vue"]).await.unwrap();

    assert_eq!(cache.invalidate_by_tag("react").await, 2);

    assert_eq!(cache.get("react-hooks").await, None);
    assert_eq!(cache.get("react-router").await, None);
    assert_eq!(cache.get("vue-setup").await.as_deref(), Some("c"));
    assert_eq!(cache.invalidate_by_tag("react").await, 0);
}

#[tokio::test]
async fn test_invalidate_reaches_durable_tier() {
    let store = Arc::new(MemoryStore::new());
    let (cache, _) = cache_with(CacheConfig::default());
    let cache = cache.with_durable(store.clone());

    cache.set("k", "v", None, &[]).await.unwrap();
    assert_eq!(store.len().await, 1);

    assert!(cache.invalidate("k").await);
    assert_eq!(store.len().await, 0);
    assert!(!cache.invalidate("k").await);
}

#[tokio::test]
async fn test_invalidate_partition_drops_one_project() {
    let store = Arc::new(MemoryStore::new());
    let (cache, _) = cache_with(CacheConfig::default());
    let cache = cache.with_durable(store.clone());

    let old_sig = project_signature(["framework:react@18"]);
    let new_sig = project_signature(["framework:react@19"]);
    let old_key = doc_cache_key("react", "hooks", &old_sig);
    let new_key = doc_cache_key("react", "hooks", &new_sig);

    cache.set(&old_key, "v18", None, &["react"]).await.unwrap();
    cache.set(&new_key, "v19", None, &["react"]).await.unwrap();

    assert_eq!(cache.invalidate_partition(&old_sig).await, 1);
    assert_eq!(cache.get(&old_key).await, None);
    assert_eq!(cache.get(&new_key).await.as_deref(), Some("v19"));
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn test_clear_empties_both_tiers() {
    let store = Arc::new(MemoryStore::new());
    let (cache, _) = cache_with(CacheConfig::default());
    let cache = cache.with_durable(store.clone());
    cache.set("a", "1", None, &[]).await.unwrap();
    cache.set("b", "2", None, &[]).await.unwrap();

    cache.clear().await;

    assert_eq!(cache.stats().await.total_entries, 0);
    assert_eq!(store.len().await, 0);
}

// =============================================================================
// Eviction
// =============================================================================

#[tokio::test]
async fn test_lru_evicts_least_recently_accessed() {
    let config = CacheConfig {
        max_memory_entries: 2,
        ..CacheConfig::default()
    };
    let (cache, _) = cache_with(config);

    cache.set("a", "1", None, &[]).await.unwrap();
    cache.set("b", "2", None, &[]).await.unwrap();
    assert!(cache.get("a").await.is_some());
    cache.set("c", "3", None, &[]).await.unwrap();

    assert_eq!(cache.get("b").await, None);
    assert!(cache.get("a").await.is_some());
    assert!(cache.get("c").await.is_some());
    assert_eq!(cache.stats().await.evictions, 1);
}

#[tokio::test]
async fn test_byte_ceiling_evicts() {
    let config = CacheConfig {
        max_memory_bytes: 20,
        ..CacheConfig::default()
    };
    let (cache, _) = cache_with(config);

    // Each entry is 2 key bytes + 8 value bytes.
    cache.set("k1", "12345678", None, &[]).await.unwrap();
    cache.set("k2", "12345678", None, &[]).await.unwrap();
    cache.set("k3", "12345678", None, &[]).await.unwrap();

    let stats = cache.stats().await;
    assert_eq!(stats.total_entries, 2);
    assert!(stats.total_size_bytes <= 20);
    assert_eq!(cache.get("k1").await, None);
}

#[tokio::test]
async fn test_oversized_entry_kept_durable_only() {
    let config = CacheConfig {
        max_memory_bytes: 16,
        ..CacheConfig::default()
    };
    let store = Arc::new(MemoryStore::new());
    let (cache, _) = cache_with(config);
    let cache = cache.with_durable(store.clone());

    cache.set("small", "ok", None, &[]).await.unwrap();
    let big = "x".repeat(64);
    cache.set("big", big.clone(), None, &[]).await.unwrap();

    assert_eq!(cache.stats().await.total_entries, 1);
    assert_eq!(store.len().await, 2);
    // Promotion declines it again, but the durable copy still answers.
    assert_eq!(cache.get("big").await, Some(big));
    assert_eq!(cache.get("small").await.as_deref(), Some("ok"));
}

#[tokio::test]
async fn test_evicted_entry_promoted_from_durable() {
    let config = CacheConfig {
        max_memory_entries: 1,
        ..CacheConfig::default()
    };
    let store = Arc::new(MemoryStore::new());
    let (cache, _) = cache_with(config);
    let cache = cache.with_durable(store.clone());

    cache.set("a", "alpha", None, &[]).await.unwrap();
    cache.set("b", "beta", None, &[]).await.unwrap();

    assert_eq!(cache.get("a").await.as_deref(), Some("alpha"));
    let stats = cache.stats().await;
    assert_eq!(stats.total_entries, 1);
    assert_eq!(stats.evictions, 2);
    assert_eq!(stats.hits, 1);
}

// =============================================================================
// Durable tier
// =============================================================================

#[tokio::test]
async fn test_file_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let sig = project_signature(["framework:axum"]);
    let key = doc_cache_key("axum", "routing", &sig);

    {
        let store = Arc::new(FileStore::open(dir.path()).await.unwrap());
        let cache = TieredCache::new(CacheConfig::default()).with_durable(store);
        cache.set(&key, "Router::new()", None, &["axum"]).await.unwrap();
    }

    let store = Arc::new(FileStore::open(dir.path()).await.unwrap());
    let cache = TieredCache::new(CacheConfig::default()).with_durable(store);
    assert_eq!(cache.get(&key).await.as_deref(), Some("Router::new()"));
    assert_eq!(cache.invalidate_by_tag("axum").await, 1);
    assert_eq!(cache.get(&key).await, None);
}

#[tokio::test]
async fn test_broken_durable_tier_degrades_to_memory() {
    let (cache, _) = cache_with(CacheConfig::default());
    let cache = cache.with_durable(Arc::new(BrokenStore));

    cache.set("k", "v", None, &["t"]).await.unwrap();
    assert_eq!(cache.get("k").await.as_deref(), Some("v"));
    assert_eq!(cache.get("missing").await, None);
    assert_eq!(cache.invalidate_by_tag("t").await, 1);
    assert_eq!(cache.sweep().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_sweeper_runs_on_interval() {
    let config = CacheConfig {
        sweep_interval_secs: 1,
        ..no_swr()
    };
    let clock = ManualClock::default();
    let cache = Arc::new(TieredCache::with_clock(config, Arc::new(clock.clone())));
    cache.set("k", "v", Some(Duration::from_secs(1)), &[]).await.unwrap();
    let handle = cache.spawn_sweeper();

    clock.advance(Duration::from_secs(5));
    tokio::time::sleep(Duration::from_millis(1_500)).await;

    assert_eq!(cache.stats().await.expirations, 1);
    handle.abort();
}

#[tokio::test]
async fn test_durable_promotion_yields_to_concurrent_set() {
    let store = Arc::new(GatedStore::default());
    let config = CacheConfig {
        max_memory_entries: 1,
        ..CacheConfig::default()
    };
    let cache = TieredCache::with_clock(config, Arc::new(ManualClock::default()))
        .with_durable(Arc::clone(&store) as Arc<dyn DurableStore>);
    let cache = Arc::new(cache);

    cache.set("k", "old", None, &[]).await.unwrap();
    cache.set("other", "x", None, &[]).await.unwrap();

    store.armed.store(true, Ordering::SeqCst);
    let reader = tokio::spawn({
        let cache = Arc::clone(&cache);
        async move { cache.get("k").await }
    });
    store.parked.notified().await;

    cache.set("k", "new", None, &[]).await.unwrap();
    store.release.notify_one();

    assert_eq!(reader.await.unwrap().as_deref(), Some("new"));
    assert_eq!(cache.get("k").await.as_deref(), Some("new"));
    assert_eq!(store.inner.load("k").await.unwrap().unwrap().value, "new");
}

// =============================================================================
// Properties
// =============================================================================

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

const TAGS: [&str; 4] = ["react", "vue", "svelte", "axum"];

proptest! {
    #[test]
    fn prop_tag_invalidation_is_exact(
        tag_sets in prop::collection::vec(prop::collection::vec(0usize..4, 0..3), 1..20),
        target in 0usize..4,
    ) {
        let rt = runtime();
        rt.block_on(async {
            let (cache, _) = cache_with(CacheConfig::default());
            for (i, tags) in tag_sets.iter().enumerate() {
                let names: Vec<&str> = tags.iter().map(|t| TAGS[*t]).collect();
                cache.set(&format!("key-{}", i), "v", None, &names).await.unwrap();
            }

            let expected = tag_sets.iter().filter(|tags| tags.contains(&target)).count();
            let removed = cache.invalidate_by_tag(TAGS[target]).await;
            assert_eq!(removed, expected);

            for (i, tags) in tag_sets.iter().enumerate() {
                let present = cache.get(&format!("key-{}", i)).await.is_some();
                assert_eq!(present, !tags.contains(&target));
            }
        });
    }

    #[test]
    fn prop_memory_tier_respects_capacity(
        capacity in 1usize..6,
        keys in prop::collection::vec(0u8..12, 1..40),
    ) {
        let rt = runtime();
        rt.block_on(async {
            let config = CacheConfig { max_memory_entries: capacity, ..CacheConfig::default() };
            let (cache, _) = cache_with(config);
            for key in &keys {
                let key = format!("k{}", key);
                cache.set(&key, "v", None, &[]).await.unwrap();
                assert!(cache.stats().await.total_entries <= capacity);
                assert!(cache.get(&key).await.is_some());
            }
        });
    }

    #[test]
    fn prop_eviction_follows_lru_model(
        capacity in 1usize..5,
        ops in prop::collection::vec((any::<bool>(), 0u8..8), 1..60),
    ) {
        let rt = runtime();
        rt.block_on(async {
            let config = CacheConfig { max_memory_entries: capacity, ..CacheConfig::default() };
            let (cache, _) = cache_with(config);
            // Front is least recently used.
            let mut model: VecDeque<(String, String)> = VecDeque::new();

            for (step, (is_set, key)) in ops.iter().enumerate() {
                let key = format!("k{}", key);
                let position = model.iter().position(|(k, _)| *k == key);
                if *is_set {
                    let value = format!("v{}", step);
                    cache.set(&key, &value, None, &[]).await.unwrap();
                    if let Some(i) = position {
                        model.remove(i);
                    }
                    model.push_back((key, value));
                    if model.len() > capacity {
                        let (victim, _) = model.pop_front().unwrap();
                        assert_eq!(cache.get(&victim).await, None, "expected {} evicted", victim);
                    }
                } else {
                    let expected = position.map(|i| {
                        let entry = model.remove(i).unwrap();
                        let value = entry.1.clone();
                        model.push_back(entry);
                        value
                    });
                    assert_eq!(cache.get(&key).await, expected);
                }
                assert_eq!(cache.stats().await.total_entries, model.len());
            }
        });
    }
}
