//! Tiered Cache: in-process LRU map in front of an optional durable store
//!
//! ```text
//! get ──► memory ──hit──► value
//!           │miss
//!           ▼
//!         durable ──hit──► promote ──► value
//!           │miss / error
//!           ▼
//!          Miss
//! ```
//!
//! Durable-tier failures are logged and treated as misses. LRU pressure only
//! evicts from memory; the durable copy stays and can be promoted again.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex as SyncMutex, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::clock::{add, Clock, SystemClock};
use crate::config::CacheConfig;
use crate::entry::{entry_size, CacheEntry, Freshness, PersistedEntry};
use crate::error::CacheError;
use crate::key::partition_of;
use crate::store::DurableStore;

/// Result of a stale-tolerant lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Fresh(String),
    /// Past expiry but inside the stale window. The caller should refresh.
    Stale(String),
    Miss,
}

impl Lookup {
    pub fn value(&self) -> Option<&str> {
        match self {
            Lookup::Fresh(v) | Lookup::Stale(v) => Some(v.as_str()),
            Lookup::Miss => None,
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, Lookup::Stale(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub total_entries: usize,
    pub total_size_bytes: u64,
    pub hit_rate: f64,
    pub miss_rate: f64,
    pub evictions: u64,
    pub hits: u64,
    pub stale_hits: u64,
    pub misses: u64,
    pub expirations: u64,
}

#[derive(Debug, Default)]
struct MemoryTier {
    entries: HashMap<String, CacheEntry>,
    total_bytes: u64,
    seq: u64,
    hits: u64,
    stale_hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl MemoryTier {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.total_bytes = self.total_bytes.saturating_sub(entry.size_bytes);
        Some(entry)
    }

    fn remove_where(&mut self, pred: impl Fn(&CacheEntry) -> bool) -> Vec<String> {
        let keys: Vec<String> = self
            .entries
            .values()
            .filter(|e| pred(e))
            .map(|e| e.key.clone())
            .collect();
        for key in &keys {
            self.remove(key);
        }
        keys
    }

    /// Evicts least-recently-accessed entries until one more entry of
    /// `incoming` bytes fits under both ceilings.
    fn make_room(&mut self, incoming: u64, max_entries: usize, max_bytes: u64) {
        while !self.entries.is_empty()
            && (self.entries.len() >= max_entries || self.total_bytes + incoming > max_bytes)
        {
            let Some(victim) = self
                .entries
                .values()
                .min_by_key(|e| e.lru_key())
                .map(|e| e.key.clone())
            else {
                break;
            };
            self.remove(&victim);
            self.evictions += 1;
            debug!(key = %victim, "cache entry evicted (lru)");
        }
    }

    fn insert(&mut self, entry: CacheEntry) {
        self.total_bytes += entry.size_bytes;
        self.entries.insert(entry.key.clone(), entry);
    }
}

pub struct TieredCache {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    memory: Mutex<MemoryTier>,
    durable: Option<Arc<dyn DurableStore>>,
    refreshing: SyncMutex<HashSet<String>>,
}

impl std::fmt::Debug for TieredCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCache")
            .field("config", &self.config)
            .field("clock", &self.clock)
            .field("durable", &self.durable.is_some())
            .finish()
    }
}

impl TieredCache {
    /// Memory-only cache on the system clock.
    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            memory: Mutex::new(MemoryTier::default()),
            durable: None,
            refreshing: SyncMutex::new(HashSet::new()),
        }
    }

    pub fn with_durable(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.durable = Some(store);
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Whether an entry is past the point where it may be served at all.
    fn is_dead(&self, freshness: Freshness) -> bool {
        match freshness {
            Freshness::Fresh => false,
            Freshness::Stale => !self.config.stale_while_revalidate,
            Freshness::Dead => true,
        }
    }

    /// Fresh value for `key`, or `None`. Never serves expired entries.
    pub async fn get(&self, key: &str) -> Option<String> {
        match self.lookup(key, false).await {
            Lookup::Fresh(value) => Some(value),
            _ => None,
        }
    }

    /// Like [`get`](Self::get), but an expired entry still inside its stale
    /// window is returned as [`Lookup::Stale`]. Stale serving is disabled
    /// when the config turns stale-while-revalidate off.
    pub async fn get_stale_while_revalidate(&self, key: &str) -> Lookup {
        self.lookup(key, self.config.stale_while_revalidate).await
    }

    async fn lookup(&self, key: &str, allow_stale: bool) -> Lookup {
        let now = self.clock.now();

        let expired = {
            let mut memory = self.memory.lock().await;
            let seq = memory.next_seq();
            let freshness = memory.entries.get(key).map(|e| e.freshness(now));
            match freshness {
                None => false,
                Some(Freshness::Fresh) => {
                    memory.hits += 1;
                    return Lookup::Fresh(Self::touch(&mut memory, key, now, seq));
                }
                Some(Freshness::Stale) if allow_stale => {
                    memory.stale_hits += 1;
                    return Lookup::Stale(Self::touch(&mut memory, key, now, seq));
                }
                Some(freshness) if !self.is_dead(freshness) => {
                    memory.misses += 1;
                    return Lookup::Miss;
                }
                Some(_) => {
                    memory.remove(key);
                    memory.expirations += 1;
                    memory.misses += 1;
                    true
                }
            }
        };
        if expired {
            self.durable_remove(key).await;
            return Lookup::Miss;
        }

        let Some(record) = self.durable_load(key).await else {
            self.memory.lock().await.misses += 1;
            return Lookup::Miss;
        };

        let freshness = record.freshness(now);
        if self.is_dead(freshness) {
            self.durable_remove(key).await;
            let mut memory = self.memory.lock().await;
            memory.expirations += 1;
            memory.misses += 1;
            return Lookup::Miss;
        }
        if freshness == Freshness::Stale && !allow_stale {
            self.memory.lock().await.misses += 1;
            return Lookup::Miss;
        }

        let mut memory = self.memory.lock().await;
        let seq = memory.next_seq();

        // A `set` may have landed while the lock was released for the load.
        let newer = memory
            .entries
            .get(key)
            .filter(|e| e.created_at >= record.created_at)
            .map(|e| e.freshness(now));
        if let Some(current) = newer {
            debug!(key, "durable record superseded while loading, serving memory entry");
            return match current {
                Freshness::Fresh => {
                    memory.hits += 1;
                    Lookup::Fresh(Self::touch(&mut memory, key, now, seq))
                }
                Freshness::Stale if allow_stale => {
                    memory.stale_hits += 1;
                    Lookup::Stale(Self::touch(&mut memory, key, now, seq))
                }
                _ => {
                    memory.misses += 1;
                    Lookup::Miss
                }
            };
        }

        let value = record.value.clone();
        let mut entry = record.into_entry(now, seq);
        entry.touch(now, seq);
        self.admit(&mut memory, entry);
        debug!(key, "cache entry promoted from durable tier");

        if freshness == Freshness::Fresh {
            memory.hits += 1;
            Lookup::Fresh(value)
        } else {
            memory.stale_hits += 1;
            Lookup::Stale(value)
        }
    }

    fn touch(memory: &mut MemoryTier, key: &str, now: DateTime<Utc>, seq: u64) -> String {
        match memory.entries.get_mut(key) {
            Some(entry) => {
                entry.touch(now, seq);
                entry.value.clone()
            }
            None => String::new(),
        }
    }

    /// Inserts `entry` into memory after making room. Entries larger than
    /// the whole byte ceiling stay durable-only.
    fn admit(&self, memory: &mut MemoryTier, entry: CacheEntry) {
        memory.remove(&entry.key);
        if entry.size_bytes > self.config.max_memory_bytes || self.config.max_memory_entries == 0 {
            warn!(
                key = %entry.key,
                size_bytes = entry.size_bytes,
                "entry exceeds memory tier ceiling, not kept in memory"
            );
            return;
        }
        memory.make_room(entry.size_bytes, self.config.max_memory_entries, self.config.max_memory_bytes);
        memory.insert(entry);
    }

    /// Stores `value` under `key` in both tiers. `ttl` defaults to the
    /// configured TTL and is capped at max-age.
    pub async fn set(
        &self,
        key: &str,
        value: impl Into<String>,
        ttl: Option<Duration>,
        tags: &[&str],
    ) -> Result<(), CacheError> {
        let ttl = ttl.unwrap_or_else(|| self.config.default_ttl());
        if ttl.is_zero() {
            return Err(CacheError::InvalidTtl);
        }

        let now = self.clock.now();
        let max_age = self.config.max_age();
        let expires_at = add(now, ttl.min(max_age));
        let stale_until = if self.config.stale_while_revalidate {
            add(expires_at, self.config.swr_window()).min(add(now, max_age))
        } else {
            expires_at
        };

        let value = value.into();
        let tags: BTreeSet<String> = tags.iter().map(|t| t.to_string()).collect();
        let size_bytes = entry_size(key, &value, &tags);

        let record = PersistedEntry {
            key: key.to_string(),
            value,
            created_at: now,
            expires_at,
            stale_until,
            tags,
            size_bytes,
        };

        {
            let mut memory = self.memory.lock().await;
            let seq = memory.next_seq();
            self.admit(&mut memory, record.clone().into_entry(now, seq));
        }

        if let Some(store) = &self.durable {
            if let Err(err) = store.store(&record).await {
                warn!(key, %err, "durable cache write failed, entry kept in memory only");
            }
        }
        Ok(())
    }

    /// Removes `key` from both tiers. True if either tier held it.
    pub async fn invalidate(&self, key: &str) -> bool {
        let in_memory = self.memory.lock().await.remove(key).is_some();
        let in_durable = self.durable_remove(key).await;
        in_memory || in_durable
    }

    /// Removes exactly the entries whose tag set contains `tag`; returns how
    /// many distinct keys were removed across both tiers.
    pub async fn invalidate_by_tag(&self, tag: &str) -> usize {
        let mut removed: HashSet<String> = self
            .memory
            .lock()
            .await
            .remove_where(|e| e.tags.contains(tag))
            .into_iter()
            .collect();

        if let Some(store) = &self.durable {
            match store.remove_by_tag(tag).await {
                Ok(keys) => removed.extend(keys),
                Err(err) => warn!(tag, %err, "durable tag invalidation failed"),
            }
        }
        debug!(tag, removed = removed.len(), "tag invalidated");
        removed.len()
    }

    /// Drops every entry of one project signature, e.g. after its
    /// dependency versions change.
    pub async fn invalidate_partition(&self, partition: &str) -> usize {
        let mut removed: HashSet<String> = self
            .memory
            .lock()
            .await
            .remove_where(|e| partition_of(&e.key) == partition)
            .into_iter()
            .collect();

        if let Some(store) = &self.durable {
            match store.remove_partition(partition).await {
                Ok(keys) => removed.extend(keys),
                Err(err) => warn!(partition, %err, "durable partition invalidation failed"),
            }
        }
        removed.len()
    }

    pub async fn clear(&self) {
        {
            let mut memory = self.memory.lock().await;
            memory.entries.clear();
            memory.total_bytes = 0;
        }
        if let Some(store) = &self.durable {
            if let Err(err) = store.clear().await {
                warn!(%err, "durable cache clear failed");
            }
        }
    }

    /// Snapshot of the memory tier's size and the cache's counters.
    pub async fn stats(&self) -> CacheStats {
        let memory = self.memory.lock().await;
        let served = memory.hits + memory.stale_hits;
        let lookups = served + memory.misses;
        let (hit_rate, miss_rate) = if lookups == 0 {
            (0.0, 0.0)
        } else {
            (served as f64 / lookups as f64, memory.misses as f64 / lookups as f64)
        };
        CacheStats {
            total_entries: memory.entries.len(),
            total_size_bytes: memory.total_bytes,
            hit_rate,
            miss_rate,
            evictions: memory.evictions,
            hits: memory.hits,
            stale_hits: memory.stale_hits,
            misses: memory.misses,
            expirations: memory.expirations,
        }
    }

    /// Purges every entry that can no longer be served, whether or not
    /// anyone asks for it. Returns how many memory entries were dropped.
    pub async fn sweep(&self) -> usize {
        let now = self.clock.now();
        let purged = {
            let mut memory = self.memory.lock().await;
            let purged = memory
                .remove_where(|e| self.is_dead(e.freshness(now)))
                .len();
            memory.expirations += purged as u64;
            purged
        };

        if let Some(store) = &self.durable {
            if let Err(err) = store.purge(now, self.config.stale_while_revalidate).await {
                warn!(%err, "durable cache sweep failed");
            }
        }
        if purged > 0 {
            debug!(purged, "cache sweep purged dead entries");
        }
        purged
    }

    /// Runs [`sweep`](Self::sweep) every `sweep_interval` until the cache is
    /// dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.sweep_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(cache) = weak.upgrade() else { break };
                cache.sweep().await;
            }
        })
    }

    /// Claims the right to refresh `key`. Returns `None` while another
    /// refresh for the same key is in flight.
    pub fn try_begin_refresh(self: &Arc<Self>, key: &str) -> Option<RefreshGuard> {
        let mut refreshing = self.refreshing.lock().unwrap_or_else(|e| e.into_inner());
        if !refreshing.insert(key.to_string()) {
            return None;
        }
        Some(RefreshGuard {
            cache: Arc::clone(self),
            key: key.to_string(),
        })
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn durable_load(&self, key: &str) -> Option<PersistedEntry> {
        let store = self.durable.as_ref()?;
        match store.load(key).await {
            Ok(record) => record,
            Err(err) => {
                warn!(key, %err, "durable cache read failed, treating as miss");
                None
            }
        }
    }

    async fn durable_remove(&self, key: &str) -> bool {
        let Some(store) = &self.durable else {
            return false;
        };
        match store.remove(key).await {
            Ok(removed) => removed,
            Err(err) => {
                warn!(key, %err, "durable cache delete failed");
                false
            }
        }
    }
}

/// Marks a key as being refreshed; released on drop.
pub struct RefreshGuard {
    cache: Arc<TieredCache>,
    key: String,
}

impl RefreshGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        let mut refreshing = self.cache.refreshing.lock().unwrap_or_else(|e| e.into_inner());
        refreshing.remove(&self.key);
    }
}
