//! Cache entries and their freshness windows
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Where an entry stands at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Before `expires_at`.
    Fresh,
    /// Between `expires_at` and `stale_until`; servable only under SWR.
    Stale,
    /// Past `stale_until`; never servable.
    Dead,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub key: String,
    pub value: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub stale_until: DateTime<Utc>,
    pub tags: BTreeSet<String>,
    pub size_bytes: u64,
    pub access_count: u64,
    pub last_accessed: DateTime<Utc>,
    /// Tie-breaker for entries touched within the same clock instant.
    #[serde(skip)]
    pub(crate) access_seq: u64,
}

impl CacheEntry {
    pub fn freshness(&self, now: DateTime<Utc>) -> Freshness {
        if now < self.expires_at {
            Freshness::Fresh
        } else if now < self.stale_until {
            Freshness::Stale
        } else {
            Freshness::Dead
        }
    }

    pub(crate) fn touch(&mut self, now: DateTime<Utc>, seq: u64) {
        self.access_count += 1;
        self.last_accessed = now;
        self.access_seq = seq;
    }

    /// Ordering key for LRU eviction: smallest is evicted first.
    pub(crate) fn lru_key(&self) -> (DateTime<Utc>, u64) {
        (self.last_accessed, self.access_seq)
    }
}

/// Byte footprint charged against the memory ceiling.
pub fn entry_size(key: &str, value: &str, tags: &BTreeSet<String>) -> u64 {
    (key.len() + value.len() + tags.iter().map(String::len).sum::<usize>()) as u64
}

/// The durable-tier record: an entry without its access bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedEntry {
    pub key: String,
    pub value: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub stale_until: DateTime<Utc>,
    pub tags: BTreeSet<String>,
    pub size_bytes: u64,
}

impl PersistedEntry {
    pub fn freshness(&self, now: DateTime<Utc>) -> Freshness {
        if now < self.expires_at {
            Freshness::Fresh
        } else if now < self.stale_until {
            Freshness::Stale
        } else {
            Freshness::Dead
        }
    }

    pub(crate) fn into_entry(self, now: DateTime<Utc>, seq: u64) -> CacheEntry {
        CacheEntry {
            key: self.key,
            value: self.value,
            created_at: self.created_at,
            expires_at: self.expires_at,
            stale_until: self.stale_until,
            tags: self.tags,
            size_bytes: self.size_bytes,
            access_count: 0,
            last_accessed: now,
            access_seq: seq,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(now: DateTime<Utc>) -> CacheEntry {
        CacheEntry {
            key: "k".into(),
            value: "v".into(),
            created_at: now,
            expires_at: now + Duration::seconds(10),
            stale_until: now + Duration::seconds(20),
            tags: BTreeSet::new(),
            size_bytes: 2,
            access_count: 0,
            last_accessed: now,
            access_seq: 0,
        }
    }

    #[test]
    fn test_freshness_windows() {
        let now = Utc::now();
        let e = entry(now);
        assert_eq!(e.freshness(now), Freshness::Fresh);
        assert_eq!(e.freshness(now + Duration::seconds(10)), Freshness::Stale);
        assert_eq!(e.freshness(now + Duration::seconds(19)), Freshness::Stale);
        assert_eq!(e.freshness(now + Duration::seconds(20)), Freshness::Dead);
    }

    #[test]
    fn test_touch_updates_lru_key() {
        let now = Utc::now();
        let mut e = entry(now);
        e.touch(now + Duration::seconds(1), 7);
        assert_eq!(e.access_count, 1);
        assert_eq!(e.lru_key(), (now + Duration::seconds(1), 7));
    }

    #[test]
    fn test_entry_size_counts_tags() {
        let tags: BTreeSet<String> = ["react".to_string()].into_iter().collect();
        assert_eq!(entry_size("key", "value", &tags), 3 + 5 + 5);
    }
}
