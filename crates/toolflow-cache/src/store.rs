//! Durable tier: the slower key/value sink behind the in-process map.
//!
//! Stores are single-writer per process. Sharing one directory between
//! processes needs external locking; nothing here coordinates across them.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::warn;

use crate::entry::{Freshness, PersistedEntry};
use crate::error::CacheError;
use crate::key::partition_of;

#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<PersistedEntry>, CacheError>;

    async fn store(&self, entry: &PersistedEntry) -> Result<(), CacheError>;

    async fn remove(&self, key: &str) -> Result<bool, CacheError>;

    /// Removes every record tagged `tag`; returns the removed keys.
    async fn remove_by_tag(&self, tag: &str) -> Result<Vec<String>, CacheError>;

    /// Drops a whole partition; returns the removed keys.
    async fn remove_partition(&self, partition: &str) -> Result<Vec<String>, CacheError>;

    /// Removes records that can no longer be served at `now`. With
    /// `honor_stale` a record lives until `stale_until`, else `expires_at`.
    async fn purge(&self, now: DateTime<Utc>, honor_stale: bool) -> Result<usize, CacheError>;

    async fn clear(&self) -> Result<(), CacheError>;
}

pub(crate) fn is_dead(record: &PersistedEntry, now: DateTime<Utc>, honor_stale: bool) -> bool {
    match record.freshness(now) {
        Freshness::Fresh => false,
        Freshness::Stale => !honor_stale,
        Freshness::Dead => true,
    }
}

// ============================================================================
// IN-MEMORY STORE
// ============================================================================

/// Durable-tier stand-in that lives in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, PersistedEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn load(&self, key: &str) -> Result<Option<PersistedEntry>, CacheError> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn store(&self, entry: &PersistedEntry) -> Result<(), CacheError> {
        self.records.write().await.insert(entry.key.clone(), entry.clone());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.records.write().await.remove(key).is_some())
    }

    async fn remove_by_tag(&self, tag: &str) -> Result<Vec<String>, CacheError> {
        let mut records = self.records.write().await;
        let keys: Vec<String> = records
            .values()
            .filter(|r| r.tags.contains(tag))
            .map(|r| r.key.clone())
            .collect();
        for key in &keys {
            records.remove(key);
        }
        Ok(keys)
    }

    async fn remove_partition(&self, partition: &str) -> Result<Vec<String>, CacheError> {
        let mut records = self.records.write().await;
        let keys: Vec<String> = records
            .keys()
            .filter(|k| partition_of(k) == partition)
            .cloned()
            .collect();
        for key in &keys {
            records.remove(key);
        }
        Ok(keys)
    }

    async fn purge(&self, now: DateTime<Utc>, honor_stale: bool) -> Result<usize, CacheError> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, r| !is_dead(r, now, honor_stale));
        Ok(before - records.len())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.records.write().await.clear();
        Ok(())
    }
}

// ============================================================================
// FILE STORE
// ============================================================================

/// One JSON file per record, one directory per partition:
/// `<root>/<partition>/<blake3(key)>.json`.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn partition_dir(&self, partition: &str) -> PathBuf {
        let safe: String = partition
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.root.join(safe)
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.partition_dir(partition_of(key))
            .join(format!("{}.json", blake3::hash(key.as_bytes()).to_hex()))
    }

    async fn read_record(path: &Path) -> Result<Option<PersistedEntry>, CacheError> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&bytes) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                warn!(path = %path.display(), %err, "cache record corrupted, discarding");
                let _ = fs::remove_file(path).await;
                Ok(None)
            }
        }
    }

    async fn remove_path(path: &Path) -> Result<bool, CacheError> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Every record file with its parsed record.
    async fn scan(&self) -> Result<Vec<(PathBuf, PersistedEntry)>, CacheError> {
        let mut found = Vec::new();
        let mut partitions = fs::read_dir(&self.root).await?;
        while let Some(partition) = partitions.next_entry().await? {
            if !partition.file_type().await?.is_dir() {
                continue;
            }
            let mut files = fs::read_dir(partition.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let path = file.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                if let Some(record) = Self::read_record(&path).await? {
                    found.push((path, record));
                }
            }
        }
        Ok(found)
    }

    /// Deletes the record files in one partition directory and returns their
    /// keys. Anything else in the directory is left alone; the directory is
    /// removed only once it is empty.
    async fn sweep_dir(dir: &Path) -> Result<Vec<String>, CacheError> {
        let mut removed = Vec::new();
        let mut files = match fs::read_dir(dir).await {
            Ok(files) => files,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(removed),
            Err(e) => return Err(e.into()),
        };
        while let Some(file) = files.next_entry().await? {
            let path = file.path();
            if !file.file_type().await?.is_file() {
                continue;
            }
            let name = file.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(".json.tmp") {
                Self::remove_path(&path).await?;
            } else if name.ends_with(".json") {
                if let Some(record) = Self::read_record(&path).await? {
                    removed.push(record.key);
                }
                Self::remove_path(&path).await?;
            }
        }
        // Fails when foreign files remain, which is fine.
        let _ = fs::remove_dir(dir).await;
        Ok(removed)
    }

    async fn remove_matching(
        &self,
        pred: impl Fn(&PersistedEntry) -> bool + Send,
    ) -> Result<Vec<String>, CacheError> {
        let mut removed = Vec::new();
        for (path, record) in self.scan().await? {
            if pred(&record) && Self::remove_path(&path).await? {
                removed.push(record.key);
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl DurableStore for FileStore {
    async fn load(&self, key: &str) -> Result<Option<PersistedEntry>, CacheError> {
        let record = Self::read_record(&self.record_path(key)).await?;
        // Digest collisions are not expected, but never serve another key.
        Ok(record.filter(|r| r.key == key))
    }

    async fn store(&self, entry: &PersistedEntry) -> Result<(), CacheError> {
        let path = self.record_path(&entry.key);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(entry)?).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, CacheError> {
        Self::remove_path(&self.record_path(key)).await
    }

    async fn remove_by_tag(&self, tag: &str) -> Result<Vec<String>, CacheError> {
        self.remove_matching(|r| r.tags.contains(tag)).await
    }

    async fn remove_partition(&self, partition: &str) -> Result<Vec<String>, CacheError> {
        Self::sweep_dir(&self.partition_dir(partition)).await
    }

    async fn purge(&self, now: DateTime<Utc>, honor_stale: bool) -> Result<usize, CacheError> {
        Ok(self.remove_matching(|r| is_dead(r, now, honor_stale)).await?.len())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        let mut partitions = fs::read_dir(&self.root).await?;
        while let Some(partition) = partitions.next_entry().await? {
            if partition.file_type().await?.is_dir() {
                Self::sweep_dir(&partition.path()).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::collections::BTreeSet;

    fn record(key: &str, tags: &[&str], now: DateTime<Utc>, ttl_secs: i64) -> PersistedEntry {
        PersistedEntry {
            key: key.to_string(),
            value: format!("docs for {}", key),
            created_at: now,
            expires_at: now + Duration::seconds(ttl_secs),
            stale_until: now + Duration::seconds(ttl_secs * 2),
            tags: tags.iter().map(|t| t.to_string()).collect::<BTreeSet<_>>(),
            size_bytes: 10,
        }
    }

    #[tokio::test]
    async fn test_memory_store_tag_and_partition_removal() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.store(&record("p1:a", &["react"], now, 60)).await.unwrap();
        store.store(&record("p1:b", &["vue"], now, 60)).await.unwrap();
        store.store(&record("p2:c", &["react"], now, 60)).await.unwrap();

        let mut removed = store.remove_by_tag("react").await.unwrap();
        removed.sort();
        assert_eq!(removed, vec!["p1:a".to_string(), "p2:c".to_string()]);

        assert_eq!(store.remove_partition("p1").await.unwrap(), vec!["p1:b".to_string()]);
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_file_store_round_trip_and_partition() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("cache")).await.unwrap();
        let now = Utc::now();

        store.store(&record("sig1:a", &["react"], now, 60)).await.unwrap();
        store.store(&record("sig2:b", &["react"], now, 60)).await.unwrap();

        let loaded = store.load("sig1:a").await.unwrap().unwrap();
        assert_eq!(loaded.value, "docs for sig1:a");
        assert!(store.root().join("sig1").is_dir());

        assert_eq!(store.remove_partition("sig1").await.unwrap(), vec!["sig1:a".to_string()]);
        assert!(store.load("sig1:a").await.unwrap().is_none());
        assert!(store.load("sig2:b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_file_store_discards_corrupt_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        let path = store.record_path("p:broken");
        fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        fs::write(&path, b"{not json").await.unwrap();

        assert!(store.load("p:broken").await.unwrap().is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_file_store_clear_keeps_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "keep me").unwrap();
        std::fs::create_dir_all(dir.path().join("project")).unwrap();
        std::fs::write(dir.path().join("project/main.rs"), "fn main() {}").unwrap();

        let store = FileStore::open(dir.path()).await.unwrap();
        let now = Utc::now();
        store.store(&record("sig1:a", &[], now, 60)).await.unwrap();
        store.store(&record("project:b", &[], now, 60)).await.unwrap();
        fs::write(store.root().join("sig1/leftover.json.tmp"), b"{").await.unwrap();

        store.clear().await.unwrap();

        assert!(store.load("sig1:a").await.unwrap().is_none());
        assert!(store.load("project:b").await.unwrap().is_none());
        assert!(!dir.path().join("sig1").exists());
        assert!(dir.path().join("notes.txt").is_file());
        assert_eq!(std::fs::read_to_string(dir.path().join("project/main.rs")).unwrap(), "fn main() {}");
    }

    #[tokio::test]
    async fn test_file_store_partition_removal_keeps_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        store.store(&record("sig1:a", &[], Utc::now(), 60)).await.unwrap();
        std::fs::write(dir.path().join("sig1/README"), "hands off").unwrap();

        assert_eq!(store.remove_partition("sig1").await.unwrap(), vec!["sig1:a".to_string()]);
        assert!(dir.path().join("sig1/README").is_file());
    }

    #[tokio::test]
    async fn test_purge_respects_stale_window() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.store(&record("p:a", &[], now, 10)).await.unwrap();

        let later = now + Duration::seconds(15);
        assert_eq!(store.purge(later, true).await.unwrap(), 0);
        assert_eq!(store.purge(later, false).await.unwrap(), 1);
    }
}
