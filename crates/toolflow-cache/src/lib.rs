//! toolflow cache: two-tier documentation cache
//!
//! An in-process LRU map sits in front of an optional durable store. Entries
//! carry a TTL, an optional stale-while-revalidate window capped by a max
//! age, and a tag set for bulk invalidation. Keys are partitioned by project
//! signature so a dependency change can drop a whole project at once.

pub mod clock;
pub mod config;
pub mod entry;
pub mod error;
pub mod key;
pub mod store;
pub mod tiered;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CacheConfig;
pub use entry::{CacheEntry, Freshness, PersistedEntry};
pub use error::CacheError;
pub use key::{doc_cache_key, partition_of, project_signature};
pub use store::{DurableStore, FileStore, MemoryStore};
pub use tiered::{CacheStats, Lookup, RefreshGuard, TieredCache};
