use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::CacheError;

const HOUR: u64 = 60 * 60;
const DAY: u64 = 24 * HOUR;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    /// Entry-count ceiling of the in-process tier.
    pub max_memory_entries: usize,
    /// Aggregate byte ceiling of the in-process tier.
    pub max_memory_bytes: u64,
    pub default_ttl_secs: u64,
    pub stale_while_revalidate: bool,
    /// How long past expiry a stale entry may still be served.
    pub stale_while_revalidate_secs: u64,
    /// Hard ceiling on entry age, even under stale-while-revalidate.
    pub max_age_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_memory_entries: 1_000,
            max_memory_bytes: 64 * 1024 * 1024,
            default_ttl_secs: DAY,
            stale_while_revalidate: true,
            stale_while_revalidate_secs: 7 * DAY,
            max_age_secs: 30 * DAY,
            sweep_interval_secs: 5 * 60,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.default_ttl_secs == 0 {
            return Err(CacheError::Config("defaultTtlSecs must be > 0".into()));
        }
        if self.max_age_secs < self.default_ttl_secs {
            return Err(CacheError::Config("maxAgeSecs must be >= defaultTtlSecs".into()));
        }
        if self.max_memory_entries == 0 {
            return Err(CacheError::Config("maxMemoryEntries must be > 0".into()));
        }
        if self.max_memory_bytes == 0 {
            return Err(CacheError::Config("maxMemoryBytes must be > 0".into()));
        }
        Ok(())
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn swr_window(&self) -> Duration {
        Duration::from_secs(self.stale_while_revalidate_secs)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}
