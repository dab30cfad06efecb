//! Server configuration: a YAML file with `engine` and `cache` sections, plus
//! environment variables for everything deployment-specific.
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use toolflow_cache::CacheConfig;
use toolflow_core::EngineConfig;

use crate::error::ApiError;

pub const DEFAULT_ADDR: &str = "0.0.0.0:8787";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub engine: EngineConfig,
    pub cache: CacheConfig,
}

impl FileConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, ApiError> {
        let config: Self = serde_yaml::from_str(yaml).map_err(|e| ApiError::Config(e.to_string()))?;
        config.engine.validate().map_err(|e| ApiError::Config(e.to_string()))?;
        config.cache.validate().map_err(|e| ApiError::Config(e.to_string()))?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ApiError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ApiError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_yaml(&text)
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: String,
    pub file: FileConfig,
    /// Root the local collaborators work in.
    pub workspace: PathBuf,
    /// Directory of the file-backed durable cache tier. Memory only when unset.
    pub cache_dir: Option<PathBuf>,
    /// Base URL of the HTTP documentation provider.
    pub docs_url: Option<String>,
}

impl ServerConfig {
    /// Reads `TOOLFLOW_ADDR`, `TOOLFLOW_CONFIG`, `TOOLFLOW_WORKSPACE`,
    /// `TOOLFLOW_CACHE_DIR` and `TOOLFLOW_DOCS_URL`.
    pub fn from_env() -> Result<Self, ApiError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self, ApiError> {
        let file = match var("TOOLFLOW_CONFIG") {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        let workspace = match var("TOOLFLOW_WORKSPACE") {
            Some(dir) => PathBuf::from(dir),
            None => std::env::current_dir().map_err(|e| ApiError::Config(format!("current dir: {}", e)))?,
        };
        Ok(Self {
            addr: var("TOOLFLOW_ADDR").unwrap_or_else(|| DEFAULT_ADDR.to_string()),
            file,
            workspace,
            cache_dir: var("TOOLFLOW_CACHE_DIR").map(PathBuf::from),
            docs_url: var("TOOLFLOW_DOCS_URL").filter(|u| !u.trim().is_empty()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_config() {
        let yaml = r#"
engine:
  maxRetries: 1
cache:
  maxMemoryEntries: 10
  staleWhileRevalidate: false
"#;
        let config = FileConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.engine.max_retries, 1);
        assert_eq!(config.cache.max_memory_entries, 10);
        assert!(!config.cache.stale_while_revalidate);
        assert_eq!(config.cache.default_ttl_secs, CacheConfig::default().default_ttl_secs);
    }

    #[test]
    fn test_invalid_engine_section_rejected() {
        let yaml = "engine:\n  defaultBudget: {timeMs: 0}\n";
        assert!(matches!(FileConfig::from_yaml(yaml), Err(ApiError::Config(_))));
    }

    #[test]
    fn test_invalid_cache_section_rejected() {
        let yaml = "cache:\n  maxAgeSecs: 0\n";
        assert!(matches!(FileConfig::from_yaml(yaml), Err(ApiError::Config(_))));

        let yaml = "cache:\n  defaultTtlSecs: 0\n";
        assert!(matches!(FileConfig::from_yaml(yaml), Err(ApiError::Config(_))));
    }

    #[test]
    fn test_env_lookup_defaults() {
        let config = ServerConfig::from_lookup(|name| match name {
            "TOOLFLOW_WORKSPACE" => Some("/srv/repo".to_string()),
            "TOOLFLOW_DOCS_URL" => Some("  ".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.addr, DEFAULT_ADDR);
        assert_eq!(config.workspace, PathBuf::from("/srv/repo"));
        assert!(config.cache_dir.is_none());
        assert!(config.docs_url.is_none());
    }
}
