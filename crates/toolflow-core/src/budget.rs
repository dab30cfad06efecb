//! Budget and Scope: per-run ceilings
//!
//! A `Budget` caps what a run may consume; `BudgetUsage` is what it has
//! consumed so far. `Scope` bounds what the editing stages may touch.
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Resource ceilings for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Budget {
    pub time_ms: u64,
    pub tokens: u64,
    pub chunks: u64,
    pub files: u64,
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            time_ms: 120_000,
            tokens: 50_000,
            chunks: 40,
            files: 20,
        }
    }
}

impl Budget {
    /// Remaining headroom after `used`, clamped at zero.
    pub fn remaining(&self, used: &BudgetUsage) -> Budget {
        Budget {
            time_ms: self.time_ms.saturating_sub(used.time_ms),
            tokens: self.tokens.saturating_sub(used.tokens),
            chunks: self.chunks.saturating_sub(used.chunks),
            files: self.files.saturating_sub(used.files),
        }
    }

    /// The first hard ceiling `used` has reached, if any.
    ///
    /// Only time and tokens stop a run. Chunks and files are allocation
    /// ceilings that stages clamp their own work against.
    pub fn exhausted_by(&self, used: &BudgetUsage) -> Option<BudgetResource> {
        if used.time_ms >= self.time_ms {
            Some(BudgetResource::Time)
        } else if used.tokens >= self.tokens {
            Some(BudgetResource::Tokens)
        } else {
            None
        }
    }

    pub fn merge(mut self, other: &BudgetOverride) -> Self {
        if let Some(v) = other.time_ms { self.time_ms = v; }
        if let Some(v) = other.tokens { self.tokens = v; }
        if let Some(v) = other.chunks { self.chunks = v; }
        if let Some(v) = other.files { self.files = v; }
        self
    }
}

/// Partial budget supplied by a caller; set fields take precedence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetOverride {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunks: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<u64>,
}

/// Consumption counters. Also used as a stage's static cost estimate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetUsage {
    pub time_ms: u64,
    pub tokens: u64,
    pub chunks: u64,
    pub files: u64,
}

impl BudgetUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn with_chunks(mut self, chunks: u64) -> Self {
        self.chunks = chunks;
        self
    }

    pub fn with_files(mut self, files: u64) -> Self {
        self.files = files;
        self
    }

    pub fn with_time(mut self, ms: u64) -> Self {
        self.time_ms = ms;
        self
    }

    /// Adds the non-time counters of `other`. Time is tracked by the engine
    /// from the wall clock, never from stage reports.
    pub fn absorb(&mut self, other: &BudgetUsage) {
        self.tokens = self.tokens.saturating_add(other.tokens);
        self.chunks = self.chunks.saturating_add(other.chunks);
        self.files = self.files.saturating_add(other.files);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetResource {
    Time,
    Tokens,
}

impl std::fmt::Display for BudgetResource {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Time => write!(f, "time"),
            Self::Tokens => write!(f, "tokens"),
        }
    }
}

/// Static limits on what editing stages may touch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Scope {
    pub max_files: u32,
    pub max_lines_per_file: u32,
    pub max_hunks_per_file: u32,
    /// Extensions without the leading dot. Empty means any type.
    pub allowed_file_types: BTreeSet<String>,
    /// Path prefixes that must never be touched.
    pub excluded_paths: BTreeSet<String>,
}

impl Default for Scope {
    fn default() -> Self {
        Self {
            max_files: 5,
            max_lines_per_file: 200,
            max_hunks_per_file: 10,
            allowed_file_types: ["rs", "ts", "tsx", "js", "jsx", "py", "go", "md", "toml", "json", "yaml"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            excluded_paths: [".git", "node_modules", "target", ".env"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl Scope {
    /// Whether `path` has an allowed extension and is outside every
    /// excluded prefix.
    pub fn permits(&self, path: &str) -> bool {
        !self.is_excluded(path) && self.type_allowed(path)
    }

    pub fn is_excluded(&self, path: &str) -> bool {
        let normalized = path.trim_start_matches("./");
        self.excluded_paths.iter().any(|prefix| {
            normalized == prefix
                || normalized.starts_with(&format!("{}/", prefix.trim_end_matches('/')))
                || normalized.split('/').any(|segment| segment == prefix)
        })
    }

    pub fn type_allowed(&self, path: &str) -> bool {
        if self.allowed_file_types.is_empty() {
            return true;
        }
        let file_name = path.rsplit('/').next().unwrap_or(path);
        match file_name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => self.allowed_file_types.contains(ext),
            _ => false,
        }
    }

    pub fn merge(mut self, other: &ScopeOverride) -> Self {
        if let Some(v) = other.max_files { self.max_files = v; }
        if let Some(v) = other.max_lines_per_file { self.max_lines_per_file = v; }
        if let Some(v) = other.max_hunks_per_file { self.max_hunks_per_file = v; }
        if let Some(v) = &other.allowed_file_types { self.allowed_file_types = v.clone(); }
        if let Some(v) = &other.excluded_paths { self.excluded_paths = v.clone(); }
        self
    }
}

/// Partial scope supplied by a caller; set fields take precedence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeOverride {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_files: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_lines_per_file: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_hunks_per_file: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_file_types: Option<BTreeSet<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excluded_paths: Option<BTreeSet<String>>,
}
