//! Contracts of the external services the stages call.
//!
//! Every call may be slow and may fail; failures come back as
//! [`ServiceError`] so stages can tell transient trouble from refusals.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use toolflow_core::ServiceError;
use toolflow_policy::{DiffMetrics, FileChange};

use crate::plan::Plan;

/// A source of agent directives, e.g. AGENTS.md files.
#[async_trait]
pub trait DirectiveProvider: Send + Sync {
    async fn read(&self) -> Result<Vec<String>, ServiceError>;
}

/// Detects technology facts about the repository, such as
/// `lang:rust` or `framework:axum`.
#[async_trait]
pub trait RepoFactDetector: Send + Sync {
    async fn detect(&self) -> Result<BTreeSet<String>, ServiceError>;
}

#[async_trait]
pub trait DocumentationProvider: Send + Sync {
    async fn query(&self, framework: &str, query: &str) -> Result<String, ServiceError>;
}

#[async_trait]
pub trait SemanticSearch: Send + Sync {
    /// Ranked hits, best first, at most `limit`.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, ServiceError>;
}

#[async_trait]
pub trait FileReader: Send + Sync {
    /// File contents truncated to a bounded preview.
    async fn read(&self, path: &str) -> Result<String, ServiceError>;
}

#[async_trait]
pub trait Editor: Send + Sync {
    async fn apply(&self, plan: &Plan) -> Result<AppliedDiff, ServiceError>;
}

#[async_trait]
pub trait Validator: Send + Sync {
    async fn check(&self, diff: &AppliedDiff) -> Result<ValidationReport, ServiceError>;
}

/// Sink for learned patterns. Returns the stored lesson's id.
#[async_trait]
pub trait LessonStore: Send + Sync {
    async fn record(&self, pattern: &LessonPattern) -> Result<String, ServiceError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub path: String,
    #[serde(default)]
    pub line: u32,
    pub score: f32,
    #[serde(default)]
    pub preview: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDiff {
    pub path: String,
    pub hunks: u32,
    pub lines_changed: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedDiff {
    pub summary: String,
    pub files: Vec<FileDiff>,
}

impl AppliedDiff {
    /// Metrics for the scope gate.
    pub fn metrics(&self) -> DiffMetrics {
        DiffMetrics {
            files: self
                .files
                .iter()
                .map(|f| FileChange::new(f.path.clone(), f.lines_changed, f.hunks))
                .collect(),
            validation_passed: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub passed: bool,
    #[serde(default)]
    pub details: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LessonPattern {
    pub tool_name: String,
    pub request_id: String,
    pub goal: String,
    pub files: Vec<String>,
    pub outcome: String,
}

/// Everything the default stage set talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub directives: Vec<Arc<dyn DirectiveProvider>>,
    pub detectors: Vec<Arc<dyn RepoFactDetector>>,
    pub docs: Arc<dyn DocumentationProvider>,
    pub search: Arc<dyn SemanticSearch>,
    pub reader: Arc<dyn FileReader>,
    pub editor: Arc<dyn Editor>,
    pub validator: Arc<dyn Validator>,
    pub lessons: Arc<dyn LessonStore>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("directives", &self.directives.len())
            .field("detectors", &self.detectors.len())
            .finish_non_exhaustive()
    }
}
