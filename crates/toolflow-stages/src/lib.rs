//! toolflow stages: the eleven pipeline stages and what they talk to.
//!
//! # Pipeline Flow
//!
//! ```text
//! AgentsMD → RepoFacts → Documentation → SemanticSearch → Snippet
//!     ↓          ↓            ↓ (cache)          ↓            ↓
//! directives  facts       docs per fw        hits        snippets
//!
//!   → Plan → Edit → Validate → Gate → Document → Learn
//!      ↓       ↓        ↓         ↓        ↓         ↓
//!    plan    diff   report    verdict   summary   (queued)
//! ```
//!
//! In [`default_registry`] the facts, docs and search lookups start during
//! AgentsMD (see [`prefetch`]); their stages keep their place in the order
//! and account for the results.
//!
//! Stages talk to the outside world only through the traits in
//! [`collaborators`]. [`local`], [`manifest`] and [`http_docs`] provide
//! implementations backed by a workspace directory and an HTTP docs service.

pub mod change;
pub mod collaborators;
pub mod docs;
pub mod http_docs;
pub mod local;
pub mod manifest;
pub mod plan;
pub mod prefetch;
pub mod report;
pub mod retrieval;

pub use change::{EditStage, GateStage, ValidateStage};
pub use collaborators::{
    AppliedDiff, Collaborators, DirectiveProvider, DocumentationProvider, Editor, FileDiff, FileReader,
    LessonPattern, LessonStore, RepoFactDetector, SearchHit, SemanticSearch, ValidationReport, Validator,
};
pub use docs::{DocSource, DocumentationStage, FrameworkDocs};
pub use http_docs::HttpDocumentationProvider;
pub use local::{DryRunEditor, FsDirectiveProvider, FsFileReader, JsonlLessonStore, KeywordSearch};
pub use manifest::{manifest_detectors, ManifestValidator};
pub use plan::{Plan, PlanStage, PlanStep};
pub use prefetch::{ContextPrefetch, Prefetched};
pub use report::{DocumentStage, LearnStage};
pub use retrieval::{AgentsMdStage, FileSnippet, RepoFactsStage, SemanticSearchStage, SnippetStage};

use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use toolflow_cache::TieredCache;
use toolflow_core::{EngineError, ServiceError, StageError, StageRegistry};
use tracing::warn;

/// Context data keys written by the stages.
pub mod keys {
    pub const DIRECTIVES: &str = "directives";
    pub const PREFETCHED: &str = "prefetched";
    pub const REPO_FACTS: &str = "repo_facts";
    pub const PROJECT_SIGNATURE: &str = "project_signature";
    pub const DOCUMENTATION: &str = "documentation";
    pub const SEARCH_HITS: &str = "search_hits";
    pub const SNIPPETS: &str = "snippets";
    pub const PLAN: &str = "plan";
    pub const DIFF: &str = "diff";
    pub const VALIDATION: &str = "validation";
    pub const VERDICT: &str = "verdict";
    pub const SUMMARY: &str = "summary";
    pub const LESSON_QUEUED: &str = "lesson_queued";
}

/// Rough token count: four characters per token.
pub(crate) fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

pub(crate) fn to_value<T: Serialize>(value: &T) -> Result<Value, StageError> {
    serde_json::to_value(value).map_err(|e| StageError::ExecutionFailed(e.to_string()))
}

/// Keeps the successful results of a fan-out. Fails with the first error
/// only when nothing succeeded.
pub(crate) fn gather<T>(results: Vec<Result<T, ServiceError>>, source: &str) -> Result<Vec<T>, StageError> {
    let mut ok = Vec::with_capacity(results.len());
    let mut first_err = None;
    for result in results {
        match result {
            Ok(value) => ok.push(value),
            Err(err) => {
                warn!(source, %err, "collaborator call failed");
                first_err.get_or_insert(err);
            }
        }
    }
    match first_err {
        Some(err) if ok.is_empty() => Err(err.into()),
        _ => Ok(ok),
    }
}

/// Registry holding all eleven stages wired to `collaborators`, with the
/// documentation stage fronted by `cache`.
pub fn default_registry(collaborators: Collaborators, cache: Arc<TieredCache>) -> Result<StageRegistry, EngineError> {
    let facts = Arc::new(RepoFactsStage::new(collaborators.detectors));
    let docs = Arc::new(DocumentationStage::new(collaborators.docs, cache));
    let search = Arc::new(SemanticSearchStage::new(collaborators.search));
    let prefetch = ContextPrefetch::new(Arc::clone(&facts), Arc::clone(&docs), Arc::clone(&search));

    let mut registry =
        StageRegistry::new().with_stage(AgentsMdStage::new(collaborators.directives).with_prefetch(prefetch))?;
    registry.register(facts)?;
    registry.register(docs)?;
    registry.register(search)?;
    registry
        .with_stage(SnippetStage::new(collaborators.reader))?
        .with_stage(PlanStage::new())?
        .with_stage(EditStage::new(collaborators.editor))?
        .with_stage(ValidateStage::new(collaborators.validator))?
        .with_stage(GateStage::new())?
        .with_stage(DocumentStage::new())?
        .with_stage(LearnStage::new(collaborators.lessons))
}

/// Collaborators for a workspace on disk. Lessons go to
/// `<root>/.toolflow/lessons.jsonl`.
pub fn local_collaborators(root: &Path, docs: Arc<dyn DocumentationProvider>) -> Collaborators {
    Collaborators {
        directives: vec![Arc::new(FsDirectiveProvider::new(root))],
        detectors: manifest_detectors(root),
        docs,
        search: Arc::new(KeywordSearch::new(root)),
        reader: Arc::new(FsFileReader::new(root)),
        editor: Arc::new(DryRunEditor::new(root)),
        validator: Arc::new(ManifestValidator::new(root)),
        lessons: Arc::new(JsonlLessonStore::new(root.join(".toolflow").join("lessons.jsonl"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn test_gather_keeps_partial_success() {
        let results = vec![Ok(1), Err(ServiceError::Timeout("slow".into())), Ok(3)];
        assert_eq!(gather(results, "test").unwrap(), vec![1, 3]);
    }

    #[test]
    fn test_gather_fails_when_all_fail() {
        let results: Vec<Result<u8, _>> = vec![
            Err(ServiceError::RateLimited("429".into())),
            Err(ServiceError::Unavailable("down".into())),
        ];
        let err = gather(results, "test").unwrap_err();
        assert_eq!(err, StageError::Service(ServiceError::RateLimited("429".into())));
    }
}
