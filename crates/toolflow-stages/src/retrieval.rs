//! Context retrieval stages: directives, repo facts, search hits and file
//! snippets. Each fans its collaborator calls out concurrently and keeps
//! whatever came back, failing only when every call failed. With a
//! [`ContextPrefetch`] the AgentsMD stage also starts the facts, docs and
//! search lookups, and the later stages consume what it gathered.

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use toolflow_cache::project_signature;
use toolflow_core::{BudgetUsage, RunContext, Stage, StageError, StageId, StagePatch};
use tracing::debug;

use crate::collaborators::{DirectiveProvider, FileReader, RepoFactDetector, SearchHit, SemanticSearch};
use crate::prefetch::{ContextPrefetch, Prefetched};
use crate::{estimate_tokens, gather, keys, to_value};

// ============================================================================
// AGENTS.MD
// ============================================================================

pub struct AgentsMdStage {
    providers: Vec<Arc<dyn DirectiveProvider>>,
    prefetch: Option<ContextPrefetch>,
}

impl AgentsMdStage {
    pub fn new(providers: Vec<Arc<dyn DirectiveProvider>>) -> Self {
        Self {
            providers,
            prefetch: None,
        }
    }

    /// Runs the facts, docs and search lookups alongside the directives.
    pub fn with_prefetch(mut self, prefetch: ContextPrefetch) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    async fn prefetch(&self, ctx: &RunContext) -> Option<Prefetched> {
        match &self.prefetch {
            Some(prefetch) => Some(prefetch.run(ctx).await),
            None => None,
        }
    }
}

#[async_trait]
impl Stage for AgentsMdStage {
    fn id(&self) -> StageId {
        StageId::AgentsMd
    }

    async fn execute(&self, ctx: &RunContext) -> Result<StagePatch, StageError> {
        let (results, prefetched) = tokio::join!(
            join_all(self.providers.iter().map(|p| p.read())),
            self.prefetch(ctx)
        );
        let batches = gather(results, "directive provider")?;

        let mut seen = HashSet::new();
        let directives: Vec<String> = batches
            .into_iter()
            .flatten()
            .filter(|d| seen.insert(d.clone()))
            .collect();
        let tokens = directives.iter().map(|d| estimate_tokens(d)).sum();

        let mut patch = StagePatch::new()
            .data(keys::DIRECTIVES, directives)
            .usage(BudgetUsage::new().with_tokens(tokens));
        if let Some(prefetched) = prefetched {
            patch = patch.data(keys::PREFETCHED, to_value(&prefetched)?);
        }
        Ok(patch)
    }

    fn cost_estimate(&self) -> BudgetUsage {
        BudgetUsage::new().with_tokens(500)
    }
}

// ============================================================================
// REPO FACTS
// ============================================================================

pub struct RepoFactsStage {
    detectors: Vec<Arc<dyn RepoFactDetector>>,
}

impl RepoFactsStage {
    pub fn new(detectors: Vec<Arc<dyn RepoFactDetector>>) -> Self {
        Self { detectors }
    }

    /// Facts from every detector, sorted and deduplicated.
    pub(crate) async fn detect(&self) -> Result<Vec<String>, StageError> {
        let results = join_all(self.detectors.iter().map(|d| d.detect())).await;
        let facts: BTreeSet<String> = gather(results, "repo fact detector")?
            .into_iter()
            .flatten()
            .collect();
        Ok(facts.into_iter().collect())
    }
}

#[async_trait]
impl Stage for RepoFactsStage {
    fn id(&self) -> StageId {
        StageId::RepoFacts
    }

    async fn execute(&self, ctx: &RunContext) -> Result<StagePatch, StageError> {
        let (facts, prefetched) = match Prefetched::from_ctx(ctx).repo_facts {
            Some(facts) => (facts, true),
            None => (self.detect().await?, false),
        };
        let signature = project_signature(facts.iter().map(String::as_str));
        debug!(facts = facts.len(), %signature, prefetched, "repo facts detected");

        Ok(StagePatch::new()
            .data(keys::REPO_FACTS, facts)
            .meta(keys::PROJECT_SIGNATURE, signature))
    }
}

// ============================================================================
// SEMANTIC SEARCH
// ============================================================================

pub struct SemanticSearchStage {
    search: Arc<dyn SemanticSearch>,
    max_hits: usize,
}

impl SemanticSearchStage {
    pub fn new(search: Arc<dyn SemanticSearch>) -> Self {
        Self { search, max_hits: 10 }
    }

    pub fn with_max_hits(mut self, max_hits: usize) -> Self {
        self.max_hits = max_hits;
        self
    }

    /// Queries and hit limit for this run; `None` when the chunk budget is
    /// spent.
    fn plan(&self, ctx: &RunContext) -> Result<Option<(Vec<String>, usize)>, StageError> {
        let queries = search_queries(ctx);
        if queries.is_empty() {
            return Err(StageError::InvalidInput(
                "request has no goal, query or queries to search for".into(),
            ));
        }
        let chunks_left = ctx.remaining().chunks as usize;
        if chunks_left == 0 {
            return Ok(None);
        }
        Ok(Some((queries, ctx.narrowed(self.max_hits.min(chunks_left)))))
    }

    async fn run_queries(&self, queries: &[String], limit: usize) -> Result<Vec<SearchHit>, StageError> {
        let results = join_all(queries.iter().map(|q| self.search.search(q, limit))).await;
        Ok(merge_hits(gather(results, "semantic search")?, limit))
    }

    /// Hits under the limit the budget allows now. The stage trims them
    /// again once earlier stages have charged their chunks.
    pub(crate) async fn prefetch(&self, ctx: &RunContext) -> Result<Option<Vec<SearchHit>>, StageError> {
        match self.plan(ctx)? {
            Some((queries, limit)) => Ok(Some(self.run_queries(&queries, limit).await?)),
            None => Ok(None),
        }
    }
}

/// `request.queries`, else `request.query`, else `request.goal`.
fn search_queries(ctx: &RunContext) -> Vec<String> {
    if let Some(queries) = ctx.request().get("queries").and_then(|v| v.as_array()) {
        let queries: Vec<String> = queries
            .iter()
            .filter_map(|q| q.as_str())
            .filter(|q| !q.trim().is_empty())
            .map(str::to_string)
            .collect();
        if !queries.is_empty() {
            return queries;
        }
    }
    ctx.request_str("query")
        .or_else(|| ctx.request_str("goal"))
        .filter(|q| !q.trim().is_empty())
        .map(|q| vec![q.to_string()])
        .unwrap_or_default()
}

/// Keeps the best-scored hit per location, best first.
fn merge_hits(batches: Vec<Vec<SearchHit>>, limit: usize) -> Vec<SearchHit> {
    let mut best: HashMap<(String, u32), SearchHit> = HashMap::new();
    for hit in batches.into_iter().flatten() {
        let slot = (hit.path.clone(), hit.line);
        match best.get(&slot) {
            Some(existing) if existing.score >= hit.score => {}
            _ => {
                best.insert(slot, hit);
            }
        }
    }
    let mut hits: Vec<SearchHit> = best.into_values().collect();
    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.path.cmp(&b.path))
            .then_with(|| a.line.cmp(&b.line))
    });
    hits.truncate(limit);
    hits
}

#[async_trait]
impl Stage for SemanticSearchStage {
    fn id(&self) -> StageId {
        StageId::SemanticSearch
    }

    async fn execute(&self, ctx: &RunContext) -> Result<StagePatch, StageError> {
        let Some((queries, limit)) = self.plan(ctx)? else {
            return Ok(StagePatch::new()
                .data(keys::SEARCH_HITS, Vec::<serde_json::Value>::new())
                .meta("search_skipped", "chunk budget exhausted"));
        };

        let (hits, prefetched) = match Prefetched::from_ctx(ctx).search_hits {
            Some(mut hits) => {
                hits.truncate(limit);
                (hits, true)
            }
            None => (self.run_queries(&queries, limit).await?, false),
        };
        debug!(queries = queries.len(), limit, hits = hits.len(), prefetched, "semantic search done");

        Ok(StagePatch::new()
            .data(keys::SEARCH_HITS, to_value(&hits)?)
            .meta("search_limit", limit)
            .usage(BudgetUsage::new().with_chunks(hits.len() as u64)))
    }

    fn cost_estimate(&self) -> BudgetUsage {
        BudgetUsage::new().with_chunks(self.max_hits as u64)
    }
}

// ============================================================================
// SNIPPET READ
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSnippet {
    pub path: String,
    pub content: String,
}

pub struct SnippetStage {
    reader: Arc<dyn FileReader>,
    max_files: usize,
}

impl SnippetStage {
    pub fn new(reader: Arc<dyn FileReader>) -> Self {
        Self { reader, max_files: 8 }
    }

    pub fn with_max_files(mut self, max_files: usize) -> Self {
        self.max_files = max_files;
        self
    }
}

#[async_trait]
impl Stage for SnippetStage {
    fn id(&self) -> StageId {
        StageId::Snippet
    }

    async fn execute(&self, ctx: &RunContext) -> Result<StagePatch, StageError> {
        let hits: Vec<SearchHit> = ctx.get_as(keys::SEARCH_HITS).unwrap_or_default();

        let mut seen = HashSet::new();
        let mut paths: Vec<String> = hits
            .into_iter()
            .map(|h| h.path)
            .filter(|p| !ctx.scope.is_excluded(p) && seen.insert(p.clone()))
            .collect();

        let files_left = ctx.remaining().files as usize;
        if paths.is_empty() || files_left == 0 {
            return Ok(StagePatch::new().data(keys::SNIPPETS, Vec::<serde_json::Value>::new()));
        }
        paths.truncate(ctx.narrowed(self.max_files.min(files_left)));

        let reads = paths.iter().map(|path| async move {
            self.reader.read(path).await.map(|content| FileSnippet {
                path: path.clone(),
                content,
            })
        });
        let snippets = gather(join_all(reads).await, "file reader")?;
        let tokens = snippets.iter().map(|s| estimate_tokens(&s.content)).sum();

        Ok(StagePatch::new()
            .data(keys::SNIPPETS, to_value(&snippets)?)
            .usage(
                BudgetUsage::new()
                    .with_files(snippets.len() as u64)
                    .with_tokens(tokens),
            ))
    }

    fn cost_estimate(&self) -> BudgetUsage {
        BudgetUsage::new().with_files(self.max_files as u64).with_tokens(2_000)
    }
}
