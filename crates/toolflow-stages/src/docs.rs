//! Documentation stage
//!
//! One lookup per detected framework, all issued concurrently. Each lookup
//! goes through the tiered cache first:
//!
//! ```text
//! Fresh ──► use cached
//! Stale ──► use cached, refresh in the background (one refresh per key)
//! Miss  ──► provider ──► cache ──► use
//! ```

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use toolflow_cache::{doc_cache_key, project_signature, Lookup, TieredCache};
use toolflow_core::{BudgetUsage, RunContext, ServiceError, Stage, StageError, StageId, StagePatch};
use tracing::{debug, warn};

use crate::collaborators::DocumentationProvider;
use crate::prefetch::Prefetched;
use crate::{estimate_tokens, gather, keys, to_value};

const FRAMEWORK_PREFIX: &str = "framework:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocSource {
    Cache,
    StaleCache,
    Provider,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameworkDocs {
    pub framework: String,
    pub content: String,
    pub source: DocSource,
}

pub struct DocumentationStage {
    provider: Arc<dyn DocumentationProvider>,
    cache: Arc<TieredCache>,
}

impl DocumentationStage {
    pub fn new(provider: Arc<dyn DocumentationProvider>, cache: Arc<TieredCache>) -> Self {
        Self { provider, cache }
    }

    async fn lookup(
        &self,
        framework: &str,
        query: &str,
        signature: &str,
    ) -> Result<FrameworkDocs, ServiceError> {
        let key = doc_cache_key(framework, query, signature);

        match self.cache.get_stale_while_revalidate(&key).await {
            Lookup::Fresh(content) => Ok(FrameworkDocs {
                framework: framework.to_string(),
                content,
                source: DocSource::Cache,
            }),
            Lookup::Stale(content) => {
                self.spawn_refresh(&key, framework, query);
                Ok(FrameworkDocs {
                    framework: framework.to_string(),
                    content,
                    source: DocSource::StaleCache,
                })
            }
            Lookup::Miss => {
                let content = self.provider.query(framework, query).await?;
                if let Err(err) = self.cache.set(&key, content.clone(), None, &[framework]).await {
                    warn!(framework, %err, "failed to cache documentation");
                }
                Ok(FrameworkDocs {
                    framework: framework.to_string(),
                    content,
                    source: DocSource::Provider,
                })
            }
        }
    }

    async fn lookup_all(
        &self,
        ctx: &RunContext,
        facts: &[String],
        frameworks: &[String],
    ) -> Result<Vec<FrameworkDocs>, StageError> {
        let signature = project_signature(facts.iter().map(String::as_str));
        let query = ctx
            .request_str("docs_query")
            .or_else(|| ctx.request_str("goal"))
            .unwrap_or("overview")
            .to_string();

        let lookups = frameworks
            .iter()
            .map(|framework| self.lookup(framework, &query, &signature));
        gather(join_all(lookups).await, "documentation provider")
    }

    /// Lookups for `facts` ahead of the stage itself. Empty when there is
    /// nothing to look up or no chunk budget left.
    pub(crate) async fn prefetch(&self, ctx: &RunContext, facts: &[String]) -> Result<Vec<FrameworkDocs>, StageError> {
        match budgeted_frameworks(ctx, facts) {
            Some(frameworks) if !frameworks.is_empty() => self.lookup_all(ctx, facts, &frameworks).await,
            _ => Ok(Vec::new()),
        }
    }

    fn spawn_refresh(&self, key: &str, framework: &str, query: &str) {
        let Some(guard) = self.cache.try_begin_refresh(key) else {
            debug!(framework, "documentation refresh already in flight");
            return;
        };
        let provider = Arc::clone(&self.provider);
        let cache = Arc::clone(&self.cache);
        let framework = framework.to_string();
        let query = query.to_string();

        tokio::spawn(async move {
            match provider.query(&framework, &query).await {
                Ok(content) => {
                    if let Err(err) = cache.set(guard.key(), content, None, &[framework.as_str()]).await {
                        warn!(%framework, %err, "failed to store refreshed documentation");
                    }
                }
                Err(err) => warn!(%framework, %err, "background documentation refresh failed"),
            }
            drop(guard);
        });
    }
}

/// Framework names from `framework:<name>[@version]` facts.
pub fn frameworks_from_facts(facts: &[String]) -> Vec<String> {
    let mut frameworks: Vec<String> = facts
        .iter()
        .filter_map(|f| f.strip_prefix(FRAMEWORK_PREFIX))
        .map(|f| f.split('@').next().unwrap_or(f).to_string())
        .filter(|f| !f.is_empty())
        .collect();
    frameworks.sort();
    frameworks.dedup();
    frameworks
}

/// Frameworks that fit the remaining chunk budget; `None` once it is spent.
fn budgeted_frameworks(ctx: &RunContext, facts: &[String]) -> Option<Vec<String>> {
    let chunks_left = ctx.remaining().chunks as usize;
    if chunks_left == 0 {
        return None;
    }
    let mut frameworks = frameworks_from_facts(facts);
    frameworks.truncate(ctx.narrowed(chunks_left));
    Some(frameworks)
}

#[async_trait]
impl Stage for DocumentationStage {
    fn id(&self) -> StageId {
        StageId::Documentation
    }

    async fn execute(&self, ctx: &RunContext) -> Result<StagePatch, StageError> {
        let facts: Vec<String> = ctx.get_as(keys::REPO_FACTS).unwrap_or_default();
        if frameworks_from_facts(&facts).is_empty() {
            return Ok(StagePatch::new().data(keys::DOCUMENTATION, Vec::<serde_json::Value>::new()));
        }
        let Some(frameworks) = budgeted_frameworks(ctx, &facts) else {
            return Ok(StagePatch::new()
                .data(keys::DOCUMENTATION, Vec::<serde_json::Value>::new())
                .meta("docs_skipped", "chunk budget exhausted"));
        };

        let (docs, prefetched) = match Prefetched::from_ctx(ctx).documentation_for(&facts) {
            Some(docs) => {
                let docs: Vec<FrameworkDocs> = docs
                    .into_iter()
                    .filter(|d| frameworks.contains(&d.framework))
                    .collect();
                (docs, true)
            }
            None => (self.lookup_all(ctx, &facts, &frameworks).await?, false),
        };

        let from_cache = docs.iter().filter(|d| d.source != DocSource::Provider).count();
        let tokens = docs.iter().map(|d| estimate_tokens(&d.content)).sum();
        debug!(frameworks = docs.len(), from_cache, prefetched, "documentation gathered");

        Ok(StagePatch::new()
            .data(keys::DOCUMENTATION, to_value(&docs)?)
            .meta("docs_from_cache", from_cache)
            .meta("docs_prefetched", prefetched)
            .usage(
                BudgetUsage::new()
                    .with_tokens(tokens)
                    .with_chunks(docs.len() as u64),
            ))
    }

    fn cost_estimate(&self) -> BudgetUsage {
        BudgetUsage::new().with_tokens(4_000).with_chunks(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frameworks_from_facts() {
        let facts = vec![
            "lang:rust".to_string(),
            "framework:axum@0.8".to_string(),
            "framework:tokio".to_string(),
            "framework:axum".to_string(),
            "framework:".to_string(),
        ];
        assert_eq!(frameworks_from_facts(&facts), vec!["axum".to_string(), "tokio".to_string()]);
    }
}
