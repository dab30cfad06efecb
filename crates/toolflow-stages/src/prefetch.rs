//! Concurrent context gathering.
//!
//! The AgentsMD stage reads directives while repo facts, documentation and
//! search hits are fetched alongside it:
//!
//! ```text
//! directives ───────────────┐
//! repo facts ──► docs ──────┼──► join ──► `prefetched`
//! search ───────────────────┘
//! ```
//!
//! RepoFacts, Documentation and SemanticSearch then take their share from
//! `prefetched`, apply their own budget limits and charge the usage. A
//! piece that failed is left out, and its stage makes the call itself.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use toolflow_core::RunContext;
use tracing::debug;

use crate::collaborators::SearchHit;
use crate::docs::{DocumentationStage, FrameworkDocs};
use crate::keys;
use crate::retrieval::{RepoFactsStage, SemanticSearchStage};

/// Lookups finished ahead of their stages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prefetched {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_facts: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documentation: Option<Vec<FrameworkDocs>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_hits: Option<Vec<SearchHit>>,
}

impl Prefetched {
    pub fn from_ctx(ctx: &RunContext) -> Self {
        ctx.get_as(keys::PREFETCHED).unwrap_or_default()
    }

    /// Documentation fetched for exactly these facts.
    pub fn documentation_for(&self, facts: &[String]) -> Option<Vec<FrameworkDocs>> {
        match &self.repo_facts {
            Some(fetched) if fetched.as_slice() == facts => self.documentation.clone(),
            _ => None,
        }
    }
}

/// The stages whose lookups run ahead, shared with the registry.
#[derive(Clone)]
pub struct ContextPrefetch {
    facts: Arc<RepoFactsStage>,
    docs: Arc<DocumentationStage>,
    search: Arc<SemanticSearchStage>,
}

impl ContextPrefetch {
    pub fn new(facts: Arc<RepoFactsStage>, docs: Arc<DocumentationStage>, search: Arc<SemanticSearchStage>) -> Self {
        Self { facts, docs, search }
    }

    pub async fn run(&self, ctx: &RunContext) -> Prefetched {
        let facts_then_docs = async {
            let facts = match self.facts.detect().await {
                Ok(facts) => facts,
                Err(err) => {
                    debug!(%err, "repo fact prefetch failed");
                    return (None, None);
                }
            };
            let docs = match self.docs.prefetch(ctx, &facts).await {
                Ok(docs) => Some(docs),
                Err(err) => {
                    debug!(%err, "documentation prefetch failed");
                    None
                }
            };
            (Some(facts), docs)
        };
        let search = async {
            match self.search.prefetch(ctx).await {
                Ok(hits) => hits,
                Err(err) => {
                    debug!(%err, "search prefetch failed");
                    None
                }
            }
        };

        let ((repo_facts, documentation), search_hits) = tokio::join!(facts_then_docs, search);
        Prefetched {
            repo_facts,
            documentation,
            search_hits,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docs::DocSource;

    #[test]
    fn test_documentation_only_for_matching_facts() {
        let docs = vec![FrameworkDocs {
            framework: "axum".into(),
            content: "routing".into(),
            source: DocSource::Provider,
        }];
        let prefetched = Prefetched {
            repo_facts: Some(vec!["framework:axum@0.8".into()]),
            documentation: Some(docs.clone()),
            search_hits: None,
        };
        assert_eq!(prefetched.documentation_for(&["framework:axum@0.8".into()]), Some(docs));
        assert_eq!(prefetched.documentation_for(&["framework:axum@0.7".into()]), None);
        assert_eq!(Prefetched::default().documentation_for(&[]), None);
    }
}
