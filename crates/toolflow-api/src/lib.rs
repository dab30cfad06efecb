//! toolflow API /v1: REST endpoints over the pipeline engine and the
//! documentation cache.
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;

use async_trait::async_trait;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use toolflow_cache::{FileStore, TieredCache};
use toolflow_core::{PipelineEngine, ServiceError};
use toolflow_stages::{default_registry, local_collaborators, DocumentationProvider, HttpDocumentationProvider};
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, warn, Level};

pub use config::{FileConfig, ServerConfig};
pub use error::ApiError;
pub use metrics::ApiMetrics;

const DOCS_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<PipelineEngine>,
    pub cache: Arc<TieredCache>,
    pub metrics: ApiMetrics,
}

impl AppState {
    pub fn new(engine: PipelineEngine, cache: Arc<TieredCache>) -> Result<Self, ApiError> {
        Ok(Self {
            engine: Arc::new(engine),
            cache,
            metrics: ApiMetrics::new()?,
        })
    }

    /// Wires the cache tiers, the local collaborators and the engine from
    /// `config`.
    pub async fn from_config(config: &ServerConfig) -> Result<Self, ApiError> {
        let mut cache = TieredCache::new(config.file.cache.clone());
        if let Some(dir) = &config.cache_dir {
            let store = FileStore::open(dir)
                .await
                .map_err(|e| ApiError::Config(format!("cache dir {}: {}", dir.display(), e)))?;
            cache = cache.with_durable(Arc::new(store));
        }
        let cache = Arc::new(cache);

        let docs: Arc<dyn DocumentationProvider> = match &config.docs_url {
            Some(url) => Arc::new(
                HttpDocumentationProvider::new(url.clone(), DOCS_TIMEOUT)
                    .map_err(|e| ApiError::Config(e.to_string()))?,
            ),
            None => {
                warn!("TOOLFLOW_DOCS_URL not set, documentation lookups return placeholders");
                Arc::new(OfflineDocs)
            }
        };

        let registry = default_registry(local_collaborators(&config.workspace, docs), Arc::clone(&cache))
            .map_err(|e| ApiError::Config(e.to_string()))?;
        let engine = PipelineEngine::new(registry, config.file.engine.clone());
        info!(
            workspace = %config.workspace.display(),
            durable_cache = config.cache_dir.is_some(),
            "pipeline ready"
        );
        Self::new(engine, cache)
    }
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/v1/execute", post(handlers::execute))
        .route("/v1/cache/stats", get(handlers::cache_stats))
        .route("/v1/cache/invalidate", post(handlers::invalidate))
        .route("/v1/cache", axum::routing::delete(handlers::clear_cache))
        .route("/v1/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serves the API on `config.addr` until the process is stopped. The cache
/// sweeper runs for as long as the server does.
pub async fn run(config: ServerConfig) -> Result<(), ApiError> {
    let state = AppState::from_config(&config).await?;
    let sweeper = state.cache.spawn_sweeper();
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(&config.addr).await?;
    info!("toolflow API listening on {}", config.addr);
    let served = axum::serve(listener, app).await;
    sweeper.abort();
    Ok(served?)
}

/// Stand-in when no documentation service is configured.
pub struct OfflineDocs;

#[async_trait]
impl DocumentationProvider for OfflineDocs {
    async fn query(&self, framework: &str, _query: &str) -> Result<String, ServiceError> {
        Ok(format!("No documentation source configured for {}.", framework))
    }
}
