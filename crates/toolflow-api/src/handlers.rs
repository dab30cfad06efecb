//! API Handlers
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use toolflow_core::{BudgetOverride, RunResult, ScopeOverride, TOOLFLOW_VERSION};

use crate::error::ApiError;
use crate::AppState;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub tool_name: String,
    #[serde(default)]
    pub request: Value,
    #[serde(default)]
    pub budget: Option<BudgetOverride>,
    #[serde(default)]
    pub scope: Option<ScopeOverride>,
}

/// Runs one request through the pipeline. Always 200 with a RunResult; an
/// unsuccessful run is reported in the body, not the status.
pub async fn execute(
    State(state): State<AppState>,
    Json(payload): Json<ExecuteRequest>,
) -> Result<Json<RunResult>, ApiError> {
    if payload.tool_name.trim().is_empty() {
        return Err(ApiError::BadRequest("toolName must not be empty".into()));
    }
    let result = state
        .engine
        .execute(
            &payload.tool_name,
            payload.request,
            payload.budget.as_ref(),
            payload.scope.as_ref(),
        )
        .await;
    state.metrics.observe_run(&result);
    Ok(Json(result))
}

pub async fn cache_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.cache.stats().await)
}

/// Exactly one of `key`, `tag` or `partition`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidateRequest {
    pub key: Option<String>,
    pub tag: Option<String>,
    pub partition: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InvalidateResponse {
    pub removed: usize,
}

pub async fn invalidate(
    State(state): State<AppState>,
    Json(payload): Json<InvalidateRequest>,
) -> Result<Json<InvalidateResponse>, ApiError> {
    let removed = match (payload.key, payload.tag, payload.partition) {
        (Some(key), None, None) => usize::from(state.cache.invalidate(&key).await),
        (None, Some(tag), None) => state.cache.invalidate_by_tag(&tag).await,
        (None, None, Some(partition)) => state.cache.invalidate_partition(&partition).await,
        _ => {
            return Err(ApiError::BadRequest(
                "provide exactly one of key, tag or partition".into(),
            ))
        }
    };
    state.metrics.observe_invalidation(removed);
    Ok(Json(InvalidateResponse { removed }))
}

pub async fn clear_cache(State(state): State<AppState>) -> StatusCode {
    state.cache.clear().await;
    StatusCode::NO_CONTENT
}

pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "version": TOOLFLOW_VERSION,
            "pipeline": state.engine.pipeline_id(),
            "stages": state.engine.registry().len(),
        })),
    )
}

pub async fn metrics(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    state.metrics.observe_cache(&state.cache.stats().await);
    let body = state.metrics.encode()?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}
