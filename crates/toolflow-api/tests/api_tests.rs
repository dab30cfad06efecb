//! HTTP surface tests: requests go straight into the router with `oneshot`.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tower::ServiceExt;
use toolflow_api::{create_app, AppState};
use toolflow_cache::{CacheConfig, TieredCache};
use toolflow_core::{EngineConfig, PipelineEngine, ServiceError};
use toolflow_stages::{default_registry, local_collaborators, DocumentationProvider};

struct CannedDocs;

#[async_trait]
impl DocumentationProvider for CannedDocs {
    async fn query(&self, framework: &str, _query: &str) -> Result<String, ServiceError> {
        Ok(format!("{} guide", framework))
    }
}

fn write_fixture(root: &Path) {
    std::fs::create_dir_all(root.join("src")).unwrap();
    std::fs::write(
        root.join("Cargo.toml"),
        "[package]\nname = \"demo\"\nversion = \"0.1.0\"\n\n[dependencies]\naxum = \"0.8\"\n",
    )
    .unwrap();
    std::fs::write(root.join("src/lib.rs"), "pub fn add(x: i32, y: i32) -> i32 {\n    x - y\n}\n").unwrap();
    std::fs::write(root.join("AGENTS.md"), "- Keep functions small.\n").unwrap();
}

fn app(root: &Path) -> (Router, Arc<TieredCache>) {
    let cache = Arc::new(TieredCache::new(CacheConfig::default()));
    let registry = default_registry(local_collaborators(root, Arc::new(CannedDocs)), Arc::clone(&cache)).unwrap();
    let engine = PipelineEngine::new(registry, EngineConfig::default());
    let state = AppState::new(engine, Arc::clone(&cache)).unwrap();
    (create_app(state), cache)
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&value).unwrap())
        }
        None => Body::empty(),
    };
    let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, bytes.to_vec())
}

fn json_of(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).unwrap()
}

#[tokio::test]
async fn test_health_reports_stage_count() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(dir.path());
    let (app, _) = app(dir.path());

    let (status, body) = send(&app, Method::GET, "/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);
    let body = json_of(&body);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["stages"], 11);
}

#[tokio::test]
async fn test_execute_runs_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(dir.path());
    let (app, cache) = app(dir.path());

    let request = json!({
        "toolName": "edit_file",
        "request": {"goal": "fix add", "queries": ["add"]},
        "budget": {"tokens": 20000}
    });
    let (status, body) = send(&app, Method::POST, "/v1/execute", Some(request)).await;
    assert_eq!(status, StatusCode::OK);

    let body = json_of(&body);
    assert_eq!(body["success"], true, "errors: {}", body["errors"]);
    assert_eq!(body["termination"]["type"], "completed");
    assert_eq!(body["stagesExecuted"].as_array().unwrap().len(), 11);
    assert_eq!(body["finalContext"]["budget"]["tokens"], 20000);
    assert_eq!(cache.stats().await.total_entries, 1);

    let (_, metrics) = send(&app, Method::GET, "/metrics", None).await;
    let metrics = String::from_utf8(metrics).unwrap();
    assert!(metrics.contains("toolflow_runs_total{termination=\"completed\"} 1"));
    assert!(metrics.contains("toolflow_cache_entries 1"));
}

#[tokio::test]
async fn test_execute_rejects_empty_tool_name() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(dir.path());
    let (app, _) = app(dir.path());

    let (status, body) = send(&app, Method::POST, "/v1/execute", Some(json!({"toolName": " "}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json_of(&body)["error"]["code"], "invalid_request");
}

#[tokio::test]
async fn test_invalidate_by_tag_and_clear() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(dir.path());
    let (app, cache) = app(dir.path());

    cache.set("p1:react:a", "a", None, &["react"]).await.unwrap();
    cache.set("p1:react:b", "b", None, &["react"]).await.unwrap();
    cache.set("p1:vue:a", "c", None, &["vue"]).await.unwrap();

    let (status, body) = send(&app, Method::POST, "/v1/cache/invalidate", Some(json!({"tag": "react"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_of(&body)["removed"], 2);

    let (_, body) = send(&app, Method::GET, "/v1/cache/stats", None).await;
    assert_eq!(json_of(&body)["totalEntries"], 1);

    let (status, _) = send(&app, Method::DELETE, "/v1/cache", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(cache.stats().await.total_entries, 0);
}

#[tokio::test]
async fn test_invalidate_needs_exactly_one_selector() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(dir.path());
    let (app, _) = app(dir.path());

    let both = json!({"key": "k", "tag": "react"});
    let (status, _) = send(&app, Method::POST, "/v1/cache/invalidate", Some(both)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, Method::POST, "/v1/cache/invalidate", Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
