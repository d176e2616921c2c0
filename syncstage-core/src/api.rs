//! Service HTTP endpoint: liveness, Prometheus metrics and session dispatch

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::engine::SyncEngine;
use crate::metrics::Metrics;

/// API state shared across handlers
#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<SyncEngine>,
    pub metrics: Metrics,
}

/// Health check response
#[derive(Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub active_sessions: usize,
    pub uptime_seconds: u64,
}

/// Optional body of `POST /sync/:owner`
#[derive(Debug, Default, Deserialize)]
pub struct SyncRequest {
    #[serde(default)]
    pub record_ids: Vec<u64>,
}

#[derive(Serialize, Deserialize)]
pub struct SyncAccepted {
    pub owner_id: String,
    pub records: usize,
}

/// Error response
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Create the service router
pub fn create_router(engine: Arc<SyncEngine>) -> Router {
    let state = ApiState {
        metrics: engine.metrics().clone(),
        engine,
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_endpoint))
        .route("/sync/:owner", post(start_sync))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health_check(State(state): State<ApiState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        active_sessions: state.metrics.active_sessions(),
        uptime_seconds: state.metrics.uptime_seconds(),
    })
}

/// Prometheus metrics endpoint
async fn metrics_endpoint(State(state): State<ApiState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.to_prometheus(),
    )
}

/// Start a session for an owner (POST /sync/:owner). The session runs in
/// the background; the response only acknowledges it.
async fn start_sync(
    State(state): State<ApiState>,
    Path(owner_id): Path<String>,
    body: Option<Json<SyncRequest>>,
) -> Result<(StatusCode, Json<SyncAccepted>), ApiError> {
    if owner_id.trim().is_empty() {
        return Err(ApiError::BadRequest("Empty owner id".to_string()));
    }
    let request = body.map(|Json(request)| request).unwrap_or_default();
    let records = request.record_ids.len();

    info!(owner_id, records, "API: Dispatching session");
    let engine = Arc::clone(&state.engine);
    let owner = owner_id.clone();
    tokio::spawn(async move {
        let result = if request.record_ids.is_empty() {
            engine.sync_owner(&owner).await
        } else {
            engine.sync_records(&owner, &request.record_ids).await
        };
        if let Err(e) = result {
            warn!(owner_id = %owner, "Dispatched session failed: {}", e);
        }
    });

    Ok((StatusCode::ACCEPTED, Json(SyncAccepted { owner_id, records })))
}

#[derive(Debug)]
enum ApiError {
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_store::{CacheStore, MemoryCacheStore};
    use crate::catalog::{Catalog, ContentRecord};
    use crate::content_store::MemoryContentStore;
    use crate::engine::EngineSettings;
    use crate::retry::RetryPolicy;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::time::Duration;
    use tower::util::ServiceExt;

    fn engine(dir: &std::path::Path, cache: Arc<MemoryCacheStore>) -> Arc<SyncEngine> {
        let store = Arc::new(MemoryContentStore::new());
        store.put_at("cidA", &b"hello world"[..]);
        let catalog = Catalog::from_records(vec![ContentRecord {
            id: 1,
            owner_id: "U1".to_string(),
            content_address: "cidA".to_string(),
            display_name: "a.txt".to_string(),
            size_bytes: 11,
            content_type: "txt".to_string(),
            upload_timestamp: 0,
        }]);

        let mut settings = EngineSettings::new(dir.join("sessions"));
        settings.verify_policy = RetryPolicy::fixed(3, Duration::from_millis(5));

        Arc::new(SyncEngine::new(
            Arc::new(catalog),
            store,
            cache,
            settings,
            Metrics::new(),
        ))
    }

    #[tokio::test]
    async fn test_health_check() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), Arc::new(MemoryCacheStore::new()));
        engine.metrics().session_opened();
        let app = create_router(engine);

        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let health: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.status, "ok");
        assert_eq!(health.active_sessions, 1);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), Arc::new(MemoryCacheStore::new()));
        engine.metrics().sweep_finished(2);
        let app = create_router(engine);

        let request = Request::builder()
            .uri("/metrics")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/plain; version=0.0.4"
        );

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("syncstage_sessions_reaped_total 2"));
    }

    #[tokio::test]
    async fn test_sync_route_publishes_listing() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(MemoryCacheStore::new());
        let app = create_router(engine(dir.path(), cache.clone()));

        let request = Request::builder()
            .method("POST")
            .uri("/sync/U1")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let accepted: SyncAccepted = serde_json::from_slice(&body).unwrap();
        assert_eq!(accepted.owner_id, "U1");
        assert_eq!(accepted.records, 0);

        let mut listing = None;
        for _ in 0..200 {
            listing = cache.get_listing("U1").await.unwrap();
            if listing.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let listing = listing.expect("dispatched session never published");
        assert_eq!(listing.entries[0].decode().unwrap(), b"hello world");
        assert_eq!(cache.get_file_count("U1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sync_route_accepts_record_ids() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(MemoryCacheStore::new());
        let app = create_router(engine(dir.path(), cache.clone()));

        let request = Request::builder()
            .method("POST")
            .uri("/sync/U1")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"record_ids":[1]}"#))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let accepted: SyncAccepted = serde_json::from_slice(&body).unwrap();
        assert_eq!(accepted.records, 1);
    }

    #[tokio::test]
    async fn test_sync_route_requires_post() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_router(engine(dir.path(), Arc::new(MemoryCacheStore::new())));

        let request = Request::builder()
            .uri("/sync/U1")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_router(engine(dir.path(), Arc::new(MemoryCacheStore::new())));
        let request = Request::builder()
            .uri("/api/v1/blocks")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
