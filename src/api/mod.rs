// REST API endpoints for the orchestrator

use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::backend::BackendKind;
use crate::core::queue::EnqueueOptions;
use crate::error::QueueError;
use crate::orchestrator::Orchestrator;
use crate::types::{Priority, RequestId};

pub type AppState = Arc<Orchestrator<Value, Value>>;

/// Request submission and read-only status endpoints.
pub fn create_public_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(status))
        .route("/requests", post(submit_request))
        .route("/requests/{id}", get(get_request))
        .route("/requests/{id}/cancel", post(cancel_request))
        .route("/requests/{id}/wait", get(wait_for_request))
        .route("/queue/metrics", get(queue_metrics))
        .route("/fleet/metrics", get(fleet_metrics))
        .route("/backends", get(backend_statuses))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// Operator endpoints that change fleet or backend state.
pub fn create_admin_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/fleet/scale-up", post(scale_up))
        .route("/fleet/scale-down", post(scale_down))
        .route("/backends/select", post(select_backend))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

async fn health_check() -> Result<Json<Value>, StatusCode> {
    Ok(Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

async fn status(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    let status = state.status();
    serde_json::to_value(status)
        .map(Json)
        .map_err(|_e| StatusCode::INTERNAL_SERVER_ERROR)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitRequest {
    payload: Value,
    #[serde(default)]
    priority: Option<Priority>,
    #[serde(default)]
    max_retries: Option<u32>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

async fn submit_request(
    State(state): State<AppState>,
    Json(body): Json<SubmitRequest>,
) -> Result<Json<Value>, StatusCode> {
    let mut options = EnqueueOptions::new().priority(body.priority.unwrap_or_default());
    if let Some(max_retries) = body.max_retries {
        options = options.max_retries(max_retries);
    }
    if let Some(timeout_ms) = body.timeout_ms {
        options = options.timeout(Duration::from_millis(timeout_ms));
    }

    match state.queue().enqueue(body.payload, options) {
        Ok(id) => Ok(Json(json!({ "requestId": id }))),
        Err(QueueError::QueueFull { max }) => {
            warn!("Rejecting request, queue is full (max: {})", max);
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
        Err(_e) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

async fn get_request(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let info = state
        .queue()
        .get_request(&RequestId::from(id))
        .ok_or(StatusCode::NOT_FOUND)?;
    serde_json::to_value(info)
        .map(Json)
        .map_err(|_e| StatusCode::INTERNAL_SERVER_ERROR)
}

async fn cancel_request(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let id = RequestId::from(id);
    if state.queue().get_request(&id).is_none() {
        return Err(StatusCode::NOT_FOUND);
    }
    let cancelled = state.cancel(&id);
    Ok(Json(json!({ "requestId": id, "cancelled": cancelled })))
}

async fn wait_for_request(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let id = RequestId::from(id);
    match state.queue().wait_for_completion(&id).await {
        Ok(result) => Ok(Json(json!({
            "requestId": id,
            "status": "completed",
            "result": result,
        }))),
        Err(QueueError::NotFound(_)) => Err(StatusCode::NOT_FOUND),
        Err(e) => Ok(Json(json!({
            "requestId": id,
            "status": "failed",
            "error": e.to_string(),
        }))),
    }
}

async fn queue_metrics(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    serde_json::to_value(state.queue().metrics())
        .map(Json)
        .map_err(|_e| StatusCode::INTERNAL_SERVER_ERROR)
}

async fn fleet_metrics(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    serde_json::to_value(state.fleet().metrics())
        .map(Json)
        .map_err(|_e| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Probes every backend; this is the only read endpoint with side effects
/// on the health cache.
async fn backend_statuses(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    let statuses = state.backends().all_statuses().await;
    Ok(Json(json!({
        "backends": statuses,
        "preferred": state.backends().preferred(),
        "lastUsed": state.backends().last_used(),
    })))
}

async fn scale_up(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    let pod_id = state.fleet().scale_up().await;
    Ok(Json(json!({
        "podId": pod_id,
        "totalPods": state.fleet().pod_count(),
    })))
}

async fn scale_down(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    let removed = state.fleet().scale_down().await;
    Ok(Json(json!({
        "removed": removed,
        "totalPods": state.fleet().pod_count(),
    })))
}

#[derive(Debug, Deserialize)]
struct SelectParams {
    forced: Option<BackendKind>,
}

async fn select_backend(
    State(state): State<AppState>,
    Query(params): Query<SelectParams>,
) -> Result<Json<Value>, StatusCode> {
    let backend = state.backends().select_backend(params.forced).await;
    Ok(Json(json!({
        "backend": backend,
        "cost": state.backends().cost_estimate(backend),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendSelector;
    use crate::config::{BackendsConfig, FleetConfig, QueueConfig};
    use crate::core::executor::{PodExecutor, PodTarget};
    use crate::fleet::PodFleetManager;
    use crate::provider::PodSpec;
    use crate::testing::{MockProvider, StaticProbe};
    use async_trait::async_trait;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    struct Echo;

    #[async_trait]
    impl PodExecutor<Value, Value> for Echo {
        async fn execute(&self, pod: &PodTarget, payload: &Value) -> anyhow::Result<Value> {
            Ok(json!({ "pod": pod.id, "echo": payload }))
        }
    }

    fn state() -> AppState {
        let provider = Arc::new(MockProvider::new());
        let fleet = PodFleetManager::new(FleetConfig::default(), provider, PodSpec::default());
        let backends = BackendSelector::new(BackendsConfig::default())
            .with_probe(BackendKind::Gemini, Arc::new(StaticProbe::new(true)));
        let executor: Arc<dyn PodExecutor<Value, Value>> = Arc::new(Echo);
        Arc::new(Orchestrator::from_parts(
            QueueConfig::default(),
            fleet,
            backends,
            executor,
        ))
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_submit_and_wait() {
        let router = create_public_router(state());

        let response = router
            .clone()
            .oneshot(
                Request::post("/requests")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"payload": {"prompt": "a cat"}, "priority": "high"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let id = body_json(response).await["requestId"]
            .as_str()
            .unwrap()
            .to_string();

        let response = router
            .oneshot(
                Request::get(format!("/requests/{}/wait", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["status"], "completed");
        assert_eq!(body["result"]["echo"]["prompt"], "a cat");
    }

    #[tokio::test]
    async fn test_unknown_request_is_not_found() {
        let router = create_public_router(state());
        let response = router
            .oneshot(Request::get("/requests/req_missing").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_forced_backend_selection() {
        let router = create_admin_router(state());
        let response = router
            .oneshot(
                Request::post("/backends/select?forced=cloud")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["backend"], "cloud");
        assert_eq!(body["cost"], 0.02);
    }
}
