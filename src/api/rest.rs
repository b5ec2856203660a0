// =============================================================================
// REST control plane — Axum 0.7
// =============================================================================
//
// Every response uses the same envelope:
//   { success, data | error, code?, timestamp, path, method }
//
// Validation and unknown-instance failures map to 4xx with a reason code;
// everything else is a 5xx. Raw error chains never leave the process.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::{Method, StatusCode, Uri},
    response::IntoResponse,
    routing::{delete, get, post},
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::chain::gateway::ChainGateway;
use crate::error::{EngineError, ErrorKind};
use crate::strategy::manager::StrategyManager;
use crate::types::StrategyKind;

/// Shared state for the REST router.
#[derive(Clone)]
pub struct ApiState {
    pub manager: Arc<StrategyManager>,
    pub gateway: Arc<ChainGateway>,
    pub started_at: std::time::Instant,
}

/// Build the control-plane router.
pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/strategy/create", post(create))
        .route("/api/strategy/:id/start", post(start))
        .route("/api/strategy/:id/pause", post(pause))
        .route("/api/strategy/:id/resume", post(resume))
        .route("/api/strategy/:id/stop", post(stop))
        .route("/api/strategy/:id", delete(remove))
        .route("/api/strategy/:id/status", get(status))
        .route("/api/strategy/list", get(list))
        .route("/api/strategy/templates", get(templates))
        .route("/api/health", get(health))
        .route("/api/info", get(info_endpoint))
        .layer(cors)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Response envelope
// ---------------------------------------------------------------------------

fn envelope_ok(method: &Method, uri: &Uri, data: serde_json::Value) -> axum::response::Response {
    Json(serde_json::json!({
        "success": true,
        "data": data,
        "timestamp": Utc::now().timestamp_millis(),
        "path": uri.path(),
        "method": method.as_str(),
    }))
    .into_response()
}

fn envelope_err(method: &Method, uri: &Uri, error: &EngineError) -> axum::response::Response {
    let status = match error.kind() {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = Json(serde_json::json!({
        "success": false,
        "error": error.to_string(),
        "code": error.reason_code(),
        "timestamp": Utc::now().timestamp_millis(),
        "path": uri.path(),
        "method": method.as_str(),
    }));
    (status, body).into_response()
}

fn respond(
    method: Method,
    uri: Uri,
    result: Result<serde_json::Value, EngineError>,
) -> axum::response::Response {
    match result {
        Ok(data) => envelope_ok(&method, &uri, data),
        Err(e) => envelope_err(&method, &uri, &e),
    }
}

// ---------------------------------------------------------------------------
// Strategy lifecycle
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct CreateRequest {
    #[serde(rename = "type")]
    kind: StrategyKind,
    name: String,
    config: serde_json::Value,
}

async fn create(
    State(state): State<ApiState>,
    method: Method,
    uri: Uri,
    Json(request): Json<CreateRequest>,
) -> impl IntoResponse {
    info!(kind = %request.kind, name = %request.name, "create strategy requested");
    let result = state
        .manager
        .create(request.kind, &request.name, request.config)
        .map(|id| serde_json::json!({ "id": id }));
    respond(method, uri, result)
}

async fn start(
    State(state): State<ApiState>,
    method: Method,
    uri: Uri,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let result = state
        .manager
        .start(&id)
        .map(|()| serde_json::json!({ "id": id, "status": "running" }));
    respond(method, uri, result)
}

async fn pause(
    State(state): State<ApiState>,
    method: Method,
    uri: Uri,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let result = state
        .manager
        .pause(&id)
        .map(|()| serde_json::json!({ "id": id, "status": "paused" }));
    respond(method, uri, result)
}

async fn resume(
    State(state): State<ApiState>,
    method: Method,
    uri: Uri,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let result = state
        .manager
        .resume(&id)
        .map(|()| serde_json::json!({ "id": id, "status": "running" }));
    respond(method, uri, result)
}

async fn stop(
    State(state): State<ApiState>,
    method: Method,
    uri: Uri,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let result = state
        .manager
        .stop(&id)
        .await
        .map(|()| serde_json::json!({ "id": id, "status": "stopped" }));
    respond(method, uri, result)
}

async fn remove(
    State(state): State<ApiState>,
    method: Method,
    uri: Uri,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let result = state
        .manager
        .delete(&id)
        .map(|()| serde_json::json!({ "id": id, "deleted": true }));
    respond(method, uri, result)
}

async fn status(
    State(state): State<ApiState>,
    method: Method,
    uri: Uri,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let result = state
        .manager
        .status(&id)
        .and_then(|summary| {
            serde_json::to_value(summary)
                .map_err(|e| EngineError::Internal(format!("serialise failed: {e}")))
        });
    respond(method, uri, result)
}

async fn list(State(state): State<ApiState>, method: Method, uri: Uri) -> impl IntoResponse {
    let result = serde_json::to_value(state.manager.list())
        .map_err(|e| EngineError::Internal(format!("serialise failed: {e}")));
    respond(method, uri, result)
}

/// Configuration templates for the two executor kinds, with defaults.
async fn templates(method: Method, uri: Uri) -> impl IntoResponse {
    let data = serde_json::json!({
        "simple-y": {
            "required": ["poolAddress", "yAmountRaw"],
            "optional": {
                "binRange": 10,
                "stopLossCount": 1,
                "stopLossBinOffset": 35,
                "upwardTimeoutSeconds": 300,
                "downwardTimeoutSeconds": 60,
                "slippageBps": 50,
            },
        },
        "chain-position": {
            "required": ["poolAddress", "chainPositionType", "positionAmountRaw"],
            "optional": {
                "binRange": 10,
                "chainLength": 3,
                "monitoringIntervalSeconds": 30,
                "outOfRangeTimeoutSeconds": 300,
                "yieldExtractionThresholdPercent": 1.0,
                "enableSmartStopLoss": false,
                "stopLossConfig": { "stopLossCount": 1, "stopLossBinOffset": 35 },
                "slippageBps": 50,
            },
        },
    });
    respond(method, uri, Ok(data))
}

// ---------------------------------------------------------------------------
// Health / info
// ---------------------------------------------------------------------------

async fn health(State(state): State<ApiState>, method: Method, uri: Uri) -> impl IntoResponse {
    let endpoints = state.gateway.endpoint_reports();
    let healthy = endpoints.iter().any(|e| e.healthy);
    let instances = state.manager.list();
    let running = instances
        .iter()
        .filter(|i| matches!(i.status, crate::types::InstanceStatus::Running))
        .count();

    let data = serde_json::json!({
        "status": if healthy { "ok" } else { "degraded" },
        "rpcEndpoints": endpoints,
        "instances": { "total": instances.len(), "running": running },
    });
    respond(method, uri, Ok(data))
}

async fn info_endpoint(
    State(state): State<ApiState>,
    method: Method,
    uri: Uri,
) -> impl IntoResponse {
    let data = serde_json::json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": state.started_at.elapsed().as_secs(),
    });
    respond(method, uri, Ok(data))
}
