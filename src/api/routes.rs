//! API route definitions.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use super::state::AppState;
use crate::error::EngineError;
use crate::kernel::{ComputeParams, OperationKind};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/accelerator", get(accelerator))
        .route("/accelerator/reprobe", post(reprobe))
        .route("/workers", get(workers))
        .route("/compute", post(compute))
}

fn meta() -> Value {
    json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "lifecycle": state.engine.lifecycle_state(),
            "accelerator": state.engine.accelerator_state(),
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": meta()
    }))
}

async fn metrics(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "data": state.engine.get_metrics().await, "meta": meta() }))
}

async fn accelerator(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "data": {
            "state": state.engine.accelerator_state(),
            "limits": state.engine.accelerator_limits().await
        },
        "meta": meta()
    }))
}

async fn reprobe(State(state): State<AppState>) -> Json<Value> {
    let ready = state.engine.reprobe_accelerator().await;
    Json(json!({
        "data": { "ready": ready, "state": state.engine.accelerator_state() },
        "meta": meta()
    }))
}

async fn workers(State(state): State<AppState>) -> Json<Value> {
    let workers = state.engine.workers().await;
    let total = workers.len();
    Json(json!({ "data": workers, "meta": { "total": total } }))
}

#[derive(Debug, Deserialize)]
struct ComputeRequest {
    operation: OperationKind,
    data: Vec<f32>,
    elapsed_time: Option<f64>,
    #[serde(default)]
    mode: u32,
}

async fn compute(
    State(state): State<AppState>,
    Json(req): Json<ComputeRequest>,
) -> Result<Json<Value>, ApiError> {
    let elapsed = req
        .elapsed_time
        .unwrap_or_else(|| state.engine.uptime().as_secs_f64());
    let outcome = state
        .engine
        .submit(req.operation, req.data, ComputeParams::new(elapsed, req.mode))
        .await?;
    Ok(Json(json!({ "data": outcome, "meta": meta() })))
}

struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::InvalidPayload { .. } => StatusCode::BAD_REQUEST,
            EngineError::ShuttingDown | EngineError::PoolExhausted => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            EngineError::TaskTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}
