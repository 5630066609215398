//! Write-back queue control

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use fleet_common::models::QueueMetrics;
use serde::Serialize;
use serde_json::json;

use crate::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSizeResponse {
    pub queue_size: usize,
}

/// GET /api/queue/metrics
pub async fn get_metrics(State(state): State<AppState>) -> Json<QueueMetrics> {
    Json(state.batch.get_metrics())
}

/// GET /api/queue/size
pub async fn get_size(State(state): State<AppState>) -> Json<QueueSizeResponse> {
    Json(QueueSizeResponse {
        queue_size: state.batch.get_queue_size(),
    })
}

/// POST /api/queue/clear
pub async fn clear(State(state): State<AppState>) -> Json<serde_json::Value> {
    let cleared = state.batch.clear_queue();
    Json(json!({ "cleared": cleared }))
}

/// POST /api/queue/pause
pub async fn pause(State(state): State<AppState>) -> Json<QueueMetrics> {
    state.batch.pause();
    Json(state.batch.get_metrics())
}

/// POST /api/queue/resume
pub async fn resume(State(state): State<AppState>) -> Json<QueueMetrics> {
    state.batch.resume();
    Json(state.batch.get_metrics())
}

pub fn queue_routes() -> Router<AppState> {
    Router::new()
        .route("/api/queue/metrics", get(get_metrics))
        .route("/api/queue/size", get(get_size))
        .route("/api/queue/clear", post(clear))
        .route("/api/queue/pause", post(pause))
        .route("/api/queue/resume", post(resume))
}
