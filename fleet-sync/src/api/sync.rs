//! Poller status and manual trigger

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use fleet_common::models::{SyncMetrics, SyncWatermark};
use serde::Serialize;

use crate::{ApiResult, AppState};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusResponse {
    pub watermark: SyncWatermark,
    pub metrics: SyncMetrics,
}

/// GET /api/sync/status
pub async fn status(State(state): State<AppState>) -> ApiResult<Json<SyncStatusResponse>> {
    let watermark = state.poller.get_watermark().await?;
    Ok(Json(SyncStatusResponse {
        watermark,
        metrics: state.poller.get_metrics(),
    }))
}

/// POST /api/sync/force
///
/// Runs a poll cycle now. Returns the in-flight metrics unchanged if a
/// cycle is already running.
pub async fn force(State(state): State<AppState>) -> Json<SyncMetrics> {
    Json(state.poller.force_sync().await)
}

pub fn sync_routes() -> Router<AppState> {
    Router::new()
        .route("/api/sync/status", get(status))
        .route("/api/sync/force", post(force))
}
