//! Health check endpoint

use axum::{extract::State, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// `degraded` while the upstream circuit is open
    pub status: String,
    pub module: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub circuit_open: bool,
    pub connected_clients: usize,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime = Utc::now().signed_duration_since(state.startup_time);
    let circuit_open = state.limiter.is_circuit_open();

    Json(HealthResponse {
        status: if circuit_open { "degraded" } else { "ok" }.to_string(),
        module: "fleet-sync".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime.num_seconds().max(0) as u64,
        circuit_open,
        connected_clients: state.hub.connection_count().await,
    })
}

pub fn health_routes() -> Router<crate::AppState> {
    Router::new().route("/health", get(health_check))
}
