//! Rate limiter configuration and statistics

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use tracing::info;

use crate::db::settings::set_settings;
use crate::rate_limiter::{RateLimiterConfig, RateLimiterConfigUpdate, RateLimiterStats};
use crate::settings::{KEY_BASE_DELAY_MS, KEY_CIRCUIT_THRESHOLD, KEY_MAX_RETRIES};
use crate::{ApiResult, AppState};

/// GET /api/rate-limiter/config
pub async fn get_config(State(state): State<AppState>) -> Json<RateLimiterConfig> {
    Json(state.limiter.get_config())
}

/// PUT /api/rate-limiter/config
///
/// Partial update. Out-of-range values are rejected with 400. Accepted
/// values are written to the settings table first and only then applied,
/// so a failed write leaves both the table and the running limiter as
/// they were.
pub async fn update_config(
    State(state): State<AppState>,
    Json(update): Json<RateLimiterConfigUpdate>,
) -> ApiResult<Json<RateLimiterConfig>> {
    let config = state.limiter.get_config().merge(update)?;

    set_settings(
        &state.db,
        &[
            (KEY_BASE_DELAY_MS, config.base_delay_ms.to_string()),
            (KEY_MAX_RETRIES, config.max_retries.to_string()),
            (KEY_CIRCUIT_THRESHOLD, config.circuit_breaker_threshold.to_string()),
        ],
    )
    .await?;
    info!("Rate limiter configuration persisted");

    state.limiter.set_config(config)?;
    Ok(Json(config))
}

/// GET /api/rate-limiter/stats
pub async fn get_stats(State(state): State<AppState>) -> Json<RateLimiterStats> {
    Json(state.limiter.get_stats())
}

/// POST /api/rate-limiter/stats/reset
pub async fn reset_stats(State(state): State<AppState>) -> Json<RateLimiterStats> {
    state.limiter.reset_stats();
    Json(state.limiter.get_stats())
}

pub fn rate_limiter_routes() -> Router<AppState> {
    Router::new()
        .route("/api/rate-limiter/config", get(get_config).put(update_config))
        .route("/api/rate-limiter/stats", get(get_stats))
        .route("/api/rate-limiter/stats/reset", post(reset_stats))
}
