//! Consistency checks and audit queries

use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use fleet_common::models::{AlertLevel, ConsistencyAlert, ConsistencyCheckResult, Discrepancy, Severity};
use serde::Deserialize;

use crate::db::consistency::{latest_check, query_alerts, query_discrepancies, DiscrepancyFilter};
use crate::{ApiError, ApiResult, AppState};

#[derive(Debug, Default, Deserialize)]
pub struct DiscrepancyQuery {
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub severity: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AlertQuery {
    pub severity: Option<String>,
    pub limit: Option<u32>,
}

/// POST /api/consistency/check
pub async fn run_check(State(state): State<AppState>) -> ApiResult<Json<ConsistencyCheckResult>> {
    Ok(Json(state.verifier.perform_full_consistency_check().await?))
}

/// GET /api/consistency/latest
pub async fn latest(State(state): State<AppState>) -> ApiResult<Json<ConsistencyCheckResult>> {
    latest_check(&state.db)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("no consistency check has run yet".to_string()))
}

/// GET /api/consistency/discrepancies?entity_type=&entity_id=&severity=&limit=
pub async fn discrepancies(
    State(state): State<AppState>,
    Query(query): Query<DiscrepancyQuery>,
) -> ApiResult<Json<Vec<Discrepancy>>> {
    let severity = query
        .severity
        .as_deref()
        .map(str::parse::<Severity>)
        .transpose()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let filter = DiscrepancyFilter {
        entity_type: query.entity_type,
        entity_id: query.entity_id,
        severity,
        check_id: None,
        limit: query.limit,
    };
    Ok(Json(query_discrepancies(&state.db, &filter).await?))
}

/// GET /api/consistency/alerts?severity=&limit=
///
/// `severity` is the alert level, `warning` or `critical`.
pub async fn alerts(
    State(state): State<AppState>,
    Query(query): Query<AlertQuery>,
) -> ApiResult<Json<Vec<ConsistencyAlert>>> {
    let level = query
        .severity
        .as_deref()
        .map(str::parse::<AlertLevel>)
        .transpose()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    Ok(Json(query_alerts(&state.db, level, query.limit).await?))
}

pub fn consistency_routes() -> Router<AppState> {
    Router::new()
        .route("/api/consistency/check", post(run_check))
        .route("/api/consistency/latest", get(latest))
        .route("/api/consistency/discrepancies", get(discrepancies))
        .route("/api/consistency/alerts", get(alerts))
}
