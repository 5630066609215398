//! HTTP surface tests via tower oneshot

mod helpers;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use fleet_sync::db::settings::get_setting;
use fleet_sync::settings::KEY_MAX_RETRIES;
use helpers::{build_state, test_db, FakeProvider};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::util::ServiceExt;

async fn send(app: &axum::Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_health_endpoint() {
    let (_dir, pool) = test_db().await;
    let app = fleet_sync::build_router(build_state(pool, Arc::new(FakeProvider::default())));

    let (status, body) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "fleet-sync");
    assert_eq!(body["circuit_open"], false);
}

#[tokio::test]
async fn test_rate_limiter_config_update_is_validated_and_persisted() {
    let (_dir, pool) = test_db().await;
    let app = fleet_sync::build_router(build_state(pool.clone(), Arc::new(FakeProvider::default())));

    let (status, body) = send(
        &app,
        "PUT",
        "/api/rate-limiter/config",
        Some(json!({"maxRetries": 11})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

    let (status, body) = send(
        &app,
        "PUT",
        "/api/rate-limiter/config",
        Some(json!({"baseDelayMs": 2000, "maxRetries": 4})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["baseDelayMs"], 2000);
    assert_eq!(body["maxRetries"], 4);
    assert_eq!(body["circuitBreakerThreshold"], 5);

    let stored: Option<u32> = get_setting(&pool, KEY_MAX_RETRIES).await.unwrap();
    assert_eq!(stored, Some(4));

    let (_, config) = send(&app, "GET", "/api/rate-limiter/config", None).await;
    assert_eq!(config["baseDelayMs"], 2000);
}

#[tokio::test]
async fn test_rate_limiter_config_unchanged_when_persist_fails() {
    let (_dir, pool) = test_db().await;
    let app = fleet_sync::build_router(build_state(pool.clone(), Arc::new(FakeProvider::default())));
    let (_, before) = send(&app, "GET", "/api/rate-limiter/config", None).await;

    sqlx::query("DROP TABLE settings").execute(&pool).await.unwrap();
    let (status, _) = send(
        &app,
        "PUT",
        "/api/rate-limiter/config",
        Some(json!({"baseDelayMs": 2000, "maxRetries": 4, "circuitBreakerThreshold": 6})),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    let (_, after) = send(&app, "GET", "/api/rate-limiter/config", None).await;
    assert_eq!(after, before);
}

#[tokio::test]
async fn test_rate_limiter_stats_and_reset() {
    let (_dir, pool) = test_db().await;
    let state = build_state(pool, Arc::new(FakeProvider::default()));
    state.poller.force_sync().await;
    let app = fleet_sync::build_router(state);

    let (status, stats) = send(&app, "GET", "/api/rate-limiter/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["totalRequests"], 1);
    assert_eq!(stats["successfulRequests"], 1);
    assert_eq!(stats["circuitOpen"], false);

    let (status, stats) = send(&app, "POST", "/api/rate-limiter/stats/reset", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["totalRequests"], 0);
}

#[tokio::test]
async fn test_queue_controls() {
    let (_dir, pool) = test_db().await;
    let provider = Arc::new(FakeProvider::with(vec![Ok(fleet_sync::provider::PositionsResponse {
        records: vec![json!({"device_id": "D1", "lat": 1.0, "lon": 2.0})],
        ..Default::default()
    })]));
    let state = build_state(pool, provider);
    state.poller.force_sync().await;
    let app = fleet_sync::build_router(state);

    let (_, size) = send(&app, "GET", "/api/queue/size", None).await;
    assert_eq!(size["queueSize"], 1);

    let (_, metrics) = send(&app, "POST", "/api/queue/pause", None).await;
    assert_eq!(metrics["isPaused"], true);

    let (_, metrics) = send(&app, "POST", "/api/queue/resume", None).await;
    assert_eq!(metrics["isPaused"], false);

    let (_, cleared) = send(&app, "POST", "/api/queue/clear", None).await;
    assert_eq!(cleared["cleared"], 1);

    let (_, metrics) = send(&app, "GET", "/api/queue/metrics", None).await;
    assert_eq!(metrics["queueSize"], 0);
}

#[tokio::test]
async fn test_sync_force_and_status() {
    let (_dir, pool) = test_db().await;
    let provider = Arc::new(FakeProvider::with(vec![Ok(fleet_sync::provider::PositionsResponse {
        next_watermark: Some("cursor-7".into()),
        ..Default::default()
    })]));
    let app = fleet_sync::build_router(build_state(pool, provider));

    let (status, metrics) = send(&app, "POST", "/api/sync/force", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(metrics["errors"], 0);
    assert!(metrics["lastSyncTime"].is_string());

    let (status, body) = send(&app, "GET", "/api/sync/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["watermark"]["last_query_time"], "cursor-7");
}

#[tokio::test]
async fn test_consistency_endpoints() {
    let (_dir, pool) = test_db().await;
    sqlx::query("INSERT INTO vehicles (id, device_id, name, user_id) VALUES ('v1', 'D1', NULL, 'u1')")
        .execute(&pool)
        .await
        .unwrap();
    let app = fleet_sync::build_router(build_state(pool, Arc::new(FakeProvider::default())));

    let (status, _) = send(&app, "GET", "/api/consistency/latest", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, result) = send(&app, "POST", "/api/consistency/check", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["discrepanciesFound"], 1);
    assert_eq!(result["consistencyScore"], 0);

    let (_, latest) = send(&app, "GET", "/api/consistency/latest", None).await;
    assert_eq!(latest["checkId"], result["checkId"]);

    let (_, found) = send(
        &app,
        "GET",
        "/api/consistency/discrepancies?entity_type=vehicle&severity=medium",
        None,
    )
    .await;
    assert_eq!(found.as_array().unwrap().len(), 1);
    assert_eq!(found[0]["type"], "missing-field");

    let (status, _) = send(&app, "GET", "/api/consistency/discrepancies?severity=urgent", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, alerts) = send(&app, "GET", "/api/consistency/alerts?severity=critical", None).await;
    assert_eq!(alerts.as_array().unwrap().len(), 1);
}
