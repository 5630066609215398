//! Consistency verifier against a real store

mod helpers;

use chrono::{Duration as ChronoDuration, Utc};
use fleet_common::events::EventBus;
use fleet_common::time::to_db_timestamp;
use fleet_sync::db::consistency::{query_alerts, query_discrepancies, DiscrepancyFilter};
use fleet_sync::verifier::{ConsistencyVerifier, StalenessLimits};
use helpers::test_db;
use sqlx::SqlitePool;
use std::time::Duration;

fn verifier(pool: SqlitePool) -> ConsistencyVerifier {
    ConsistencyVerifier::new(
        pool,
        EventBus::new(16),
        StalenessLimits {
            position_max_age: Duration::from_secs(3600),
            sync_max_age: Duration::from_secs(300),
        },
    )
}

async fn add_vehicle(pool: &SqlitePool, id: &str, device_id: Option<&str>, name: Option<&str>) {
    sqlx::query("INSERT INTO vehicles (id, device_id, name, user_id) VALUES (?, ?, ?, 'u1')")
        .bind(id)
        .bind(device_id)
        .bind(name)
        .execute(pool)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_empty_store_scores_100() {
    let (_dir, pool) = test_db().await;
    let result = verifier(pool).perform_full_consistency_check().await.unwrap();
    assert_eq!(result.total_entities_checked, 0);
    assert_eq!(result.consistency_score, 100);
}

#[tokio::test]
async fn test_fifteen_of_hundred_scores_85_without_alert() {
    let (_dir, pool) = test_db().await;
    for i in 0..100 {
        let id = format!("v{:03}", i);
        let device = format!("D{:03}", i);
        // 15 vehicles without a name: medium severity findings
        let name = if i < 15 { None } else { Some("Truck") };
        add_vehicle(&pool, &id, Some(&device), name).await;
    }

    let verifier = verifier(pool.clone());
    let result = verifier.perform_full_consistency_check().await.unwrap();
    assert_eq!(result.total_entities_checked, 100);
    assert_eq!(result.discrepancies_found, 15);
    assert_eq!(result.manual_review_required, 0);
    assert_eq!(result.consistency_score, 85);
    assert!(query_alerts(&pool, None, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_check_is_idempotent() {
    let (_dir, pool) = test_db().await;
    add_vehicle(&pool, "v1", Some("D1"), Some("Truck")).await;
    add_vehicle(&pool, "v2", Some("D1"), Some("Van")).await;
    add_vehicle(&pool, "v3", Some("D3"), None).await;

    let verifier = verifier(pool.clone());
    let first = verifier.perform_full_consistency_check().await.unwrap();
    let second = verifier.perform_full_consistency_check().await.unwrap();

    assert_eq!(first.discrepancies_found, second.discrepancies_found);
    assert_eq!(first.consistency_score, second.consistency_score);
    assert_eq!(first.manual_review_required, 1);
    assert_eq!(second.auto_resolved, 0);

    // Both runs are kept for audit
    let all = query_discrepancies(&pool, &DiscrepancyFilter::default()).await.unwrap();
    assert_eq!(all.len(), 4);
}

#[tokio::test]
async fn test_low_score_raises_critical_alert_and_resolution_is_counted() {
    let (_dir, pool) = test_db().await;
    add_vehicle(&pool, "v1", Some("D1"), None).await;
    add_vehicle(&pool, "v2", Some("D2"), None).await;

    sqlx::query(
        "INSERT INTO provider_sessions (id, user_id, token, expires_at, created_at) \
         VALUES ('s1', 'ghost', 't', ?, ?)",
    )
    .bind(to_db_timestamp(&(Utc::now() + ChronoDuration::hours(1))))
    .bind(to_db_timestamp(&Utc::now()))
    .execute(&pool)
    .await
    .unwrap();

    let verifier = verifier(pool.clone());
    let result = verifier.perform_full_consistency_check().await.unwrap();
    assert_eq!(result.total_entities_checked, 3);
    assert_eq!(result.discrepancies_found, 3);
    assert_eq!(result.consistency_score, 0);

    let alerts = query_alerts(&pool, None, None).await.unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].level, fleet_common::models::AlertLevel::Critical);

    sqlx::query("UPDATE vehicles SET name = 'Fixed' WHERE id = 'v1'")
        .execute(&pool)
        .await
        .unwrap();
    let after = verifier.perform_full_consistency_check().await.unwrap();
    assert_eq!(after.discrepancies_found, 2);
    assert_eq!(after.auto_resolved, 1);
}
