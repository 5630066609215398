//! Consistency audit log
//!
//! Runs, discrepancies and alerts are append-only. Nothing here updates or
//! deletes a stored record.

use fleet_common::models::{
    AlertLevel, ConsistencyAlert, ConsistencyCheckResult, Discrepancy, DiscrepancyType, Severity,
};
use fleet_common::time::{from_db_timestamp, to_db_timestamp};
use fleet_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::HashSet;
use std::str::FromStr;
use uuid::Uuid;

/// Default and maximum page sizes for audit queries
pub const DEFAULT_QUERY_LIMIT: u32 = 100;
pub const MAX_QUERY_LIMIT: u32 = 1000;

/// Filter for discrepancy queries
#[derive(Debug, Clone, Default)]
pub struct DiscrepancyFilter {
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub severity: Option<Severity>,
    pub check_id: Option<Uuid>,
    pub limit: Option<u32>,
}

/// Store one verifier run, its findings and its alert atomically
pub async fn record_check(
    pool: &SqlitePool,
    result: &ConsistencyCheckResult,
    discrepancies: &[Discrepancy],
    alert: Option<&ConsistencyAlert>,
) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO consistency_checks (
            id, total_entities_checked, discrepancies_found, auto_resolved,
            manual_review_required, consistency_score, started_at, completed_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(result.check_id.to_string())
    .bind(result.total_entities_checked as i64)
    .bind(result.discrepancies_found as i64)
    .bind(result.auto_resolved as i64)
    .bind(result.manual_review_required as i64)
    .bind(result.consistency_score as i64)
    .bind(to_db_timestamp(&result.started_at))
    .bind(to_db_timestamp(&result.completed_at))
    .execute(&mut *tx)
    .await?;

    for discrepancy in discrepancies {
        sqlx::query(
            r#"
            INSERT INTO consistency_discrepancies (
                id, check_id, discrepancy_type, entity_type, entity_id, severity,
                description, provider_data, local_data, detected_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(discrepancy.id.to_string())
        .bind(discrepancy.check_id.to_string())
        .bind(discrepancy.discrepancy_type.as_str())
        .bind(&discrepancy.entity_type)
        .bind(&discrepancy.entity_id)
        .bind(discrepancy.severity.as_str())
        .bind(&discrepancy.description)
        .bind(discrepancy.provider_data.as_ref().map(|v| v.to_string()))
        .bind(discrepancy.local_data.as_ref().map(|v| v.to_string()))
        .bind(to_db_timestamp(&discrepancy.detected_at))
        .execute(&mut *tx)
        .await?;
    }

    if let Some(alert) = alert {
        sqlx::query(
            r#"
            INSERT INTO consistency_alerts (
                id, check_id, level, consistency_score, discrepancies_found,
                manual_review_required, message, raised_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(alert.id.to_string())
        .bind(alert.check_id.to_string())
        .bind(alert.level.as_str())
        .bind(alert.consistency_score as i64)
        .bind(alert.discrepancies_found as i64)
        .bind(alert.manual_review_required as i64)
        .bind(&alert.message)
        .bind(to_db_timestamp(&alert.raised_at))
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Most recent completed run
pub async fn latest_check(pool: &SqlitePool) -> Result<Option<ConsistencyCheckResult>> {
    let row = sqlx::query(
        r#"
        SELECT id, total_entities_checked, discrepancies_found, auto_resolved,
               manual_review_required, consistency_score, started_at, completed_at
        FROM consistency_checks
        ORDER BY completed_at DESC, rowid DESC
        LIMIT 1
        "#,
    )
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(check_from_row).transpose()
}

/// Identity keys of the findings of the most recent run
pub async fn latest_discrepancy_keys(
    pool: &SqlitePool,
) -> Result<HashSet<(DiscrepancyType, String, String)>> {
    let Some(latest) = latest_check(pool).await? else {
        return Ok(HashSet::new());
    };

    let filter = DiscrepancyFilter {
        check_id: Some(latest.check_id),
        limit: Some(u32::MAX),
        ..Default::default()
    };
    Ok(query_discrepancies(pool, &filter)
        .await?
        .iter()
        .map(Discrepancy::key)
        .collect())
}

/// Discrepancies matching `filter`, newest first
pub async fn query_discrepancies(
    pool: &SqlitePool,
    filter: &DiscrepancyFilter,
) -> Result<Vec<Discrepancy>> {
    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
        "SELECT id, check_id, discrepancy_type, entity_type, entity_id, severity, \
         description, provider_data, local_data, detected_at \
         FROM consistency_discrepancies WHERE 1 = 1",
    );
    if let Some(entity_type) = &filter.entity_type {
        builder.push(" AND entity_type = ").push_bind(entity_type.clone());
    }
    if let Some(entity_id) = &filter.entity_id {
        builder.push(" AND entity_id = ").push_bind(entity_id.clone());
    }
    if let Some(severity) = filter.severity {
        builder.push(" AND severity = ").push_bind(severity.as_str());
    }
    if let Some(check_id) = filter.check_id {
        builder.push(" AND check_id = ").push_bind(check_id.to_string());
    }
    builder
        .push(" ORDER BY detected_at DESC, rowid DESC LIMIT ")
        .push_bind(effective_limit(filter.limit));

    let rows = builder.build().fetch_all(pool).await?;
    rows.iter().map(discrepancy_from_row).collect()
}

/// Alerts, newest first, optionally restricted to one level
pub async fn query_alerts(
    pool: &SqlitePool,
    level: Option<AlertLevel>,
    limit: Option<u32>,
) -> Result<Vec<ConsistencyAlert>> {
    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
        "SELECT id, check_id, level, consistency_score, discrepancies_found, \
         manual_review_required, message, raised_at FROM consistency_alerts WHERE 1 = 1",
    );
    if let Some(level) = level {
        builder.push(" AND level = ").push_bind(level.as_str());
    }
    builder
        .push(" ORDER BY raised_at DESC, rowid DESC LIMIT ")
        .push_bind(effective_limit(limit));

    let rows = builder.build().fetch_all(pool).await?;
    rows.iter().map(alert_from_row).collect()
}

fn effective_limit(limit: Option<u32>) -> i64 {
    match limit {
        Some(u32::MAX) => -1,
        Some(limit) => limit.clamp(1, MAX_QUERY_LIMIT) as i64,
        None => DEFAULT_QUERY_LIMIT as i64,
    }
}

fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| Error::Internal(format!("Invalid stored id '{}': {}", value, e)))
}

fn parse_json(value: Option<String>) -> Option<serde_json::Value> {
    value.and_then(|raw| serde_json::from_str(&raw).ok())
}

fn count(row: &SqliteRow, column: &str) -> u64 {
    let value: i64 = row.get(column);
    value.max(0) as u64
}

fn check_from_row(row: &SqliteRow) -> Result<ConsistencyCheckResult> {
    let id: String = row.get("id");
    let score: i64 = row.get("consistency_score");
    let started_at: String = row.get("started_at");
    let completed_at: String = row.get("completed_at");

    Ok(ConsistencyCheckResult {
        check_id: parse_uuid(&id)?,
        total_entities_checked: count(row, "total_entities_checked"),
        discrepancies_found: count(row, "discrepancies_found"),
        auto_resolved: count(row, "auto_resolved"),
        manual_review_required: count(row, "manual_review_required"),
        consistency_score: score.clamp(0, 100) as u8,
        started_at: from_db_timestamp(&started_at)?,
        completed_at: from_db_timestamp(&completed_at)?,
    })
}

fn discrepancy_from_row(row: &SqliteRow) -> Result<Discrepancy> {
    let id: String = row.get("id");
    let check_id: String = row.get("check_id");
    let kind: String = row.get("discrepancy_type");
    let severity: String = row.get("severity");
    let detected_at: String = row.get("detected_at");

    Ok(Discrepancy {
        id: parse_uuid(&id)?,
        check_id: parse_uuid(&check_id)?,
        discrepancy_type: DiscrepancyType::from_str(&kind)?,
        entity_type: row.get("entity_type"),
        entity_id: row.get("entity_id"),
        severity: Severity::from_str(&severity)?,
        description: row.get("description"),
        provider_data: parse_json(row.get("provider_data")),
        local_data: parse_json(row.get("local_data")),
        detected_at: from_db_timestamp(&detected_at)?,
    })
}

fn alert_from_row(row: &SqliteRow) -> Result<ConsistencyAlert> {
    let id: String = row.get("id");
    let check_id: String = row.get("check_id");
    let level: String = row.get("level");
    let score: i64 = row.get("consistency_score");
    let raised_at: String = row.get("raised_at");

    Ok(ConsistencyAlert {
        id: parse_uuid(&id)?,
        check_id: parse_uuid(&check_id)?,
        level: AlertLevel::from_str(&level)?,
        consistency_score: score.clamp(0, 100) as u8,
        discrepancies_found: count(row, "discrepancies_found"),
        manual_review_required: count(row, "manual_review_required"),
        message: row.get("message"),
        raised_at: from_db_timestamp(&raised_at)?,
    })
}
