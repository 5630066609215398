//! Sync watermark persistence (one row per polling scope)

use chrono::Utc;
use fleet_common::models::SyncWatermark;
use fleet_common::time::{from_db_timestamp, to_db_timestamp};
use fleet_common::Result;
use sqlx::{Row, SqlitePool};

/// Scope used by the position poller
pub const POSITIONS_SCOPE: &str = "positions";

/// Load the watermark for `scope`; a scope never polled yields the default
pub async fn load_watermark(pool: &SqlitePool, scope: &str) -> Result<SyncWatermark> {
    let row = sqlx::query(
        "SELECT last_query_time, last_success_at, error_count, last_error \
         FROM sync_watermark WHERE scope = ?",
    )
    .bind(scope)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(SyncWatermark::default());
    };

    let last_success_at: Option<String> = row.get("last_success_at");
    let error_count: i64 = row.get("error_count");

    Ok(SyncWatermark {
        last_query_time: row.get("last_query_time"),
        last_success_at: last_success_at
            .as_deref()
            .map(from_db_timestamp)
            .transpose()?,
        error_count: u32::try_from(error_count).unwrap_or(u32::MAX),
        last_error: row.get("last_error"),
    })
}

/// Replace the stored watermark for `scope` in a single statement
pub async fn save_watermark(pool: &SqlitePool, scope: &str, watermark: &SyncWatermark) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO sync_watermark (scope, last_query_time, last_success_at, error_count, last_error, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(scope) DO UPDATE SET
            last_query_time = excluded.last_query_time,
            last_success_at = excluded.last_success_at,
            error_count = excluded.error_count,
            last_error = excluded.last_error,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(scope)
    .bind(&watermark.last_query_time)
    .bind(watermark.last_success_at.as_ref().map(to_db_timestamp))
    .bind(watermark.error_count as i64)
    .bind(&watermark.last_error)
    .bind(to_db_timestamp(&Utc::now()))
    .execute(pool)
    .await?;
    Ok(())
}

/// Every stored scope with its watermark
pub async fn all_watermarks(pool: &SqlitePool) -> Result<Vec<(String, SyncWatermark)>> {
    let scopes: Vec<String> = sqlx::query_scalar("SELECT scope FROM sync_watermark ORDER BY scope")
        .fetch_all(pool)
        .await?;

    let mut watermarks = Vec::with_capacity(scopes.len());
    for scope in scopes {
        let watermark = load_watermark(pool, &scope).await?;
        watermarks.push((scope, watermark));
    }
    Ok(watermarks)
}
