//! Session table access
//!
//! `provider_sessions` holds upstream tokens, `client_sessions` maps socket
//! client tokens to users. Both are written by the account side of the
//! console; the gateway only inserts a provider session after it had to
//! authenticate itself.

use chrono::{DateTime, Utc};
use fleet_common::time::{from_db_timestamp, to_db_timestamp};
use fleet_common::Result;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Newest provider session that has not yet expired at `now`
pub async fn latest_valid_provider_session(
    pool: &SqlitePool,
    now: DateTime<Utc>,
) -> Result<Option<(String, DateTime<Utc>)>> {
    let row = sqlx::query(
        r#"
        SELECT token, expires_at
        FROM provider_sessions
        WHERE expires_at > ?
        ORDER BY expires_at DESC
        LIMIT 1
        "#,
    )
    .bind(to_db_timestamp(&now))
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => {
            let token: String = row.get("token");
            let expires_at: String = row.get("expires_at");
            Ok(Some((token, from_db_timestamp(&expires_at)?)))
        }
        None => Ok(None),
    }
}

/// Record a provider session obtained by the gateway
pub async fn insert_provider_session(
    pool: &SqlitePool,
    user_id: Option<&str>,
    token: &str,
    expires_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO provider_sessions (id, user_id, token, expires_at, created_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(user_id)
    .bind(token)
    .bind(to_db_timestamp(&expires_at))
    .bind(to_db_timestamp(&Utc::now()))
    .execute(pool)
    .await?;
    Ok(())
}

/// Stored provider account credentials, if configured
pub async fn provider_credentials(pool: &SqlitePool) -> Result<Option<(String, String)>> {
    let row = sqlx::query("SELECT username, password_hash FROM provider_credentials WHERE id = 1")
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| (r.get("username"), r.get("password_hash"))))
}

/// User bound to a non-expired client token
pub async fn user_for_client_token(
    pool: &SqlitePool,
    token: &str,
    now: DateTime<Utc>,
) -> Result<Option<String>> {
    let user_id: Option<String> = sqlx::query_scalar(
        "SELECT user_id FROM client_sessions WHERE token = ? AND expires_at > ?",
    )
    .bind(token)
    .bind(to_db_timestamp(&now))
    .fetch_optional(pool)
    .await?;
    Ok(user_id)
}
