//! Settings table access (key-value store)

use fleet_common::{Error, Result};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;

/// Read and parse a setting; `None` when the key is absent
pub async fn get_setting<T: FromStr>(db: &Pool<Sqlite>, key: &str) -> Result<Option<T>> {
    let value: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(db)
        .await?;

    match value {
        Some(s) => match s.trim().parse::<T>() {
            Ok(parsed) => Ok(Some(parsed)),
            Err(_) => Err(Error::Config(format!(
                "Failed to parse setting '{}' value: {}",
                key, s
            ))),
        },
        None => Ok(None),
    }
}

const UPSERT_SETTING: &str = r#"
    INSERT INTO settings (key, value, updated_at)
    VALUES (?, ?, CURRENT_TIMESTAMP)
    ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP
"#;

/// Insert or update a setting
pub async fn set_setting<T: ToString>(db: &Pool<Sqlite>, key: &str, value: T) -> Result<()> {
    sqlx::query(UPSERT_SETTING)
        .bind(key)
        .bind(value.to_string())
        .execute(db)
        .await?;

    Ok(())
}

/// Write several settings in one transaction; all or none are stored
pub async fn set_settings(db: &Pool<Sqlite>, entries: &[(&str, String)]) -> Result<()> {
    let mut tx = db.begin().await?;
    for (key, value) in entries {
        sqlx::query(UPSERT_SETTING)
            .bind(*key)
            .bind(value.as_str())
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::setup_test_db;

    #[tokio::test]
    async fn test_missing_setting_is_none() {
        let (_dir, pool) = setup_test_db().await;
        let value: Option<u64> = get_setting(&pool, "poll_interval_secs").await.unwrap();
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn test_set_then_get_overwrites() {
        let (_dir, pool) = setup_test_db().await;
        set_setting(&pool, "batch_size", 50).await.unwrap();
        set_setting(&pool, "batch_size", 75).await.unwrap();
        let value: Option<usize> = get_setting(&pool, "batch_size").await.unwrap();
        assert_eq!(value, Some(75));
    }

    #[tokio::test]
    async fn test_set_settings_writes_every_entry() {
        let (_dir, pool) = setup_test_db().await;
        set_settings(
            &pool,
            &[("batch_size", "20".to_string()), ("poll_interval_secs", "15".to_string())],
        )
        .await
        .unwrap();
        let batch: Option<usize> = get_setting(&pool, "batch_size").await.unwrap();
        let interval: Option<u64> = get_setting(&pool, "poll_interval_secs").await.unwrap();
        assert_eq!(batch, Some(20));
        assert_eq!(interval, Some(15));
    }

    #[tokio::test]
    async fn test_unparseable_setting_is_config_error() {
        let (_dir, pool) = setup_test_db().await;
        set_setting(&pool, "batch_size", "lots").await.unwrap();
        let result: Result<Option<usize>> = get_setting(&pool, "batch_size").await;
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
