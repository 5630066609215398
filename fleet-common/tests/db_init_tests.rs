//! Database initialization tests

use fleet_common::db::init_database;

const EXPECTED_TABLES: &[&str] = &[
    "settings",
    "users",
    "vehicles",
    "provider_credentials",
    "provider_sessions",
    "client_sessions",
    "device_positions",
    "latest_positions",
    "sync_watermark",
    "consistency_checks",
    "consistency_discrepancies",
    "consistency_alerts",
];

#[tokio::test]
async fn test_init_creates_all_tables() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("fleet.db");

    let pool = init_database(&db_path).await.unwrap();
    assert!(db_path.exists());

    for table in EXPECTED_TABLES {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
        )
        .bind(table)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(count, 1, "table {} should exist", table);
    }
}

#[tokio::test]
async fn test_init_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("fleet.db");

    let pool = init_database(&db_path).await.unwrap();
    sqlx::query("INSERT INTO settings (key, value) VALUES ('batch_size', '25')")
        .execute(&pool)
        .await
        .unwrap();
    pool.close().await;

    // Second open must keep existing rows
    let pool = init_database(&db_path).await.unwrap();
    let value: String = sqlx::query_scalar("SELECT value FROM settings WHERE key = 'batch_size'")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(value, "25");
}

#[tokio::test]
async fn test_init_under_a_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"x").unwrap();

    let result = init_database(&blocker.join("fleet.db")).await;
    assert!(matches!(result, Err(fleet_common::Error::Io(_))));
}
