//! Database initialization
//!
//! Creates every table the pipeline reads or writes. All statements are
//! `CREATE ... IF NOT EXISTS`, so this is safe to run on every startup.
//!
//! `users`, `vehicles`, `provider_credentials`, `provider_sessions` and
//! `client_sessions` belong to the account/CRUD side of the console. They
//! are created here only so a fresh database is usable; the pipeline never
//! writes `users` or `vehicles`.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Open (creating if needed) the database and ensure the schema exists
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let pool = open_pool(db_path).await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    create_schema(&pool).await?;
    Ok(pool)
}

/// Open a connection pool with the pragmas the pipeline relies on
pub async fn open_pool(db_path: &Path) -> Result<SqlitePool> {
    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&db_url)
        .await?;

    // WAL lets the verifier read while the batch processor writes
    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
    sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;
    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;

    Ok(pool)
}

async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_settings_table(pool).await?;
    create_account_tables(pool).await?;
    create_position_tables(pool).await?;
    create_sync_watermark_table(pool).await?;
    create_consistency_tables(pool).await?;
    info!("Database schema verified");
    Ok(())
}

async fn create_settings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_account_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            email TEXT,
            display_name TEXT,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    // device_id is deliberately not UNIQUE: duplicates are a finding for
    // the consistency verifier, not a write error for the CRUD side
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS vehicles (
            id TEXT PRIMARY KEY,
            device_id TEXT,
            name TEXT,
            plate_number TEXT,
            user_id TEXT,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_vehicles_device ON vehicles(device_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS provider_credentials (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            username TEXT NOT NULL,
            password_hash TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS provider_sessions (
            id TEXT PRIMARY KEY,
            user_id TEXT,
            token TEXT NOT NULL,
            expires_at TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS client_sessions (
            token TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            expires_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_position_tables(pool: &SqlitePool) -> Result<()> {
    // Append-only history
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS device_positions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            device_id TEXT NOT NULL,
            latitude REAL NOT NULL,
            longitude REAL NOT NULL,
            speed REAL NOT NULL,
            course INTEGER NOT NULL,
            altitude REAL NOT NULL,
            device_timestamp TEXT NOT NULL,
            server_timestamp TEXT NOT NULL,
            status_code INTEGER NOT NULL,
            is_moving INTEGER NOT NULL,
            voltage REAL,
            fuel_level REAL,
            signal_strength INTEGER,
            satellite_count INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_device_positions_device_time \
         ON device_positions(device_id, device_timestamp)",
    )
    .execute(pool)
    .await?;

    // One row per device, last write wins
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS latest_positions (
            device_id TEXT PRIMARY KEY,
            latitude REAL NOT NULL,
            longitude REAL NOT NULL,
            speed REAL NOT NULL,
            course INTEGER NOT NULL,
            altitude REAL NOT NULL,
            device_timestamp TEXT NOT NULL,
            server_timestamp TEXT NOT NULL,
            status_code INTEGER NOT NULL,
            is_moving INTEGER NOT NULL,
            voltage REAL,
            fuel_level REAL,
            signal_strength INTEGER,
            satellite_count INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_sync_watermark_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_watermark (
            scope TEXT PRIMARY KEY,
            last_query_time TEXT,
            last_success_at TEXT,
            error_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_consistency_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS consistency_checks (
            id TEXT PRIMARY KEY,
            total_entities_checked INTEGER NOT NULL,
            discrepancies_found INTEGER NOT NULL,
            auto_resolved INTEGER NOT NULL,
            manual_review_required INTEGER NOT NULL,
            consistency_score INTEGER NOT NULL,
            started_at TEXT NOT NULL,
            completed_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS consistency_discrepancies (
            id TEXT PRIMARY KEY,
            check_id TEXT NOT NULL REFERENCES consistency_checks(id),
            discrepancy_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            severity TEXT NOT NULL,
            description TEXT NOT NULL,
            provider_data TEXT,
            local_data TEXT,
            detected_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_discrepancies_entity \
         ON consistency_discrepancies(entity_type, entity_id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_discrepancies_severity \
         ON consistency_discrepancies(severity)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS consistency_alerts (
            id TEXT PRIMARY KEY,
            check_id TEXT NOT NULL REFERENCES consistency_checks(id),
            level TEXT NOT NULL,
            consistency_score INTEGER NOT NULL,
            discrepancies_found INTEGER NOT NULL,
            manual_review_required INTEGER NOT NULL,
            message TEXT NOT NULL,
            raised_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
