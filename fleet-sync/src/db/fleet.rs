//! Read-only access to fleet registry tables
//!
//! `vehicles`, `users` and `provider_sessions` belong to the CRUD and auth
//! side of the console. The verifier only reads them.

use fleet_common::Result;
use serde::Serialize;
use sqlx::{FromRow, SqlitePool};

#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct VehicleRow {
    pub id: String,
    pub device_id: Option<String>,
    pub name: Option<String>,
    pub plate_number: Option<String>,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct ProviderSessionRow {
    pub id: String,
    pub user_id: Option<String>,
    pub expires_at: String,
}

pub async fn list_vehicles(pool: &SqlitePool) -> Result<Vec<VehicleRow>> {
    let rows = sqlx::query_as::<_, VehicleRow>(
        "SELECT id, device_id, name, plate_number, user_id FROM vehicles ORDER BY id",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn list_provider_sessions(pool: &SqlitePool) -> Result<Vec<ProviderSessionRow>> {
    let rows = sqlx::query_as::<_, ProviderSessionRow>(
        "SELECT id, user_id, expires_at FROM provider_sessions ORDER BY id",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn list_user_ids(pool: &SqlitePool) -> Result<Vec<String>> {
    let ids = sqlx::query_scalar("SELECT id FROM users ORDER BY id")
        .fetch_all(pool)
        .await?;
    Ok(ids)
}
