//! Position persistence
//!
//! Every persisted sample is appended to `device_positions`. The newest
//! sample per device in a batch is upserted into `latest_positions`; the
//! upsert only replaces a stored row when the incoming device timestamp is
//! not older, so a late-arriving sample never moves a device backwards.

use async_trait::async_trait;
use fleet_common::time::{from_db_timestamp, to_db_timestamp};
use fleet_common::DevicePosition;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::collections::HashMap;
use tracing::debug;

use crate::batch::PositionSink;
use crate::error::PipelineResult;

/// [`PositionSink`] writing to the local SQLite store
#[derive(Clone)]
pub struct SqlitePositionSink {
    pool: SqlitePool,
}

impl SqlitePositionSink {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PositionSink for SqlitePositionSink {
    async fn persist_batch(&self, positions: &[DevicePosition]) -> PipelineResult<()> {
        if positions.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for position in positions {
            insert_history(&mut tx, position).await?;
        }
        let newest = newest_per_device(positions);
        for position in &newest {
            upsert_latest(&mut tx, position).await?;
        }
        tx.commit().await?;

        debug!(
            samples = positions.len(),
            devices = newest.len(),
            "Persisted position batch"
        );
        Ok(())
    }
}

/// Newest sample per device, ties going to the later entry
///
/// Output keeps the order in which devices first appear in the batch.
pub fn newest_per_device(positions: &[DevicePosition]) -> Vec<&DevicePosition> {
    let mut order: Vec<&str> = Vec::new();
    let mut newest: HashMap<&str, &DevicePosition> = HashMap::new();

    for position in positions {
        let replace = match newest.get(position.device_id.as_str()) {
            Some(current) => current.device_timestamp <= position.device_timestamp,
            None => {
                order.push(&position.device_id);
                true
            }
        };
        if replace {
            newest.insert(&position.device_id, position);
        }
    }

    order
        .into_iter()
        .filter_map(|device_id| newest.get(device_id).copied())
        .collect()
}

async fn insert_history(
    tx: &mut Transaction<'_, Sqlite>,
    position: &DevicePosition,
) -> PipelineResult<()> {
    sqlx::query(
        r#"
        INSERT INTO device_positions (
            device_id, latitude, longitude, speed, course, altitude,
            device_timestamp, server_timestamp, status_code, is_moving,
            voltage, fuel_level, signal_strength, satellite_count
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&position.device_id)
    .bind(position.latitude)
    .bind(position.longitude)
    .bind(position.speed)
    .bind(position.course as i64)
    .bind(position.altitude)
    .bind(to_db_timestamp(&position.device_timestamp))
    .bind(to_db_timestamp(&position.server_timestamp))
    .bind(position.status_code)
    .bind(position.is_moving)
    .bind(position.voltage)
    .bind(position.fuel_level)
    .bind(position.signal_strength)
    .bind(position.satellite_count)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn upsert_latest(
    tx: &mut Transaction<'_, Sqlite>,
    position: &DevicePosition,
) -> PipelineResult<()> {
    sqlx::query(
        r#"
        INSERT INTO latest_positions (
            device_id, latitude, longitude, speed, course, altitude,
            device_timestamp, server_timestamp, status_code, is_moving,
            voltage, fuel_level, signal_strength, satellite_count
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(device_id) DO UPDATE SET
            latitude = excluded.latitude,
            longitude = excluded.longitude,
            speed = excluded.speed,
            course = excluded.course,
            altitude = excluded.altitude,
            device_timestamp = excluded.device_timestamp,
            server_timestamp = excluded.server_timestamp,
            status_code = excluded.status_code,
            is_moving = excluded.is_moving,
            voltage = excluded.voltage,
            fuel_level = excluded.fuel_level,
            signal_strength = excluded.signal_strength,
            satellite_count = excluded.satellite_count
        WHERE excluded.device_timestamp >= latest_positions.device_timestamp
        "#,
    )
    .bind(&position.device_id)
    .bind(position.latitude)
    .bind(position.longitude)
    .bind(position.speed)
    .bind(position.course as i64)
    .bind(position.altitude)
    .bind(to_db_timestamp(&position.device_timestamp))
    .bind(to_db_timestamp(&position.server_timestamp))
    .bind(position.status_code)
    .bind(position.is_moving)
    .bind(position.voltage)
    .bind(position.fuel_level)
    .bind(position.signal_strength)
    .bind(position.satellite_count)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

const POSITION_COLUMNS: &str = "lp.device_id, lp.latitude, lp.longitude, lp.speed, lp.course, \
     lp.altitude, lp.device_timestamp, lp.server_timestamp, lp.status_code, lp.is_moving, \
     lp.voltage, lp.fuel_level, lp.signal_strength, lp.satellite_count";

fn position_from_row(row: &SqliteRow) -> fleet_common::Result<DevicePosition> {
    let course: i64 = row.get("course");
    let device_timestamp: String = row.get("device_timestamp");
    let server_timestamp: String = row.get("server_timestamp");

    Ok(DevicePosition {
        device_id: row.get("device_id"),
        latitude: row.get("latitude"),
        longitude: row.get("longitude"),
        speed: row.get("speed"),
        course: u16::try_from(course.rem_euclid(360)).unwrap_or(0),
        altitude: row.get("altitude"),
        device_timestamp: from_db_timestamp(&device_timestamp)?,
        server_timestamp: from_db_timestamp(&server_timestamp)?,
        status_code: row.get("status_code"),
        is_moving: row.get("is_moving"),
        voltage: row.get("voltage"),
        fuel_level: row.get("fuel_level"),
        signal_strength: row.get("signal_strength"),
        satellite_count: row.get("satellite_count"),
    })
}

/// Latest stored position for one device
pub async fn latest_position(
    pool: &SqlitePool,
    device_id: &str,
) -> fleet_common::Result<Option<DevicePosition>> {
    let sql = format!(
        "SELECT {} FROM latest_positions lp WHERE lp.device_id = ?",
        POSITION_COLUMNS
    );
    let row = sqlx::query(&sql)
        .bind(device_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(position_from_row).transpose()
}

/// Latest positions of every vehicle owned by `user_id`
///
/// `filter` narrows the result to the given device ids; empty means all of
/// the user's devices. One row per device.
pub async fn latest_positions_for_user(
    pool: &SqlitePool,
    user_id: &str,
    filter: &[String],
) -> fleet_common::Result<Vec<DevicePosition>> {
    let sql = format!(
        r#"
        SELECT {}
        FROM latest_positions lp
        WHERE lp.device_id IN (
            SELECT device_id FROM vehicles WHERE user_id = ? AND device_id IS NOT NULL
        )
        ORDER BY lp.device_id
        "#,
        POSITION_COLUMNS
    );
    let rows = sqlx::query(&sql).bind(user_id).fetch_all(pool).await?;

    rows.iter()
        .map(position_from_row)
        .filter(|result| match result {
            Ok(position) => filter.is_empty() || filter.contains(&position.device_id),
            Err(_) => true,
        })
        .collect()
}

/// All latest positions, used by the staleness check
pub async fn all_latest_positions(pool: &SqlitePool) -> fleet_common::Result<Vec<DevicePosition>> {
    let sql = format!(
        "SELECT {} FROM latest_positions lp ORDER BY lp.device_id",
        POSITION_COLUMNS
    );
    let rows = sqlx::query(&sql).fetch_all(pool).await?;
    rows.iter().map(position_from_row).collect()
}

/// Number of history rows stored for a device
pub async fn history_count(pool: &SqlitePool, device_id: &str) -> fleet_common::Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM device_positions WHERE device_id = ?")
        .bind(device_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}
