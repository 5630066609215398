//! Runtime settings loaded from the database
//!
//! Every setting has a built-in default. A missing key is initialized with
//! its default and written back so the `settings` table always shows the
//! values actually in effect.

use crate::db::settings::{get_setting, set_setting};
use fleet_common::Result;
use sqlx::SqlitePool;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

pub const KEY_POLL_INTERVAL_SECS: &str = "poll_interval_secs";
pub const KEY_TRACKED_DEVICE_IDS: &str = "tracked_device_ids";
pub const KEY_BASE_DELAY_MS: &str = "rate_limit_base_delay_ms";
pub const KEY_MAX_RETRIES: &str = "rate_limit_max_retries";
pub const KEY_CIRCUIT_THRESHOLD: &str = "rate_limit_circuit_threshold";
pub const KEY_BATCH_SIZE: &str = "batch_size";
pub const KEY_VERIFIER_INTERVAL_SECS: &str = "verifier_interval_secs";
pub const KEY_STALE_POSITION_SECS: &str = "stale_position_secs";
pub const KEY_SYNC_STALE_SECS: &str = "sync_stale_secs";
pub const KEY_CLIENT_PING_TIMEOUT_SECS: &str = "client_ping_timeout_secs";

/// Runtime settings in effect for this process
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeSettings {
    // === Poller ===
    pub poll_interval_secs: u64,
    /// Devices to request; empty means all devices
    pub tracked_device_ids: Vec<String>,

    // === Rate limiter ===
    pub rate_limit_base_delay_ms: u64,
    pub rate_limit_max_retries: u32,
    pub rate_limit_circuit_threshold: u32,

    // === Write-back queue ===
    pub batch_size: usize,

    // === Verifier ===
    pub verifier_interval_secs: u64,
    pub stale_position_secs: u64,
    pub sync_stale_secs: u64,

    // === Fan-out hub ===
    pub client_ping_timeout_secs: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            tracked_device_ids: Vec::new(),
            rate_limit_base_delay_ms: 1000,
            rate_limit_max_retries: 3,
            rate_limit_circuit_threshold: 5,
            batch_size: 50,
            verifier_interval_secs: 300,
            stale_position_secs: 3600,
            sync_stale_secs: 300,
            client_ping_timeout_secs: 300,
        }
    }
}

impl RuntimeSettings {
    /// Load all settings, writing defaults back for missing keys
    pub async fn load(pool: &SqlitePool) -> Result<Self> {
        let defaults = Self::default();

        let tracked = load_or_init(pool, KEY_TRACKED_DEVICE_IDS, String::new()).await?;

        let settings = Self {
            poll_interval_secs: load_or_init(pool, KEY_POLL_INTERVAL_SECS, defaults.poll_interval_secs)
                .await?
                .max(1),
            tracked_device_ids: parse_device_list(&tracked),
            rate_limit_base_delay_ms: load_or_init(pool, KEY_BASE_DELAY_MS, defaults.rate_limit_base_delay_ms)
                .await?,
            rate_limit_max_retries: load_or_init(pool, KEY_MAX_RETRIES, defaults.rate_limit_max_retries)
                .await?,
            rate_limit_circuit_threshold: load_or_init(
                pool,
                KEY_CIRCUIT_THRESHOLD,
                defaults.rate_limit_circuit_threshold,
            )
            .await?,
            batch_size: load_or_init(pool, KEY_BATCH_SIZE, defaults.batch_size).await?.max(1),
            verifier_interval_secs: load_or_init(
                pool,
                KEY_VERIFIER_INTERVAL_SECS,
                defaults.verifier_interval_secs,
            )
            .await?
            .max(1),
            stale_position_secs: load_or_init(pool, KEY_STALE_POSITION_SECS, defaults.stale_position_secs)
                .await?,
            sync_stale_secs: load_or_init(pool, KEY_SYNC_STALE_SECS, defaults.sync_stale_secs).await?,
            client_ping_timeout_secs: load_or_init(
                pool,
                KEY_CLIENT_PING_TIMEOUT_SECS,
                defaults.client_ping_timeout_secs,
            )
            .await?,
        };

        info!("Loaded runtime settings from database");
        Ok(settings)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn verifier_interval(&self) -> Duration {
        Duration::from_secs(self.verifier_interval_secs)
    }

    pub fn client_ping_timeout(&self) -> Duration {
        Duration::from_secs(self.client_ping_timeout_secs)
    }
}

async fn load_or_init<T>(pool: &SqlitePool, key: &str, default: T) -> Result<T>
where
    T: FromStr + Display,
{
    match get_setting::<T>(pool, key).await? {
        Some(value) => Ok(value),
        None => {
            info!("Setting '{}' not found in database, using default: {}", key, default);
            set_setting(pool, key, &default).await?;
            Ok(default)
        }
    }
}

/// Split a comma separated device list, ignoring blanks
pub fn parse_device_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
