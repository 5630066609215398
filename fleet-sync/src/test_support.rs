//! Shared fixtures for unit tests

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use fleet_common::DevicePosition;
use sqlx::SqlitePool;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::Notify;

use crate::error::PipelineResult;
use crate::provider::{PositionsResponse, ProviderApi, ProviderSession};
use crate::session::SessionGateway;

/// Fresh database in a temp dir; keep the `TempDir` alive for the test
pub async fn setup_test_db() -> (TempDir, SqlitePool) {
    let dir = TempDir::new().unwrap();
    let pool = fleet_common::db::init_database(&dir.path().join("fleet.db"))
        .await
        .unwrap();
    (dir, pool)
}

pub fn sample_position(device_id: &str, latitude: f64, longitude: f64) -> DevicePosition {
    let now = Utc::now();
    DevicePosition {
        device_id: device_id.to_string(),
        latitude,
        longitude,
        speed: 0.0,
        course: 0,
        altitude: 0.0,
        device_timestamp: now,
        server_timestamp: now,
        status_code: 0,
        is_moving: false,
        voltage: None,
        fuel_level: None,
        signal_strength: None,
        satellite_count: None,
    }
}

/// Gateway with a fixed upstream token and a fixed client token table
pub struct StaticSessions {
    pub token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub clients: Vec<(String, String)>,
}

impl StaticSessions {
    pub fn valid() -> Self {
        Self {
            token: Some("upstream-token".into()),
            expires_at: Some(Utc::now() + ChronoDuration::hours(1)),
            clients: Vec::new(),
        }
    }

    pub fn none() -> Self {
        Self {
            token: None,
            expires_at: None,
            clients: Vec::new(),
        }
    }

    pub fn with_client(mut self, token: &str, user_id: &str) -> Self {
        self.clients.push((token.to_string(), user_id.to_string()));
        self
    }
}

#[async_trait]
impl SessionGateway for StaticSessions {
    async fn get_valid_token(&self) -> PipelineResult<Option<String>> {
        Ok(self.token.clone())
    }

    async fn token_expires_at(&self) -> PipelineResult<Option<DateTime<Utc>>> {
        Ok(self.expires_at)
    }

    async fn resolve_client_token(&self, token: &str) -> PipelineResult<Option<String>> {
        Ok(self
            .clients
            .iter()
            .find(|(t, _)| t == token)
            .map(|(_, user)| user.clone()))
    }
}

/// Provider that replays queued responses for `fetch_positions`
///
/// Once the script runs out every call returns an empty success. A held
/// provider parks each fetch until its gate is notified.
#[derive(Default)]
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<PipelineResult<PositionsResponse>>>,
    gate: Option<Arc<Notify>>,
    pub fetch_calls: AtomicU32,
    pub last_since: Mutex<Option<String>>,
}

impl ScriptedProvider {
    pub fn with(responses: Vec<PipelineResult<PositionsResponse>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            ..Default::default()
        }
    }

    pub fn held(gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> u32 {
        self.fetch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderApi for ScriptedProvider {
    async fn authenticate(&self, _: &str, _: &str) -> PipelineResult<ProviderSession> {
        Ok(ProviderSession {
            token: "upstream-token".into(),
            expires_at: Utc::now() + ChronoDuration::hours(1),
        })
    }

    async fn fetch_positions(
        &self,
        _token: &str,
        _device_ids: &[String],
        since: Option<&str>,
    ) -> PipelineResult<PositionsResponse> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_since.lock().unwrap() = since.map(str::to_string);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(PositionsResponse::default()))
    }
}
