//! Shared fixtures for fleet-sync integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use fleet_common::events::EventBus;
use fleet_sync::error::PipelineResult;
use fleet_sync::provider::{PositionsResponse, ProviderApi, ProviderSession};
use fleet_sync::rate_limiter::{RateLimiter, RateLimiterConfig};
use fleet_sync::session::SessionGateway;
use fleet_sync::settings::RuntimeSettings;
use fleet_sync::AppState;
use sqlx::SqlitePool;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub async fn test_db() -> (TempDir, SqlitePool) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let pool = fleet_common::db::init_database(&dir.path().join("fleet.db"))
        .await
        .expect("Failed to initialize database");
    (dir, pool)
}

/// Provider replaying scripted `fetch_positions` answers
#[derive(Default)]
pub struct FakeProvider {
    responses: Mutex<VecDeque<PipelineResult<PositionsResponse>>>,
    calls: AtomicU32,
}

impl FakeProvider {
    pub fn with(responses: Vec<PipelineResult<PositionsResponse>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderApi for FakeProvider {
    async fn authenticate(&self, _: &str, _: &str) -> PipelineResult<ProviderSession> {
        Ok(ProviderSession {
            token: "upstream".into(),
            expires_at: Utc::now() + ChronoDuration::hours(1),
        })
    }

    async fn fetch_positions(
        &self,
        _: &str,
        _: &[String],
        _: Option<&str>,
    ) -> PipelineResult<PositionsResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(PositionsResponse::default()))
    }
}

/// Gateway with a valid upstream token and a fixed client token table
pub struct FakeSessions {
    pub expires_at: DateTime<Utc>,
    pub clients: Vec<(String, String)>,
}

impl Default for FakeSessions {
    fn default() -> Self {
        Self {
            expires_at: Utc::now() + ChronoDuration::hours(1),
            clients: vec![("client-token".into(), "u1".into())],
        }
    }
}

#[async_trait]
impl SessionGateway for FakeSessions {
    async fn get_valid_token(&self) -> PipelineResult<Option<String>> {
        Ok(Some("upstream".into()))
    }

    async fn token_expires_at(&self) -> PipelineResult<Option<DateTime<Utc>>> {
        Ok(Some(self.expires_at))
    }

    async fn resolve_client_token(&self, token: &str) -> PipelineResult<Option<String>> {
        Ok(self
            .clients
            .iter()
            .find(|(t, _)| t == token)
            .map(|(_, u)| u.clone()))
    }
}

/// Fully wired state over a temp database and a scripted provider
pub fn build_state(pool: SqlitePool, provider: Arc<FakeProvider>) -> AppState {
    let event_bus = EventBus::new(256);
    // Short spacing keeps the tests fast; production config is validated
    let config = RateLimiterConfig {
        base_delay_ms: 10,
        max_retries: 1,
        circuit_breaker_threshold: 5,
    };
    let limiter = Arc::new(RateLimiter::new(config, Duration::from_secs(5), event_bus.clone()));
    AppState::new(
        pool,
        event_bus,
        RuntimeSettings::default(),
        provider,
        Arc::new(FakeSessions::default()),
        limiter,
    )
}
