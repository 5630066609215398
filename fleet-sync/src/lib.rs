//! fleet-sync library interface
//!
//! Telemetry pipeline for the fleet console: rate-limited provider polling,
//! write-back batching, real-time fan-out to socket clients and periodic
//! consistency verification. Exposed as a library for integration testing.

pub mod api;
pub mod batch;
pub mod db;
pub mod error;
pub mod hub;
pub mod poller;
pub mod provider;
pub mod rate_limiter;
pub mod session;
pub mod settings;
pub mod verifier;

#[cfg(test)]
pub(crate) mod test_support;

pub use crate::error::{ApiError, ApiResult, PipelineError, PipelineResult};

use axum::Router;
use chrono::{DateTime, Utc};
use fleet_common::events::EventBus;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::batch::BatchProcessor;
use crate::db::positions::SqlitePositionSink;
use crate::hub::FanOutHub;
use crate::poller::{PollerDeps, PositionPoller};
use crate::provider::ProviderApi;
use crate::rate_limiter::RateLimiter;
use crate::session::SessionGateway;
use crate::settings::RuntimeSettings;
use crate::verifier::{ConsistencyVerifier, StalenessLimits};

/// Application state shared across handlers and background loops
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub event_bus: EventBus,
    pub limiter: Arc<RateLimiter>,
    pub batch: Arc<BatchProcessor>,
    pub poller: Arc<PositionPoller>,
    pub hub: Arc<FanOutHub>,
    pub verifier: Arc<ConsistencyVerifier>,
    pub settings: RuntimeSettings,
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    /// Wire the pipeline components around an existing limiter
    ///
    /// The limiter is passed in because the session gateway shares it.
    pub fn new(
        db: SqlitePool,
        event_bus: EventBus,
        settings: RuntimeSettings,
        provider: Arc<dyn ProviderApi>,
        sessions: Arc<dyn SessionGateway>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        let sink = Arc::new(SqlitePositionSink::new(db.clone()));
        let batch = Arc::new(BatchProcessor::new(sink, settings.batch_size, event_bus.clone()));

        let poller = Arc::new(PositionPoller::new(
            PollerDeps {
                pool: db.clone(),
                provider,
                sessions: sessions.clone(),
                limiter: limiter.clone(),
                batch: batch.clone(),
                event_bus: event_bus.clone(),
            },
            settings.tracked_device_ids.clone(),
        ));

        let hub = Arc::new(FanOutHub::new(
            sessions,
            db.clone(),
            settings.client_ping_timeout(),
        ));

        let verifier = Arc::new(ConsistencyVerifier::new(
            db.clone(),
            event_bus.clone(),
            StalenessLimits {
                position_max_age: std::time::Duration::from_secs(settings.stale_position_secs),
                sync_max_age: std::time::Duration::from_secs(settings.sync_stale_secs),
            },
        ));

        Self {
            db,
            event_bus,
            limiter,
            batch,
            poller,
            hub,
            verifier,
            settings,
            startup_time: Utc::now(),
        }
    }

    /// Spawn every background loop; all stop when `cancel` fires
    pub fn spawn_background_tasks(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(
                self.poller
                    .clone()
                    .run(self.settings.poll_interval(), cancel.clone()),
            ),
            tokio::spawn(self.batch.clone().run(cancel.clone())),
            tokio::spawn(self.batch.clone().run_metrics_broadcast(cancel.clone())),
            tokio::spawn(
                self.verifier
                    .clone()
                    .run(self.settings.verifier_interval(), cancel.clone()),
            ),
            tokio::spawn(
                self.hub
                    .clone()
                    .run_event_listener(self.event_bus.clone(), cancel.clone()),
            ),
            tokio::spawn(self.hub.clone().run_sweep(cancel.clone())),
        ]
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::get;

    Router::new()
        .merge(api::health_routes())
        .merge(api::rate_limiter_routes())
        .merge(api::queue_routes())
        .merge(api::sync_routes())
        .merge(api::consistency_routes())
        .route("/events", get(api::event_stream))
        .route("/ws", get(api::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
