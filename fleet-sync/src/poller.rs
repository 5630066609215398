//! Position ingestion poller
//!
//! One cycle: check the upstream session, fetch everything since the
//! watermark through the rate limiter, decode and enqueue, then advance the
//! watermark. A failed cycle leaves the watermark where it was so the next
//! cycle asks for the same window again.

use chrono::Utc;
use fleet_common::events::{EventBus, FleetEvent};
use fleet_common::models::{Priority, SyncMetrics, SyncWatermark};
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batch::BatchProcessor;
use crate::db::watermark::{load_watermark, save_watermark, POSITIONS_SCOPE};
use crate::error::{PipelineError, PipelineResult};
use crate::provider::{decode_position, ProviderApi};
use crate::rate_limiter::RateLimiter;
use crate::session::SessionGateway;

/// Components a poller drives
pub struct PollerDeps {
    pub pool: SqlitePool,
    pub provider: Arc<dyn ProviderApi>,
    pub sessions: Arc<dyn SessionGateway>,
    pub limiter: Arc<RateLimiter>,
    pub batch: Arc<BatchProcessor>,
    pub event_bus: EventBus,
}

pub struct PositionPoller {
    deps: PollerDeps,
    tracked_device_ids: Vec<String>,
    in_flight: AtomicBool,
    metrics: Mutex<SyncMetrics>,
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl PositionPoller {
    pub fn new(deps: PollerDeps, tracked_device_ids: Vec<String>) -> Self {
        Self {
            deps,
            tracked_device_ids,
            in_flight: AtomicBool::new(false),
            metrics: Mutex::new(SyncMetrics::default()),
        }
    }

    /// Metrics of the most recent cycle
    pub fn get_metrics(&self) -> SyncMetrics {
        let mut metrics = self.metrics.lock().unwrap_or_else(|e| e.into_inner()).clone();
        metrics.in_progress = self.in_flight.load(Ordering::Acquire);
        metrics
    }

    pub async fn get_watermark(&self) -> PipelineResult<SyncWatermark> {
        Ok(load_watermark(&self.deps.pool, POSITIONS_SCOPE).await?)
    }

    /// Run a cycle now unless one is already running
    ///
    /// A call that overlaps a running cycle does nothing and returns the
    /// current metrics with `in_progress` set. The flag also keeps the
    /// interval loop from starting a cycle before the previous watermark
    /// write has finished.
    pub async fn force_sync(&self) -> SyncMetrics {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Sync already in progress, ignoring forced sync");
            return self.get_metrics();
        }
        let _guard = InFlight(&self.in_flight);

        self.run_cycle().await;

        let mut metrics = self.get_metrics();
        metrics.in_progress = false;
        metrics
    }

    /// Fixed-interval poll loop
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_secs = interval.as_secs(), "Position poller started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.force_sync().await;
                }
            }
        }

        info!("Position poller stopped");
    }

    async fn run_cycle(&self) {
        let started = Utc::now();
        let mut watermark = match load_watermark(&self.deps.pool, POSITIONS_SCOPE).await {
            Ok(watermark) => watermark,
            Err(e) => {
                error!("Failed to load sync watermark: {}", e);
                self.record_failure(PipelineError::from(e));
                return;
            }
        };

        match self.poll_once(&watermark).await {
            Ok(cycle) => {
                watermark.last_query_time = Some(
                    cycle
                        .next_watermark
                        .unwrap_or_else(|| fleet_common::time::to_db_timestamp(&started)),
                );
                watermark.last_success_at = Some(Utc::now());
                watermark.error_count = 0;
                watermark.last_error = None;

                if let Err(e) = save_watermark(&self.deps.pool, POSITIONS_SCOPE, &watermark).await {
                    error!("Failed to store sync watermark: {}", e);
                    self.record_failure(PipelineError::from(e));
                    return;
                }

                let metrics = {
                    let mut metrics = self.metrics.lock().unwrap_or_else(|e| e.into_inner());
                    metrics.total_vehicles = cycle.total_vehicles;
                    metrics.positions_updated = cycle.positions_updated;
                    metrics.invalid_records = cycle.invalid_records;
                    metrics.last_sync_time = Some(Utc::now());
                    metrics.last_error = None;
                    metrics.clone()
                };

                info!(
                    positions = cycle.positions_updated,
                    invalid = cycle.invalid_records,
                    vehicles = cycle.total_vehicles,
                    "Sync cycle completed"
                );
                self.deps.event_bus.emit_lossy(FleetEvent::SyncCompleted {
                    metrics,
                    timestamp: Utc::now(),
                });
            }
            Err(err) => {
                warn!(code = err.code(), "Sync cycle failed: {}", err);
                watermark.error_count = watermark.error_count.saturating_add(1);
                watermark.last_error = Some(err.to_string());
                if let Err(e) = save_watermark(&self.deps.pool, POSITIONS_SCOPE, &watermark).await {
                    error!("Failed to record sync error on watermark: {}", e);
                }
                self.record_failure(err);
            }
        }
    }

    async fn poll_once(&self, watermark: &SyncWatermark) -> PipelineResult<CycleOutcome> {
        let token = self.valid_token().await?;
        let device_ids = self.tracked_device_ids.clone();
        let since = watermark.last_query_time.clone();

        let provider = self.deps.provider.clone();
        let response = self
            .deps
            .limiter
            .execute(|| {
                let provider = provider.clone();
                let token = token.clone();
                let device_ids = device_ids.clone();
                let since = since.clone();
                async move {
                    provider
                        .fetch_positions(&token, &device_ids, since.as_deref())
                        .await?
                        .check_status()
                }
            })
            .await?;

        let server_timestamp = Utc::now();
        let mut positions = Vec::with_capacity(response.records.len());
        let mut invalid_records = 0u64;
        for raw in &response.records {
            match decode_position(raw, server_timestamp) {
                Ok(position) => positions.push(position),
                Err(e) => {
                    invalid_records += 1;
                    debug!("Dropping undecodable position record: {}", e);
                }
            }
        }

        let mut devices: Vec<&str> = positions.iter().map(|p| p.device_id.as_str()).collect();
        devices.sort_unstable();
        devices.dedup();
        let total_vehicles = devices.len() as u64;

        let report = self.deps.batch.batch_add_to_queue(positions, Priority::Medium);
        invalid_records += report.rejected as u64;

        Ok(CycleOutcome {
            next_watermark: response.next_watermark,
            total_vehicles,
            positions_updated: report.accepted as u64,
            invalid_records,
        })
    }

    async fn valid_token(&self) -> PipelineResult<String> {
        let token = self
            .deps
            .sessions
            .get_valid_token()
            .await?
            .ok_or_else(|| PipelineError::Auth("no upstream session available".to_string()))?;

        if let Some(expires_at) = self.deps.sessions.token_expires_at().await? {
            if expires_at <= Utc::now() {
                return Err(PipelineError::Auth(format!(
                    "upstream session expired at {}",
                    expires_at
                )));
            }
        }
        Ok(token)
    }

    fn record_failure(&self, err: PipelineError) {
        let message = err.to_string();
        {
            let mut metrics = self.metrics.lock().unwrap_or_else(|e| e.into_inner());
            metrics.errors += 1;
            metrics.last_error = Some(message.clone());
        }
        self.deps.event_bus.emit_lossy(FleetEvent::SyncFailed {
            error: message,
            timestamp: Utc::now(),
        });
    }
}

struct CycleOutcome {
    next_watermark: Option<String>,
    total_vehicles: u64,
    positions_updated: u64,
    invalid_records: u64,
}
