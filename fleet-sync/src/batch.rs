//! Write-back queue and batch processor
//!
//! Decoded positions are queued here and drained in batches into a
//! [`PositionSink`]. Only one batch is in flight at a time; producers can
//! keep enqueuing while it is.
//!
//! Ordering is FIFO within a priority band. `High` items go to the front,
//! everything else to the back.

use async_trait::async_trait;
use chrono::Utc;
use fleet_common::events::{EventBus, FleetEvent};
use fleet_common::models::{DevicePosition, Priority, QueueMetrics, QueuedPosition};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{PipelineError, PipelineResult};

/// Failed persists an item survives before it is dropped
pub const MAX_ITEM_RETRIES: u32 = 3;

/// Batches included in the rolling latency average
pub const LATENCY_WINDOW: usize = 100;

pub const DRAIN_INTERVAL: Duration = Duration::from_secs(1);
pub const METRICS_INTERVAL: Duration = Duration::from_secs(5);

/// Destination of persisted position batches
#[async_trait]
pub trait PositionSink: Send + Sync {
    /// Persist the whole batch or nothing
    async fn persist_batch(&self, positions: &[DevicePosition]) -> PipelineResult<()>;
}

/// Result of a `batch_add_to_queue` call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueReport {
    pub accepted: usize,
    pub rejected: usize,
    pub queue_size: usize,
}

/// What one `process_batch` call did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchOutcome {
    pub persisted: usize,
    pub requeued: usize,
    pub dropped: usize,
}

#[derive(Default)]
struct ProcessingStats {
    total_processed: u64,
    successful_inserts: u64,
    failed_inserts: u64,
    dropped_items: u64,
    latencies_ms: VecDeque<f64>,
    last_processed_at: Option<chrono::DateTime<Utc>>,
}

impl ProcessingStats {
    fn record_latency(&mut self, latency: Duration) {
        if self.latencies_ms.len() == LATENCY_WINDOW {
            self.latencies_ms.pop_front();
        }
        self.latencies_ms.push_back(latency.as_secs_f64() * 1000.0);
    }

    fn average_latency_ms(&self) -> f64 {
        if self.latencies_ms.is_empty() {
            0.0
        } else {
            self.latencies_ms.iter().sum::<f64>() / self.latencies_ms.len() as f64
        }
    }
}

/// Clears the in-flight flag even if the batch future is dropped
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Write-back queue owner
pub struct BatchProcessor {
    queue: Mutex<VecDeque<QueuedPosition>>,
    stats: Mutex<ProcessingStats>,
    sink: Arc<dyn PositionSink>,
    batch_size: usize,
    processing: AtomicBool,
    paused: AtomicBool,
    event_bus: EventBus,
}

impl BatchProcessor {
    pub fn new(sink: Arc<dyn PositionSink>, batch_size: usize, event_bus: EventBus) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            stats: Mutex::new(ProcessingStats::default()),
            sink,
            batch_size: batch_size.max(1),
            processing: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            event_bus,
        }
    }

    /// Validate and enqueue one record; returns the new queue size
    pub fn add_to_queue(&self, position: DevicePosition, priority: Priority) -> PipelineResult<usize> {
        position.validate()?;

        let mut queue = self.lock_queue();
        let item = QueuedPosition::new(position, priority);
        match priority {
            Priority::High => queue.push_front(item),
            Priority::Medium | Priority::Low => queue.push_back(item),
        }
        Ok(queue.len())
    }

    /// Enqueue many records, skipping the ones that fail validation
    ///
    /// High-priority records keep their relative order at the front.
    pub fn batch_add_to_queue(&self, positions: Vec<DevicePosition>, priority: Priority) -> EnqueueReport {
        let mut accepted = Vec::with_capacity(positions.len());
        let mut rejected = 0;
        for position in positions {
            match position.validate() {
                Ok(()) => accepted.push(QueuedPosition::new(position, priority)),
                Err(e) => {
                    rejected += 1;
                    debug!("Rejected position before enqueue: {}", e);
                }
            }
        }

        let accepted_count = accepted.len();
        let mut queue = self.lock_queue();
        match priority {
            Priority::High => {
                for item in accepted.into_iter().rev() {
                    queue.push_front(item);
                }
            }
            Priority::Medium | Priority::Low => queue.extend(accepted),
        }

        EnqueueReport {
            accepted: accepted_count,
            rejected,
            queue_size: queue.len(),
        }
    }

    /// Drain and persist one batch
    ///
    /// Returns `None` when paused, already processing, or the queue is empty.
    pub async fn process_batch(&self) -> Option<BatchOutcome> {
        if self.paused.load(Ordering::Acquire) {
            return None;
        }
        if self
            .processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        let _in_flight = InFlight(&self.processing);

        let batch: Vec<QueuedPosition> = {
            let mut queue = self.lock_queue();
            let take = self.batch_size.min(queue.len());
            queue.drain(..take).collect()
        };
        if batch.is_empty() {
            return None;
        }

        let positions: Vec<DevicePosition> = batch.iter().map(|item| item.position.clone()).collect();
        let started = Instant::now();
        let result = self.sink.persist_batch(&positions).await;
        let latency = started.elapsed();

        let count = batch.len() as u64;
        let outcome = match result {
            Ok(()) => {
                {
                    let mut stats = self.lock_stats();
                    stats.total_processed += count;
                    stats.successful_inserts += count;
                    stats.record_latency(latency);
                    stats.last_processed_at = Some(Utc::now());
                }
                debug!(count, latency_ms = latency.as_millis() as u64, "Batch persisted");
                self.event_bus.emit_lossy(FleetEvent::PositionsPersisted {
                    positions,
                    timestamp: Utc::now(),
                });
                BatchOutcome {
                    persisted: batch.len(),
                    ..Default::default()
                }
            }
            Err(err) => self.handle_failed_batch(batch, &err, latency),
        };

        Some(outcome)
    }

    fn handle_failed_batch(
        &self,
        batch: Vec<QueuedPosition>,
        err: &PipelineError,
        latency: Duration,
    ) -> BatchOutcome {
        let count = batch.len() as u64;
        let mut retry = Vec::with_capacity(batch.len());
        let mut dropped = 0;

        for mut item in batch {
            item.retry_count += 1;
            if item.retry_count > MAX_ITEM_RETRIES {
                dropped += 1;
                error!(
                    device_id = %item.position.device_id,
                    retries = MAX_ITEM_RETRIES,
                    "Dropping position after exhausting retry budget: {}",
                    err
                );
            } else {
                retry.push(item);
            }
        }

        let requeued = retry.len();
        {
            // Retries go back to the front in their original order
            let mut queue = self.lock_queue();
            for item in retry.into_iter().rev() {
                queue.push_front(item);
            }
        }
        {
            let mut stats = self.lock_stats();
            stats.total_processed += count;
            stats.failed_inserts += count;
            stats.dropped_items += dropped as u64;
            stats.record_latency(latency);
            stats.last_processed_at = Some(Utc::now());
        }

        warn!(count, requeued, dropped, "Batch persist failed: {}", err);
        BatchOutcome {
            persisted: 0,
            requeued,
            dropped,
        }
    }

    pub fn get_metrics(&self) -> QueueMetrics {
        let queue_size = self.get_queue_size();
        let stats = self.lock_stats();
        QueueMetrics {
            total_processed: stats.total_processed,
            successful_inserts: stats.successful_inserts,
            failed_inserts: stats.failed_inserts,
            dropped_items: stats.dropped_items,
            average_latency_ms: stats.average_latency_ms(),
            queue_size,
            is_processing: self.processing.load(Ordering::Acquire),
            is_paused: self.paused.load(Ordering::Acquire),
            last_processed_at: stats.last_processed_at,
        }
    }

    pub fn get_queue_size(&self) -> usize {
        self.lock_queue().len()
    }

    /// Discard everything queued; returns how many items were removed
    pub fn clear_queue(&self) -> usize {
        let mut queue = self.lock_queue();
        let cleared = queue.len();
        queue.clear();
        info!(cleared, "Write-back queue cleared");
        cleared
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
        info!("Write-back processing paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        info!("Write-back processing resumed");
    }

    /// Drain loop, one batch per tick
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(DRAIN_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Write-back drain loop started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.process_batch().await;
                }
            }
        }

        info!("Write-back drain loop stopped");
    }

    /// Publish queue metrics on the event bus at a fixed cadence
    pub async fn run_metrics_broadcast(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(METRICS_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.event_bus.emit_lossy(FleetEvent::QueueMetricsUpdated {
                        metrics: self.get_metrics(),
                        timestamp: Utc::now(),
                    });
                }
            }
        }
    }

    fn lock_queue(&self) -> MutexGuard<'_, VecDeque<QueuedPosition>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_stats(&self) -> MutexGuard<'_, ProcessingStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }
}
