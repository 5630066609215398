//! Event system for the fleet pipeline
//!
//! Components never call each other across ownership boundaries; they emit
//! `FleetEvent`s on the `EventBus` and interested parties subscribe. The
//! write-back queue emits `PositionsPersisted` after each successful batch,
//! which the fan-out hub turns into client frames.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::models::{
    ConsistencyAlert, ConsistencyCheckResult, DevicePosition, QueueMetrics, SyncMetrics,
};

/// Fleet pipeline event types
///
/// Events are broadcast via `EventBus` and serialized with a `type` tag for
/// SSE transmission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FleetEvent {
    /// A batch of positions was written to the store
    ///
    /// Triggers:
    /// - Fan-out hub: push `live_position_update` frames to subscribers
    PositionsPersisted {
        positions: Vec<DevicePosition>,
        timestamp: DateTime<Utc>,
    },

    /// Periodic write-back queue metrics (every 5 s)
    QueueMetricsUpdated {
        metrics: QueueMetrics,
        timestamp: DateTime<Utc>,
    },

    /// A poll cycle finished and the watermark advanced
    SyncCompleted {
        metrics: SyncMetrics,
        timestamp: DateTime<Utc>,
    },

    /// A poll cycle failed; the watermark was left in place
    SyncFailed {
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// Upstream circuit breaker opened or closed
    CircuitStateChanged {
        open: bool,
        consecutive_failures: u32,
        timestamp: DateTime<Utc>,
    },

    /// A consistency run finished
    ConsistencyCheckCompleted {
        result: ConsistencyCheckResult,
        timestamp: DateTime<Utc>,
    },

    /// A consistency run scored below the alert threshold
    ConsistencyAlertRaised {
        alert: ConsistencyAlert,
        timestamp: DateTime<Utc>,
    },
}

impl FleetEvent {
    /// Event name used as the SSE event field
    pub fn event_type(&self) -> &str {
        match self {
            FleetEvent::PositionsPersisted { .. } => "PositionsPersisted",
            FleetEvent::QueueMetricsUpdated { .. } => "QueueMetricsUpdated",
            FleetEvent::SyncCompleted { .. } => "SyncCompleted",
            FleetEvent::SyncFailed { .. } => "SyncFailed",
            FleetEvent::CircuitStateChanged { .. } => "CircuitStateChanged",
            FleetEvent::ConsistencyCheckCompleted { .. } => "ConsistencyCheckCompleted",
            FleetEvent::ConsistencyAlertRaised { .. } => "ConsistencyAlertRaised",
        }
    }
}

/// Central event distribution bus
///
/// Uses `tokio::sync::broadcast` internally:
/// - Non-blocking publish (slow subscribers don't block producers)
/// - Multiple concurrent subscribers
/// - Lagged message detection for slow subscribers
///
/// # Examples
///
/// ```
/// use fleet_common::events::{EventBus, FleetEvent};
///
/// let bus = EventBus::new(100);
/// let mut rx = bus.subscribe();
///
/// bus.emit(FleetEvent::SyncFailed {
///     error: "upstream timeout".to_string(),
///     timestamp: chrono::Utc::now(),
/// }).ok();
///
/// assert!(rx.try_recv().is_ok());
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<FleetEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with the given channel capacity
    ///
    /// Events beyond `capacity` that a subscriber has not yet received are
    /// dropped for that subscriber (it observes `RecvError::Lagged`).
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: FleetEvent,
    ) -> Result<usize, broadcast::error::SendError<FleetEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: FleetEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
