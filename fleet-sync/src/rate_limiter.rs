//! Upstream rate limiter and circuit breaker
//!
//! Every call to the telemetry provider goes through [`RateLimiter::execute`]:
//! - calls are spaced at least `base_delay_ms` apart
//! - retryable failures (transport, provider status) are retried up to
//!   `max_retries` times with a doubling backoff capped at `base_delay_ms`
//! - after `circuit_breaker_threshold` consecutive failed calls the circuit
//!   opens and calls fail fast for [`CIRCUIT_COOLDOWN`]
//! - the first successful call after the cool-down closes the circuit
//!
//! Each `execute` counts once in `total_requests` and once in exactly one of
//! `successful_requests`, `rate_limited_requests` (rejected by an open
//! circuit) or `failed_requests`.

use chrono::{DateTime, Utc};
use fleet_common::events::{EventBus, FleetEvent};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, PipelineResult};

/// Fixed fail-fast period once the circuit opens
pub const CIRCUIT_COOLDOWN: Duration = Duration::from_secs(60);

/// First retry waits this long, doubling per attempt up to `base_delay_ms`
const BACKOFF_FLOOR_MS: u64 = 100;

pub const BASE_DELAY_RANGE_MS: (u64, u64) = (1000, 10_000);
pub const MAX_RETRIES_RANGE: (u32, u32) = (1, 10);
pub const CIRCUIT_THRESHOLD_RANGE: (u32, u32) = (1, 20);

/// Tunable limiter configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimiterConfig {
    pub base_delay_ms: u64,
    pub max_retries: u32,
    pub circuit_breaker_threshold: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_retries: 3,
            circuit_breaker_threshold: 5,
        }
    }
}

impl RateLimiterConfig {
    /// Check every field against its documented range
    pub fn validate(&self) -> PipelineResult<()> {
        check_range("baseDelayMs", self.base_delay_ms, BASE_DELAY_RANGE_MS)?;
        check_range("maxRetries", self.max_retries, MAX_RETRIES_RANGE)?;
        check_range(
            "circuitBreakerThreshold",
            self.circuit_breaker_threshold,
            CIRCUIT_THRESHOLD_RANGE,
        )?;
        Ok(())
    }

    /// This configuration with `update` applied, validated
    pub fn merge(&self, update: RateLimiterConfigUpdate) -> PipelineResult<Self> {
        let merged = Self {
            base_delay_ms: update.base_delay_ms.unwrap_or(self.base_delay_ms),
            max_retries: update.max_retries.unwrap_or(self.max_retries),
            circuit_breaker_threshold: update
                .circuit_breaker_threshold
                .unwrap_or(self.circuit_breaker_threshold),
        };
        merged.validate()?;
        Ok(merged)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Backoff before retry number `attempt` (1-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let millis = BACKOFF_FLOOR_MS.saturating_mul(1u64 << shift);
        Duration::from_millis(millis.min(self.base_delay_ms))
    }
}

fn check_range<T>(field: &str, value: T, (min, max): (T, T)) -> PipelineResult<()>
where
    T: PartialOrd + std::fmt::Display,
{
    if value < min || value > max {
        return Err(PipelineError::Validation(format!(
            "{} must be between {} and {} (got {})",
            field, min, max, value
        )));
    }
    Ok(())
}

/// Partial configuration update; absent fields keep their current value
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimiterConfigUpdate {
    pub base_delay_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub circuit_breaker_threshold: Option<u32>,
}

/// Live limiter counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RateLimiterStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub rate_limited_requests: u64,
    pub failed_requests: u64,
    pub consecutive_failures: u32,
    pub circuit_open: bool,
    pub circuit_opened_at: Option<DateTime<Utc>>,
    pub last_request_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct LimiterState {
    stats: RateLimiterStats,
    circuit_opened: Option<Instant>,
    next_slot: Option<Instant>,
}

impl LimiterState {
    /// Time left on an open circuit; `None` once the cool-down has elapsed
    fn circuit_remaining(&self, now: Instant) -> Option<Duration> {
        if !self.stats.circuit_open {
            return None;
        }
        let opened = self.circuit_opened?;
        let elapsed = now.saturating_duration_since(opened);
        (elapsed < CIRCUIT_COOLDOWN).then(|| CIRCUIT_COOLDOWN - elapsed)
    }
}

/// Gate for all upstream provider calls
pub struct RateLimiter {
    config: RwLock<RateLimiterConfig>,
    state: Mutex<LimiterState>,
    request_timeout: Duration,
    event_bus: EventBus,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig, request_timeout: Duration, event_bus: EventBus) -> Self {
        info!(
            base_delay_ms = config.base_delay_ms,
            max_retries = config.max_retries,
            circuit_breaker_threshold = config.circuit_breaker_threshold,
            "Rate limiter initialized"
        );
        Self {
            config: RwLock::new(config),
            state: Mutex::new(LimiterState::default()),
            request_timeout,
            event_bus,
        }
    }

    /// Run one upstream operation through the gate
    ///
    /// `operation` is invoked once per attempt. A call rejected by an open
    /// circuit returns [`PipelineError::CircuitOpen`] without invoking it.
    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> PipelineResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = PipelineResult<T>>,
    {
        let config = self.get_config();

        {
            let mut state = self.lock_state();
            state.stats.total_requests += 1;
            if let Some(remaining) = state.circuit_remaining(Instant::now()) {
                state.stats.rate_limited_requests += 1;
                debug!("Circuit open, rejecting upstream call ({:?} left)", remaining);
                return Err(PipelineError::CircuitOpen {
                    remaining_secs: remaining.as_secs().max(1),
                });
            }
        }

        let mut attempt: u32 = 0;
        loop {
            self.wait_for_slot(config.base_delay()).await;

            let outcome = match tokio::time::timeout(self.request_timeout, operation()).await {
                Ok(result) => result,
                Err(_) => Err(PipelineError::Transport(format!(
                    "upstream call timed out after {:?}",
                    self.request_timeout
                ))),
            };

            match outcome {
                Ok(value) => {
                    self.record_success();
                    return Ok(value);
                }
                Err(err) if err.is_retryable() && attempt < config.max_retries => {
                    attempt += 1;
                    let backoff = config.backoff_for(attempt);
                    warn!(
                        attempt,
                        max_retries = config.max_retries,
                        "Upstream call failed ({}), retrying in {:?}",
                        err,
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => {
                    self.record_failure(&config, &err);
                    return Err(err);
                }
            }
        }
    }

    /// Reserve the next request slot and sleep until it arrives
    ///
    /// The slot is reserved under the lock and the sleep happens after the
    /// lock is released, so concurrent callers queue up without blocking
    /// each other.
    async fn wait_for_slot(&self, spacing: Duration) {
        let slot = {
            let mut state = self.lock_state();
            let now = Instant::now();
            let slot = match state.next_slot {
                Some(next) if next > now => next,
                _ => now,
            };
            state.next_slot = Some(slot + spacing);
            state.stats.last_request_at = Some(Utc::now());
            slot
        };

        if slot > Instant::now() {
            debug!("Rate limiting: waiting {:?}", slot - Instant::now());
            tokio::time::sleep_until(slot).await;
        }
    }

    fn record_success(&self) {
        let was_open = {
            let mut state = self.lock_state();
            state.stats.successful_requests += 1;
            state.stats.consecutive_failures = 0;
            let was_open = state.stats.circuit_open;
            state.stats.circuit_open = false;
            state.stats.circuit_opened_at = None;
            state.circuit_opened = None;
            was_open
        };

        if was_open {
            info!("Upstream call succeeded after cool-down, circuit closed");
            self.event_bus.emit_lossy(FleetEvent::CircuitStateChanged {
                open: false,
                consecutive_failures: 0,
                timestamp: Utc::now(),
            });
        }
    }

    fn record_failure(&self, config: &RateLimiterConfig, err: &PipelineError) {
        let opened = {
            let mut state = self.lock_state();
            state.stats.failed_requests += 1;
            state.stats.consecutive_failures += 1;

            if state.stats.consecutive_failures >= config.circuit_breaker_threshold {
                let newly_opened = !state.stats.circuit_open;
                // A failed trial call after the cool-down restarts the cool-down
                state.stats.circuit_open = true;
                state.stats.circuit_opened_at = Some(Utc::now());
                state.circuit_opened = Some(Instant::now());
                newly_opened.then_some(state.stats.consecutive_failures)
            } else {
                None
            }
        };

        warn!("Upstream call failed: {}", err);

        if let Some(consecutive_failures) = opened {
            warn!(
                consecutive_failures,
                "Circuit breaker opened, suspending upstream calls for {:?}", CIRCUIT_COOLDOWN
            );
            self.event_bus.emit_lossy(FleetEvent::CircuitStateChanged {
                open: true,
                consecutive_failures,
                timestamp: Utc::now(),
            });
        }
    }

    pub fn get_config(&self) -> RateLimiterConfig {
        *self.config.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the running configuration
    ///
    /// Callers merge and persist first; an out-of-range config is refused
    /// and the running one kept.
    pub fn set_config(&self, config: RateLimiterConfig) -> PipelineResult<()> {
        config.validate()?;
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = config;
        info!(?config, "Rate limiter configuration updated");
        Ok(())
    }

    pub fn get_stats(&self) -> RateLimiterStats {
        self.lock_state().stats.clone()
    }

    /// Zero all counters and close the circuit
    pub fn reset_stats(&self) {
        let mut state = self.lock_state();
        let next_slot = state.next_slot;
        *state = LimiterState {
            next_slot,
            ..LimiterState::default()
        };
        info!("Rate limiter statistics reset");
    }

    pub fn is_circuit_open(&self) -> bool {
        self.lock_state().stats.circuit_open
    }

    fn lock_state(&self) -> MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
