//! Consistency verifier
//!
//! A read-mostly batch job over the local store. Each run reads the fleet
//! registry, session and position tables, records what it found, and raises
//! an alert when the score drops below [`ALERT_THRESHOLD`]. Position data is
//! never modified.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use fleet_common::events::{EventBus, FleetEvent};
use fleet_common::models::{
    AlertLevel, ConsistencyAlert, ConsistencyCheckResult, Discrepancy, DiscrepancyType, Severity,
    SyncWatermark,
};
use fleet_common::DevicePosition;
use serde_json::json;
use sqlx::SqlitePool;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::consistency::{latest_discrepancy_keys, record_check};
use crate::db::fleet::{list_provider_sessions, list_user_ids, list_vehicles, ProviderSessionRow, VehicleRow};
use crate::db::positions::all_latest_positions;
use crate::db::watermark::all_watermarks;
use crate::error::PipelineResult;

/// Scores below this raise an alert
pub const ALERT_THRESHOLD: u8 = 85;
/// Scores below this raise a critical alert
pub const CRITICAL_THRESHOLD: u8 = 70;

/// Percentage of checked entities without a finding
///
/// 100 when nothing was checked; never below 0.
pub fn consistency_score(checked: u64, discrepancies: u64) -> u8 {
    if checked == 0 {
        return 100;
    }
    let clean = checked.saturating_sub(discrepancies) as f64;
    (100.0 * clean / checked as f64).round().clamp(0.0, 100.0) as u8
}

pub fn alert_level(score: u8) -> Option<AlertLevel> {
    if score < CRITICAL_THRESHOLD {
        Some(AlertLevel::Critical)
    } else if score < ALERT_THRESHOLD {
        Some(AlertLevel::Warning)
    } else {
        None
    }
}

/// Staleness limits
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StalenessLimits {
    pub position_max_age: Duration,
    pub sync_max_age: Duration,
}

/// Everything one run looks at
#[derive(Debug, Default)]
pub struct StoreSnapshot {
    pub vehicles: Vec<VehicleRow>,
    pub provider_sessions: Vec<ProviderSessionRow>,
    pub user_ids: HashSet<String>,
    pub latest_positions: Vec<DevicePosition>,
    pub watermarks: Vec<(String, SyncWatermark)>,
}

impl StoreSnapshot {
    pub async fn load(pool: &SqlitePool) -> PipelineResult<Self> {
        Ok(Self {
            vehicles: list_vehicles(pool).await?,
            provider_sessions: list_provider_sessions(pool).await?,
            user_ids: list_user_ids(pool).await?.into_iter().collect(),
            latest_positions: all_latest_positions(pool).await?,
            watermarks: all_watermarks(pool).await?,
        })
    }

    pub fn entity_count(&self) -> u64 {
        (self.vehicles.len()
            + self.provider_sessions.len()
            + self.latest_positions.len()
            + self.watermarks.len()) as u64
    }
}

/// Finding before it is stamped with a run id
#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    pub discrepancy_type: DiscrepancyType,
    pub entity_type: &'static str,
    pub entity_id: String,
    pub severity: Severity,
    pub description: String,
    pub provider_data: Option<serde_json::Value>,
    pub local_data: Option<serde_json::Value>,
}

/// Run every check against `snapshot`
///
/// Output order is deterministic for a given snapshot.
pub fn detect(snapshot: &StoreSnapshot, limits: StalenessLimits, now: DateTime<Utc>) -> Vec<Finding> {
    let mut findings = Vec::new();
    findings.extend(duplicate_devices(&snapshot.vehicles));
    findings.extend(missing_fields(&snapshot.vehicles));
    findings.extend(orphaned_sessions(&snapshot.provider_sessions, &snapshot.user_ids));
    findings.extend(stale_positions(&snapshot.latest_positions, limits.position_max_age, now));
    findings.extend(stale_watermarks(&snapshot.watermarks, limits.sync_max_age, now));
    findings
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn duplicate_devices(vehicles: &[VehicleRow]) -> Vec<Finding> {
    let mut by_device: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for vehicle in vehicles {
        if let Some(device_id) = non_blank(&vehicle.device_id) {
            by_device.entry(device_id).or_default().push(&vehicle.id);
        }
    }

    by_device
        .into_iter()
        .filter(|(_, ids)| ids.len() > 1)
        .map(|(device_id, ids)| Finding {
            discrepancy_type: DiscrepancyType::DuplicateDevice,
            entity_type: "device",
            entity_id: device_id.to_string(),
            severity: Severity::High,
            description: format!("Device {} is assigned to {} vehicles", device_id, ids.len()),
            provider_data: None,
            local_data: Some(json!({ "vehicleIds": ids })),
        })
        .collect()
}

fn missing_fields(vehicles: &[VehicleRow]) -> Vec<Finding> {
    vehicles
        .iter()
        .filter_map(|vehicle| {
            let mut missing = Vec::new();
            if non_blank(&vehicle.device_id).is_none() {
                missing.push("device_id");
            }
            if non_blank(&vehicle.name).is_none() {
                missing.push("name");
            }
            if non_blank(&vehicle.user_id).is_none() {
                missing.push("user_id");
            }
            (!missing.is_empty()).then(|| Finding {
                discrepancy_type: DiscrepancyType::MissingField,
                entity_type: "vehicle",
                entity_id: vehicle.id.clone(),
                severity: Severity::Medium,
                description: format!("Vehicle {} is missing {}", vehicle.id, missing.join(", ")),
                provider_data: None,
                local_data: serde_json::to_value(vehicle).ok(),
            })
        })
        .collect()
}

fn orphaned_sessions(sessions: &[ProviderSessionRow], user_ids: &HashSet<String>) -> Vec<Finding> {
    sessions
        .iter()
        .filter_map(|session| {
            let user_id = non_blank(&session.user_id)?;
            (!user_ids.contains(user_id)).then(|| Finding {
                discrepancy_type: DiscrepancyType::OrphanedSession,
                entity_type: "provider_session",
                entity_id: session.id.clone(),
                severity: Severity::Medium,
                description: format!(
                    "Provider session {} belongs to unknown user {}",
                    session.id, user_id
                ),
                provider_data: Some(json!({ "expiresAt": session.expires_at })),
                local_data: Some(json!({ "userId": user_id })),
            })
        })
        .collect()
}

fn max_age(limit: Duration) -> ChronoDuration {
    ChronoDuration::from_std(limit).unwrap_or_else(|_| ChronoDuration::days(36_500))
}

fn stale_positions(positions: &[DevicePosition], limit: Duration, now: DateTime<Utc>) -> Vec<Finding> {
    let limit = max_age(limit);
    positions
        .iter()
        .filter(|position| now - position.device_timestamp > limit)
        .map(|position| Finding {
            discrepancy_type: DiscrepancyType::StaleData,
            entity_type: "device_position",
            entity_id: position.device_id.clone(),
            severity: Severity::Low,
            description: format!(
                "No position from device {} since {}",
                position.device_id, position.device_timestamp
            ),
            provider_data: None,
            local_data: Some(json!({ "deviceTimestamp": position.device_timestamp })),
        })
        .collect()
}

fn stale_watermarks(
    watermarks: &[(String, SyncWatermark)],
    limit: Duration,
    now: DateTime<Utc>,
) -> Vec<Finding> {
    let limit = max_age(limit);
    watermarks
        .iter()
        .filter(|(_, watermark)| match watermark.last_success_at {
            Some(at) => now - at > limit,
            None => true,
        })
        .map(|(scope, watermark)| Finding {
            discrepancy_type: DiscrepancyType::StaleData,
            entity_type: "sync_state",
            entity_id: scope.clone(),
            severity: Severity::Medium,
            description: match watermark.last_success_at {
                Some(at) => format!("Sync scope {} last succeeded at {}", scope, at),
                None => format!("Sync scope {} has never succeeded", scope),
            },
            provider_data: None,
            local_data: serde_json::to_value(watermark).ok(),
        })
        .collect()
}

pub struct ConsistencyVerifier {
    pool: SqlitePool,
    event_bus: EventBus,
    limits: StalenessLimits,
    // One run at a time so auto-resolution compares against a finished run
    run_lock: tokio::sync::Mutex<()>,
}

impl ConsistencyVerifier {
    pub fn new(pool: SqlitePool, event_bus: EventBus, limits: StalenessLimits) -> Self {
        Self {
            pool,
            event_bus,
            limits,
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn perform_full_consistency_check(&self) -> PipelineResult<ConsistencyCheckResult> {
        let _run = self.run_lock.lock().await;
        let started_at = Utc::now();
        let check_id = Uuid::new_v4();

        let snapshot = StoreSnapshot::load(&self.pool).await?;
        let findings = detect(&snapshot, self.limits, started_at);
        let previous = latest_discrepancy_keys(&self.pool).await?;

        let detected_at = Utc::now();
        let discrepancies: Vec<Discrepancy> = findings
            .into_iter()
            .map(|finding| Discrepancy {
                id: Uuid::new_v4(),
                check_id,
                discrepancy_type: finding.discrepancy_type,
                entity_type: finding.entity_type.to_string(),
                entity_id: finding.entity_id,
                severity: finding.severity,
                description: finding.description,
                provider_data: finding.provider_data,
                local_data: finding.local_data,
                detected_at,
            })
            .collect();

        let current: HashSet<_> = discrepancies.iter().map(Discrepancy::key).collect();
        let auto_resolved = previous.difference(&current).count() as u64;

        let checked = snapshot.entity_count();
        let found = discrepancies.len() as u64;
        let manual_review_required = discrepancies
            .iter()
            .filter(|d| d.severity.requires_manual_review())
            .count() as u64;
        let score = consistency_score(checked, found);

        let result = ConsistencyCheckResult {
            check_id,
            total_entities_checked: checked,
            discrepancies_found: found,
            auto_resolved,
            manual_review_required,
            consistency_score: score,
            started_at,
            completed_at: Utc::now(),
        };

        let alert = alert_level(score).map(|level| ConsistencyAlert {
            id: Uuid::new_v4(),
            check_id,
            level,
            consistency_score: score,
            discrepancies_found: found,
            manual_review_required,
            message: format!(
                "Consistency score {} is below {} ({} discrepancies, {} need manual review)",
                score, ALERT_THRESHOLD, found, manual_review_required
            ),
            raised_at: Utc::now(),
        });

        record_check(&self.pool, &result, &discrepancies, alert.as_ref()).await?;

        info!(
            check_id = %check_id,
            checked,
            discrepancies = found,
            auto_resolved,
            score,
            "Consistency check completed"
        );
        self.event_bus.emit_lossy(FleetEvent::ConsistencyCheckCompleted {
            result: result.clone(),
            timestamp: Utc::now(),
        });
        if let Some(alert) = alert {
            warn!(level = alert.level.as_str(), score, "{}", alert.message);
            self.event_bus.emit_lossy(FleetEvent::ConsistencyAlertRaised {
                alert,
                timestamp: Utc::now(),
            });
        }

        Ok(result)
    }

    /// Periodic consistency sweep
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_secs = interval.as_secs(), "Consistency verifier started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.perform_full_consistency_check().await {
                        error!("Consistency check failed: {}", e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_position;

    const LIMITS: StalenessLimits = StalenessLimits {
        position_max_age: Duration::from_secs(3600),
        sync_max_age: Duration::from_secs(300),
    };

    fn vehicle(id: &str, device_id: Option<&str>, name: Option<&str>, user_id: Option<&str>) -> VehicleRow {
        VehicleRow {
            id: id.to_string(),
            device_id: device_id.map(str::to_string),
            name: name.map(str::to_string),
            plate_number: None,
            user_id: user_id.map(str::to_string),
        }
    }

    #[test]
    fn test_score_boundaries() {
        assert_eq!(consistency_score(0, 0), 100);
        assert_eq!(consistency_score(100, 15), 85);
        assert_eq!(consistency_score(100, 16), 84);
        assert_eq!(consistency_score(3, 1), 67);
        assert_eq!(consistency_score(2, 5), 0);
    }

    #[test]
    fn test_alert_levels() {
        assert_eq!(alert_level(85), None);
        assert_eq!(alert_level(84), Some(AlertLevel::Warning));
        assert_eq!(alert_level(70), Some(AlertLevel::Warning));
        assert_eq!(alert_level(69), Some(AlertLevel::Critical));
    }

    #[test]
    fn test_duplicate_and_missing_fields() {
        let snapshot = StoreSnapshot {
            vehicles: vec![
                vehicle("v1", Some("D1"), Some("Truck"), Some("u1")),
                vehicle("v2", Some("D1"), Some("Van"), Some("u1")),
                vehicle("v3", None, Some("Bus"), None),
            ],
            ..Default::default()
        };

        let findings = detect(&snapshot, LIMITS, Utc::now());
        assert_eq!(findings.len(), 2);

        assert_eq!(findings[0].discrepancy_type, DiscrepancyType::DuplicateDevice);
        assert_eq!(findings[0].entity_id, "D1");
        assert_eq!(findings[0].severity, Severity::High);

        assert_eq!(findings[1].discrepancy_type, DiscrepancyType::MissingField);
        assert_eq!(findings[1].entity_id, "v3");
        assert!(findings[1].description.contains("device_id, user_id"));
    }

    #[test]
    fn test_orphaned_session_detection() {
        let snapshot = StoreSnapshot {
            provider_sessions: vec![
                ProviderSessionRow {
                    id: "s1".into(),
                    user_id: Some("ghost".into()),
                    expires_at: "2030-01-01T00:00:00.000Z".into(),
                },
                ProviderSessionRow {
                    id: "s2".into(),
                    user_id: Some("u1".into()),
                    expires_at: "2030-01-01T00:00:00.000Z".into(),
                },
                ProviderSessionRow {
                    id: "s3".into(),
                    user_id: None,
                    expires_at: "2030-01-01T00:00:00.000Z".into(),
                },
            ],
            user_ids: ["u1".to_string()].into_iter().collect(),
            ..Default::default()
        };

        let findings = detect(&snapshot, LIMITS, Utc::now());
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].discrepancy_type, DiscrepancyType::OrphanedSession);
        assert_eq!(findings[0].entity_id, "s1");
    }

    #[test]
    fn test_staleness_checks() {
        let now = Utc::now();
        let mut stale = sample_position("OLD", 1.0, 1.0);
        stale.device_timestamp = now - ChronoDuration::hours(2);
        let fresh = sample_position("NEW", 1.0, 1.0);

        let snapshot = StoreSnapshot {
            latest_positions: vec![stale, fresh],
            watermarks: vec![
                (
                    "positions".to_string(),
                    SyncWatermark {
                        last_success_at: Some(now - ChronoDuration::minutes(10)),
                        ..Default::default()
                    },
                ),
                (
                    "healthy".to_string(),
                    SyncWatermark {
                        last_success_at: Some(now),
                        ..Default::default()
                    },
                ),
            ],
            ..Default::default()
        };

        let findings = detect(&snapshot, LIMITS, now);
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].entity_type, "device_position");
        assert_eq!(findings[0].entity_id, "OLD");
        assert_eq!(findings[0].severity, Severity::Low);
        assert_eq!(findings[1].entity_type, "sync_state");
        assert_eq!(findings[1].severity, Severity::Medium);
        assert_eq!(snapshot.entity_count(), 4);
    }
}
