//! Fleet data model shared between pipeline components
//!
//! Position records are immutable once decoded: a later sample for the same
//! device is a new record, never a mutation of an earlier one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// One telemetry sample for one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DevicePosition {
    /// Stable external device identifier
    pub device_id: String,
    /// WGS84 latitude, -90..=90
    pub latitude: f64,
    /// WGS84 longitude, -180..=180
    pub longitude: f64,
    /// Ground speed, never negative
    pub speed: f64,
    /// Heading in whole degrees, 0..=359
    pub course: u16,
    pub altitude: f64,
    /// Instant reported by the tracker hardware
    pub device_timestamp: DateTime<Utc>,
    /// Instant the sample was ingested
    pub server_timestamp: DateTime<Utc>,
    /// Provider-defined status code
    pub status_code: i64,
    pub is_moving: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voltage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fuel_level: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_strength: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub satellite_count: Option<i64>,
}

impl DevicePosition {
    /// Check the invariants a record must satisfy before it may be queued
    ///
    /// Rejects an empty (or whitespace) device id, non-finite coordinates,
    /// |latitude| > 90 and |longitude| > 180.
    pub fn validate(&self) -> Result<()> {
        if self.device_id.trim().is_empty() {
            return Err(Error::InvalidInput("empty device_id".to_string()));
        }
        if !self.latitude.is_finite() || self.latitude.abs() > 90.0 {
            return Err(Error::InvalidInput(format!(
                "latitude {} out of range for device {}",
                self.latitude, self.device_id
            )));
        }
        if !self.longitude.is_finite() || self.longitude.abs() > 180.0 {
            return Err(Error::InvalidInput(format!(
                "longitude {} out of range for device {}",
                self.longitude, self.device_id
            )));
        }
        if !self.speed.is_finite() || self.speed < 0.0 {
            return Err(Error::InvalidInput(format!(
                "speed {} invalid for device {}",
                self.speed, self.device_id
            )));
        }
        if self.course > 359 {
            return Err(Error::InvalidInput(format!(
                "course {} invalid for device {}",
                self.course, self.device_id
            )));
        }
        Ok(())
    }
}

/// Queue priority band
///
/// `High` items are prepended to the write-back queue; the other bands are
/// appended. Within a band ordering is FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

/// A position record plus write-back pipeline metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedPosition {
    pub position: DevicePosition,
    pub priority: Priority,
    pub retry_count: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedPosition {
    pub fn new(position: DevicePosition, priority: Priority) -> Self {
        Self {
            position,
            priority,
            retry_count: 0,
            enqueued_at: Utc::now(),
        }
    }
}

/// Per-scope poll cursor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SyncWatermark {
    /// Opaque cursor returned by the provider (or an RFC 3339 instant)
    pub last_query_time: Option<String>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub error_count: u32,
    pub last_error: Option<String>,
}

/// Discrepancy and alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    /// High and critical findings need a human to look at them
    pub fn requires_manual_review(&self) -> bool {
        matches!(self, Severity::High | Severity::Critical)
    }
}

impl std::str::FromStr for Severity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(Error::InvalidInput(format!("unknown severity '{}'", other))),
        }
    }
}

/// Kind of consistency finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiscrepancyType {
    DuplicateDevice,
    MissingField,
    OrphanedSession,
    StaleData,
}

impl DiscrepancyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscrepancyType::DuplicateDevice => "duplicate-device",
            DiscrepancyType::MissingField => "missing-field",
            DiscrepancyType::OrphanedSession => "orphaned-session",
            DiscrepancyType::StaleData => "stale-data",
        }
    }
}

impl std::str::FromStr for DiscrepancyType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "duplicate-device" => Ok(DiscrepancyType::DuplicateDevice),
            "missing-field" => Ok(DiscrepancyType::MissingField),
            "orphaned-session" => Ok(DiscrepancyType::OrphanedSession),
            "stale-data" => Ok(DiscrepancyType::StaleData),
            other => Err(Error::InvalidInput(format!("unknown discrepancy type '{}'", other))),
        }
    }
}

/// One detected mismatch, recorded once for audit and never mutated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discrepancy {
    pub id: Uuid,
    pub check_id: Uuid,
    #[serde(rename = "type")]
    pub discrepancy_type: DiscrepancyType,
    pub entity_type: String,
    pub entity_id: String,
    pub severity: Severity,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_data: Option<serde_json::Value>,
    pub detected_at: DateTime<Utc>,
}

impl Discrepancy {
    /// Identity of the finding independent of the run that produced it
    pub fn key(&self) -> (DiscrepancyType, String, String) {
        (
            self.discrepancy_type,
            self.entity_type.clone(),
            self.entity_id.clone(),
        )
    }
}

/// Summary of one full consistency run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsistencyCheckResult {
    pub check_id: Uuid,
    pub total_entities_checked: u64,
    pub discrepancies_found: u64,
    pub auto_resolved: u64,
    pub manual_review_required: u64,
    pub consistency_score: u8,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Alert level raised when the consistency score drops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Warning,
    Critical,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Warning => "warning",
            AlertLevel::Critical => "critical",
        }
    }
}

impl std::str::FromStr for AlertLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "warning" => Ok(AlertLevel::Warning),
            "critical" => Ok(AlertLevel::Critical),
            other => Err(Error::InvalidInput(format!("unknown alert level '{}'", other))),
        }
    }
}

/// Alert raised by a consistency run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsistencyAlert {
    pub id: Uuid,
    pub check_id: Uuid,
    pub level: AlertLevel,
    pub consistency_score: u8,
    pub discrepancies_found: u64,
    pub manual_review_required: u64,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

/// Write-back queue processing metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct QueueMetrics {
    pub total_processed: u64,
    pub successful_inserts: u64,
    pub failed_inserts: u64,
    pub dropped_items: u64,
    /// Rolling mean over the most recent batches
    pub average_latency_ms: f64,
    pub queue_size: usize,
    pub is_processing: bool,
    pub is_paused: bool,
    pub last_processed_at: Option<DateTime<Utc>>,
}

/// Outcome metrics of the most recent poll cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetrics {
    pub total_vehicles: u64,
    pub positions_updated: u64,
    pub invalid_records: u64,
    pub errors: u64,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub in_progress: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(device_id: &str, lat: f64, lon: f64) -> DevicePosition {
        DevicePosition {
            device_id: device_id.to_string(),
            latitude: lat,
            longitude: lon,
            speed: 0.0,
            course: 0,
            altitude: 0.0,
            device_timestamp: Utc::now(),
            server_timestamp: Utc::now(),
            status_code: 0,
            is_moving: false,
            voltage: None,
            fuel_level: None,
            signal_strength: None,
            satellite_count: None,
        }
    }

    #[test]
    fn test_validate_accepts_boundaries() {
        assert!(sample("D1", 90.0, 180.0).validate().is_ok());
        assert!(sample("D1", -90.0, -180.0).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        assert!(sample("D1", 90.0001, 0.0).validate().is_err());
        assert!(sample("D1", 0.0, -180.5).validate().is_err());
        assert!(sample("D1", f64::NAN, 0.0).validate().is_err());
    }

    #[test]
    fn test_validate_rejects_blank_device() {
        assert!(sample("", 1.0, 1.0).validate().is_err());
        assert!(sample("   ", 1.0, 1.0).validate().is_err());
    }

    #[test]
    fn test_severity_manual_review() {
        assert!(!Severity::Low.requires_manual_review());
        assert!(!Severity::Medium.requires_manual_review());
        assert!(Severity::High.requires_manual_review());
        assert!(Severity::Critical.requires_manual_review());
    }

    #[test]
    fn test_discrepancy_type_wire_names() {
        let json = serde_json::to_string(&DiscrepancyType::OrphanedSession).unwrap();
        assert_eq!(json, "\"orphaned-session\"");
        let parsed: DiscrepancyType = "stale-data".parse().unwrap();
        assert_eq!(parsed, DiscrepancyType::StaleData);
    }
}
