//! Provider record decoding
//!
//! Maps one raw provider record onto a [`DevicePosition`]. Field names vary
//! between provider API versions, so several aliases are accepted for each.

use chrono::{DateTime, Utc};
use fleet_common::time::parse_timestamp;
use fleet_common::DevicePosition;
use serde_json::{Map, Value};

use crate::error::{PipelineError, PipelineResult};

/// Decode and validate one provider record
///
/// Fails with [`PipelineError::Validation`] when the record is not an
/// object, lacks a device id or coordinates, or violates the position
/// invariants.
pub fn decode_position(raw: &Value, server_timestamp: DateTime<Utc>) -> PipelineResult<DevicePosition> {
    let record = raw
        .as_object()
        .ok_or_else(|| PipelineError::Validation("record is not a JSON object".to_string()))?;

    let device_id = string_field(record, &["device_id", "deviceId", "imei"])
        .ok_or_else(|| PipelineError::Validation("record has no device id".to_string()))?;

    let latitude = number_field(record, &["lat", "latitude"])
        .ok_or_else(|| PipelineError::Validation(format!("record for {} has no latitude", device_id)))?;
    let longitude = number_field(record, &["lon", "lng", "longitude"])
        .ok_or_else(|| PipelineError::Validation(format!("record for {} has no longitude", device_id)))?;

    let speed = number_field(record, &["speed"]).unwrap_or(0.0).max(0.0);
    let course = number_field(record, &["course", "heading"])
        .map(normalize_course)
        .unwrap_or(0);

    let device_timestamp = ["device_time", "deviceTime", "gps_time", "gpsTime", "timestamp"]
        .iter()
        .filter_map(|key| record.get(*key))
        .find_map(parse_timestamp)
        .unwrap_or(server_timestamp);

    let is_moving = bool_field(record, &["is_moving", "isMoving", "moving"]).unwrap_or(speed > 0.0);

    let position = DevicePosition {
        device_id,
        latitude,
        longitude,
        speed,
        course,
        altitude: number_field(record, &["altitude", "alt"]).unwrap_or(0.0),
        device_timestamp,
        server_timestamp,
        status_code: number_field(record, &["status", "status_code", "statusCode"])
            .map(|v| v as i64)
            .unwrap_or(0),
        is_moving,
        voltage: number_field(record, &["voltage"]),
        fuel_level: number_field(record, &["fuel", "fuel_level", "fuelLevel"]),
        signal_strength: number_field(record, &["signal", "signal_strength", "gsm"]).map(|v| v as i64),
        satellite_count: number_field(record, &["satellites", "satellite_count", "sats"])
            .map(|v| v as i64),
    };

    position.validate()?;
    Ok(position)
}

/// Wrap any heading into 0..=359
fn normalize_course(raw: f64) -> u16 {
    if !raw.is_finite() {
        return 0;
    }
    (raw.round() as i64).rem_euclid(360) as u16
}

fn string_field(record: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match record.get(*key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn number_field(record: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|key| match record.get(*key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    })
}

fn bool_field(record: &Map<String, Value>, keys: &[&str]) -> Option<bool> {
    keys.iter().find_map(|key| match record.get(*key)? {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|v| v != 0),
        Value::String(s) => match s.trim() {
            "1" | "true" => Some(true),
            "0" | "false" => Some(false),
            _ => None,
        },
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_minimal_record() {
        let now = Utc::now();
        let position = decode_position(&json!({"device_id": "D1", "lat": 10, "lon": 20, "speed": 0}), now)
            .unwrap();

        assert_eq!(position.device_id, "D1");
        assert_eq!(position.latitude, 10.0);
        assert_eq!(position.longitude, 20.0);
        assert!(!position.is_moving);
        assert_eq!(position.device_timestamp, now);
        assert_eq!(position.server_timestamp, now);
    }

    #[test]
    fn test_decode_full_record_with_aliases() {
        let position = decode_position(
            &json!({
                "imei": 356938035643809_i64,
                "latitude": "-33.8688",
                "lng": 151.2093,
                "speed": 42.5,
                "heading": -90,
                "alt": 58.0,
                "gps_time": "2024-05-01T08:30:00Z",
                "status": 3,
                "voltage": 12.6,
                "fuel": 55,
                "gsm": 4,
                "sats": 9
            }),
            Utc::now(),
        )
        .unwrap();

        assert_eq!(position.device_id, "356938035643809");
        assert_eq!(position.latitude, -33.8688);
        assert_eq!(position.course, 270);
        assert!(position.is_moving);
        assert_eq!(position.status_code, 3);
        assert_eq!(position.device_timestamp.to_rfc3339(), "2024-05-01T08:30:00+00:00");
        assert_eq!(position.satellite_count, Some(9));
        assert_eq!(position.fuel_level, Some(55.0));
    }

    #[test]
    fn test_decode_rejects_out_of_range_coordinates() {
        let now = Utc::now();
        assert!(decode_position(&json!({"device_id": "D1", "lat": 91, "lon": 0}), now).is_err());
        assert!(decode_position(&json!({"device_id": "D1", "lat": 0, "lon": 180.01}), now).is_err());
    }

    #[test]
    fn test_decode_rejects_missing_identity() {
        let now = Utc::now();
        let err = decode_position(&json!({"device_id": "", "lat": 1, "lon": 1}), now).unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
        assert!(decode_position(&json!({"lat": 1, "lon": 1}), now).is_err());
        assert!(decode_position(&json!(["D1", 1, 1]), now).is_err());
    }

    #[test]
    fn test_negative_speed_is_clamped() {
        let position =
            decode_position(&json!({"device_id": "D1", "lat": 1, "lon": 1, "speed": -3}), Utc::now())
                .unwrap();
        assert_eq!(position.speed, 0.0);
    }

    #[test]
    fn test_normalize_course() {
        assert_eq!(normalize_course(360.0), 0);
        assert_eq!(normalize_course(359.4), 359);
        assert_eq!(normalize_course(-1.0), 359);
        assert_eq!(normalize_course(f64::NAN), 0);
    }
}
