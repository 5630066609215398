//! Timestamp utilities

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};

use crate::{Error, Result};

/// Format a timestamp for storage
///
/// Fixed-width RFC 3339 with millisecond precision and a `Z` suffix, so
/// stored values order correctly as plain text.
pub fn to_db_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a timestamp read back from storage
pub fn from_db_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Invalid stored timestamp '{}': {}", value, e)))
}

/// Parse a provider timestamp
///
/// Accepts RFC 3339 strings and epoch seconds (integer or float, as a
/// number or a numeric string). Values above 10^12 are taken as epoch
/// milliseconds.
pub fn parse_timestamp(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => {
            let trimmed = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
                return Some(dt.with_timezone(&Utc));
            }
            trimmed.parse::<f64>().ok().and_then(from_epoch)
        }
        serde_json::Value::Number(n) => n.as_f64().and_then(from_epoch),
        _ => None,
    }
}

fn from_epoch(raw: f64) -> Option<DateTime<Utc>> {
    if !raw.is_finite() || raw < 0.0 {
        return None;
    }
    let millis = if raw > 1e12 { raw } else { raw * 1000.0 };
    Utc.timestamp_millis_opt(millis as i64).single()
}
