//! # Timestamp and Record Validation
//!
//! Normalizes the timestamp shapes produced by the backend and by local
//! callers, and checks that records carry the fields synchronization relies on.
//!
//! Accepted timestamp shapes:
//!
//! - RFC 3339 (`2024-05-01T10:00:00Z`, `2024-05-01T10:00:00.123+02:00`)
//! - Postgres text output (`2024-05-01 10:00:00.123+00`)
//! - Naive date-times, interpreted as UTC (`2024-05-01 10:00:00`)
//! - Unix epoch numbers, in seconds or milliseconds

use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde_json::Value;

use crate::shared::config::TablePolicy;
use crate::shared::error::SyncError;

/// Field carrying the record's primary key
pub const ID_FIELD: &str = "id";

/// Field carrying the record's last modification time
pub const UPDATED_AT_FIELD: &str = "updated_at";

/// Epoch values above this are treated as milliseconds.
const EPOCH_MILLIS_THRESHOLD: i64 = 100_000_000_000;

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
];

/// Parse a textual timestamp into UTC
pub fn normalize_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }

    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Some(dt.with_timezone(&Utc));
    }

    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    raw.parse::<i64>().ok().and_then(from_epoch)
}

fn from_epoch(value: i64) -> Option<DateTime<Utc>> {
    if value.abs() >= EPOCH_MILLIS_THRESHOLD {
        DateTime::from_timestamp_millis(value)
    } else {
        DateTime::from_timestamp(value, 0)
    }
}

/// Parse a JSON value (string or number) into UTC
pub fn timestamp_from_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => normalize_timestamp(s),
        Value::Number(n) => n.as_i64().and_then(from_epoch),
        _ => None,
    }
}

/// Canonical textual form used for storage and remote filters
pub fn to_canonical(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// The `updated_at` of a record payload, if present and parseable
pub fn record_updated_at(record: &Value) -> Option<DateTime<Utc>> {
    record.get(UPDATED_AT_FIELD).and_then(timestamp_from_value)
}

/// The primary key of a record payload as a string
pub fn record_id(record: &Value) -> Option<String> {
    match record.get(ID_FIELD)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Check that a record fetched from the backend can be mirrored locally.
///
/// The record must be a JSON object with an id, a parseable `updated_at`
/// when one is present, and every field the table policy requires.
pub fn validate_record(
    table: &str,
    policy: Option<&TablePolicy>,
    record: &Value,
) -> Result<(), SyncError> {
    let object = record
        .as_object()
        .ok_or_else(|| SyncError::validation(table, "<record>", "record must be a JSON object"))?;

    if record_id(record).is_none() {
        return Err(SyncError::validation(table, ID_FIELD, "missing or empty id"));
    }

    if let Some(raw) = object.get(UPDATED_AT_FIELD) {
        if !raw.is_null() && timestamp_from_value(raw).is_none() {
            return Err(SyncError::validation(
                table,
                UPDATED_AT_FIELD,
                format!("unparseable timestamp {}", raw),
            ));
        }
    }

    if let Some(policy) = policy {
        for field in &policy.required_fields {
            match object.get(field) {
                None | Some(Value::Null) => {
                    return Err(SyncError::validation(table, field.as_str(), "required field missing"));
                }
                _ => {}
            }
        }
    }

    Ok(())
}
