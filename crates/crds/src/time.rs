//! Timestamp conversion for Kubernetes meta time types.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Converts a `Time`/`MicroTime` into a chrono timestamp via its RFC 3339
/// wire form.
pub fn to_utc<T: Serialize>(time: &T) -> Option<DateTime<Utc>> {
    let value = serde_json::to_value(time).ok()?;
    let raw = value.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// RFC 3339 form with microsecond precision, as accepted for `MicroTime`.
pub fn micro_time_string(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

/// Builds a `Time`/`MicroTime` from a chrono timestamp.
pub fn from_utc<T: DeserializeOwned>(time: DateTime<Utc>) -> Option<T> {
    serde_json::from_value(serde_json::Value::String(micro_time_string(time))).ok()
}
