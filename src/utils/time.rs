/// Time utilities for candle period math and exchange timestamps
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};

use crate::error::{CandleError, Result};
use crate::types::Granularity;

/// Epoch values above this are treated as milliseconds (year 5138 in seconds).
pub const MILLIS_THRESHOLD: i64 = 100_000_000_000;

/// Normalize a second- or millisecond-precision epoch value to seconds
pub fn normalize_epoch_secs(raw: i64) -> i64 {
    if raw.abs() >= MILLIS_THRESHOLD {
        raw.div_euclid(1000)
    } else {
        raw
    }
}

/// Normalize a second- or millisecond-precision epoch value to milliseconds
pub fn normalize_epoch_ms(raw: i64) -> i64 {
    if raw.abs() >= MILLIS_THRESHOLD {
        raw
    } else {
        raw * 1000
    }
}

/// Start of the period that `now` falls into
pub fn current_period_start(now: DateTime<Utc>, granularity: Granularity) -> i64 {
    granularity.align_down(now.timestamp())
}

/// RFC 3339 string (UTC, whole seconds) for an epoch second
pub fn epoch_to_rfc3339(epoch_secs: i64) -> Result<String> {
    let dt = Utc
        .timestamp_opt(epoch_secs, 0)
        .single()
        .ok_or_else(|| CandleError::config(format!("epoch {} out of range", epoch_secs)))?;
    Ok(dt.to_rfc3339_opts(SecondsFormat::Secs, true))
}

/// Parse an RFC 3339 timestamp (nanosecond fractions allowed) to epoch millis
pub fn rfc3339_to_epoch_ms(text: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.with_timezone(&Utc).timestamp_millis())
}
