/// Tolerant decoding of exchange payload fields
///
/// Exchanges disagree on whether prices are JSON numbers or strings and on
/// whether timestamps are seconds, milliseconds or RFC 3339 text. These
/// helpers accept all of them and fail with a `Parse` error otherwise.
use serde_json::Value;

use crate::error::{CandleError, Result};
use crate::utils::{normalize_epoch_ms, rfc3339_to_epoch_ms, MILLIS_THRESHOLD};

/// Numeric field that may be encoded as a number or a decimal string
pub fn decimal(value: &Value, context: &str) -> Result<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed
        .filter(|v| v.is_finite())
        .ok_or_else(|| CandleError::parse(context, &value.to_string()))
}

/// Integer field that may be encoded as a number or a digit string
pub fn integer(value: &Value, context: &str) -> Result<i64> {
    let parsed = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| CandleError::parse(context, &value.to_string()))
}

/// Timestamp in epoch milliseconds from seconds, millis, a numeric string
/// (`"1476716400.000000000"`) or RFC 3339 text.
pub fn epoch_ms(value: &Value, context: &str) -> Result<i64> {
    let parsed = match value {
        Value::Number(n) => match n.as_i64() {
            Some(i) => Some(normalize_epoch_ms(i)),
            None => n.as_f64().map(fractional_epoch_to_ms),
        },
        Value::String(s) => {
            let s = s.trim();
            if let Ok(i) = s.parse::<i64>() {
                Some(normalize_epoch_ms(i))
            } else if let Ok(f) = s.parse::<f64>() {
                Some(fractional_epoch_to_ms(f))
            } else {
                rfc3339_to_epoch_ms(s)
            }
        }
        _ => None,
    };
    parsed.ok_or_else(|| CandleError::parse(context, &value.to_string()))
}

/// Timestamp in epoch seconds (sub-second part truncated)
pub fn epoch_secs(value: &Value, context: &str) -> Result<i64> {
    epoch_ms(value, context).map(|ms| ms.div_euclid(1000))
}

/// Fractional seconds, or fractional millis past the same magnitude
/// threshold as the integer forms
fn fractional_epoch_to_ms(raw: f64) -> i64 {
    if raw.abs() >= MILLIS_THRESHOLD as f64 {
        raw.floor() as i64
    } else {
        (raw * 1000.0).floor() as i64
    }
}

/// Field lookup on an object-per-record payload
pub fn field<'a>(record: &'a Value, key: &str, context: &str) -> Result<&'a Value> {
    record
        .get(key)
        .ok_or_else(|| CandleError::parse(format!("{}: missing '{}'", context, key), &record.to_string()))
}

/// Positional lookup on an array-per-record payload
pub fn column<'a>(record: &'a Value, index: usize, context: &str) -> Result<&'a Value> {
    record.get(index).ok_or_else(|| {
        CandleError::parse(format!("{}: missing column {}", context, index), &record.to_string())
    })
}

/// The payload itself, or a named member, as an array
pub fn array<'a>(body: &'a Value, key: Option<&str>, context: &str) -> Result<&'a Vec<Value>> {
    let target = match key {
        Some(k) => body.get(k).unwrap_or(&Value::Null),
        None => body,
    };
    target
        .as_array()
        .ok_or_else(|| CandleError::parse(format!("{}: expected an array", context), &body.to_string()))
}
