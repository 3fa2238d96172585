//! Declared-type mapping and text-to-Arrow conversion.
//!
//! SQLite column types are free text, so mapping is by case-insensitive
//! substring in a fixed priority order. Conversion never fails a scan: text
//! that does not parse as the mapped type becomes null.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use datafusion::arrow::array::{
    ArrayRef, BinaryBuilder, BooleanBuilder, Date32Builder, Float64Builder, Int64Builder,
    StringBuilder, TimestampMicrosecondBuilder,
};
use datafusion::arrow::datatypes::{DataType, TimeUnit};
use std::sync::Arc;

/// First matching rule wins.
pub fn map_type(declared: &str) -> DataType {
    let upper = declared.to_ascii_uppercase();
    let has = |needle: &str| upper.contains(needle);

    if has("INT") {
        DataType::Int64
    } else if has("CHAR") || has("CLOB") || has("TEXT") {
        DataType::Utf8
    } else if has("BOOL") {
        DataType::Boolean
    } else if has("DATE") {
        DataType::Date32
    } else if has("TIME") {
        DataType::Timestamp(TimeUnit::Microsecond, None)
    } else if has("BLOB") || upper.trim().is_empty() {
        DataType::Binary
    } else if has("REAL") || has("FLOA") || has("DOUB") {
        DataType::Float64
    } else {
        DataType::Utf8
    }
}

/// Builds one Arrow column of `data_type` from remote text values.
pub fn convert_column<'a, I>(values: I, data_type: &DataType, column: &str) -> ArrayRef
where
    I: ExactSizeIterator<Item = Option<&'a str>>,
{
    let len = values.len();
    match data_type {
        DataType::Int64 => {
            let mut builder = Int64Builder::with_capacity(len);
            for v in values {
                builder.append_option(v.and_then(|s| convert(s, column, "Int64", parse_int)));
            }
            Arc::new(builder.finish())
        }
        DataType::Float64 => {
            let mut builder = Float64Builder::with_capacity(len);
            for v in values {
                builder.append_option(v.and_then(|s| convert(s, column, "Float64", parse_float)));
            }
            Arc::new(builder.finish())
        }
        DataType::Boolean => {
            let mut builder = BooleanBuilder::with_capacity(len);
            for v in values {
                builder.append_option(v.and_then(|s| convert(s, column, "Boolean", parse_bool)));
            }
            Arc::new(builder.finish())
        }
        DataType::Date32 => {
            let mut builder = Date32Builder::with_capacity(len);
            for v in values {
                builder.append_option(v.and_then(|s| convert(s, column, "Date32", parse_date)));
            }
            Arc::new(builder.finish())
        }
        DataType::Timestamp(TimeUnit::Microsecond, None) => {
            let mut builder = TimestampMicrosecondBuilder::with_capacity(len);
            for v in values {
                builder.append_option(
                    v.and_then(|s| convert(s, column, "Timestamp", parse_timestamp_micros)),
                );
            }
            Arc::new(builder.finish())
        }
        DataType::Binary => {
            let mut builder = BinaryBuilder::with_capacity(len, len * 16);
            for v in values {
                match v {
                    Some(s) => builder.append_value(parse_binary(s)),
                    None => builder.append_null(),
                }
            }
            Arc::new(builder.finish())
        }
        _ => {
            let mut builder = StringBuilder::with_capacity(len, len * 16);
            for v in values {
                builder.append_option(v);
            }
            Arc::new(builder.finish())
        }
    }
}

fn convert<T>(text: &str, column: &str, target: &str, parse: fn(&str) -> Option<T>) -> Option<T> {
    let parsed = parse(text);
    if parsed.is_none() {
        tracing::debug!(column, expected = target, value = text, "Unconvertible value replaced with null");
    }
    parsed
}

/// Integers, or floats without a fractional part (SQLite may hand back `3.0`).
pub fn parse_int(text: &str) -> Option<i64> {
    let text = text.trim();
    if let Ok(v) = text.parse::<i64>() {
        return Some(v);
    }
    let f = text.parse::<f64>().ok()?;
    if f.is_finite() && f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

pub fn parse_float(text: &str) -> Option<f64> {
    text.trim().parse::<f64>().ok()
}

pub fn parse_bool(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "1" | "true" => Some(true),
        "0" | "false" => Some(false),
        _ => None,
    }
}

/// Days since the Unix epoch. A datetime keeps only its date part.
pub fn parse_date(text: &str) -> Option<i32> {
    let text = text.trim();
    let date = NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .or_else(|| parse_naive_datetime(text).map(|dt| dt.date()))?;
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1)?;
    i32::try_from(date.signed_duration_since(epoch).num_days()).ok()
}

/// Microseconds since the Unix epoch. Integers are read as Unix seconds.
pub fn parse_timestamp_micros(text: &str) -> Option<i64> {
    let text = text.trim();
    if let Ok(seconds) = text.parse::<i64>() {
        return seconds.checked_mul(1_000_000);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.timestamp_micros());
    }
    if let Some(dt) = parse_naive_datetime(text) {
        return Some(dt.and_utc().timestamp_micros());
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp_micros())
}

fn parse_naive_datetime(text: &str) -> Option<NaiveDateTime> {
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
}

/// Blobs arrive as JSON byte arrays; anything else is taken as raw text bytes.
pub fn parse_binary(text: &str) -> Vec<u8> {
    if text.starts_with('[') {
        if let Ok(bytes) = serde_json::from_str::<Vec<u8>>(text) {
            return bytes;
        }
    }
    text.as_bytes().to_vec()
}
