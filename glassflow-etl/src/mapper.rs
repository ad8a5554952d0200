//! Field extraction and type coercion from JSON payloads to ClickHouse
//! column values. Pure functions; a failed mapping is a [`MappingError`]
//! that the sink turns into a DLQ entry, never a silent drop.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Bool,
    String,
    DateTime,
}

/// A typed value ready to be rendered into an insert.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Int(i64),
    UInt(u64),
    Float(f64),
    Bool(bool),
    String(String),
    DateTime(DateTime<Utc>),
    Null,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MappingError {
    #[error("field {path} missing and column is not nullable")]
    MissingField { path: String },
    #[error("field {path}: expected {expected:?}, found {found}")]
    TypeMismatch {
        path: String,
        expected: ColumnType,
        found: String,
    },
    #[error("field {path}: {detail}")]
    Parse { path: String, detail: String },
    #[error("payload is not valid JSON")]
    MalformedPayload,
}

/// Walks a dotted path through nested JSON objects.
pub fn extract_field<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = payload;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Resolves a path against the payload and coerces it to the column type.
/// A missing field or JSON null maps to `Null` on nullable columns and to
/// an error otherwise.
pub fn map_field(
    payload: &Value,
    path: &str,
    column_type: ColumnType,
    nullable: bool,
) -> Result<ColumnValue, MappingError> {
    match extract_field(payload, path) {
        None | Some(Value::Null) if nullable => Ok(ColumnValue::Null),
        None | Some(Value::Null) => Err(MappingError::MissingField {
            path: path.to_string(),
        }),
        Some(value) => coerce(value, column_type, path),
    }
}

/// Coercion rules, spelled out:
/// - integers (and floats, booleans) may widen to String,
/// - String to a numeric type requires a strict parse of the whole text,
/// - integers check the destination width, floats accept any JSON number,
/// - Bool comes from JSON booleans only,
/// - DateTime accepts RFC3339 text or epoch seconds.
pub fn coerce(value: &Value, column_type: ColumnType, path: &str) -> Result<ColumnValue, MappingError> {
    match column_type {
        ColumnType::Int8 => coerce_int(value, path, column_type, i8::MIN as i64, i8::MAX as i64),
        ColumnType::Int16 => coerce_int(value, path, column_type, i16::MIN as i64, i16::MAX as i64),
        ColumnType::Int32 => coerce_int(value, path, column_type, i32::MIN as i64, i32::MAX as i64),
        ColumnType::Int64 => coerce_int(value, path, column_type, i64::MIN, i64::MAX),
        ColumnType::UInt8 => coerce_uint(value, path, column_type, u8::MAX as u64),
        ColumnType::UInt16 => coerce_uint(value, path, column_type, u16::MAX as u64),
        ColumnType::UInt32 => coerce_uint(value, path, column_type, u32::MAX as u64),
        ColumnType::UInt64 => coerce_uint(value, path, column_type, u64::MAX),
        ColumnType::Float32 | ColumnType::Float64 => coerce_float(value, path, column_type),
        ColumnType::Bool => match value {
            Value::Bool(b) => Ok(ColumnValue::Bool(*b)),
            other => Err(mismatch(path, column_type, other)),
        },
        ColumnType::String => match value {
            Value::String(s) => Ok(ColumnValue::String(s.clone())),
            Value::Number(n) => Ok(ColumnValue::String(n.to_string())),
            Value::Bool(b) => Ok(ColumnValue::String(b.to_string())),
            other => Err(mismatch(path, column_type, other)),
        },
        ColumnType::DateTime => coerce_datetime(value, path),
    }
}

fn coerce_int(
    value: &Value,
    path: &str,
    column_type: ColumnType,
    min: i64,
    max: i64,
) -> Result<ColumnValue, MappingError> {
    let parsed = match value {
        Value::Number(n) => n.as_i64().ok_or_else(|| mismatch(path, column_type, value))?,
        Value::String(s) => s.trim().parse::<i64>().map_err(|e| MappingError::Parse {
            path: path.to_string(),
            detail: format!("not an integer: {e}"),
        })?,
        other => return Err(mismatch(path, column_type, other)),
    };
    if parsed < min || parsed > max {
        return Err(MappingError::Parse {
            path: path.to_string(),
            detail: format!("{parsed} out of range for {column_type:?}"),
        });
    }
    Ok(ColumnValue::Int(parsed))
}

fn coerce_uint(
    value: &Value,
    path: &str,
    column_type: ColumnType,
    max: u64,
) -> Result<ColumnValue, MappingError> {
    let parsed = match value {
        Value::Number(n) => n.as_u64().ok_or_else(|| mismatch(path, column_type, value))?,
        Value::String(s) => s.trim().parse::<u64>().map_err(|e| MappingError::Parse {
            path: path.to_string(),
            detail: format!("not an unsigned integer: {e}"),
        })?,
        other => return Err(mismatch(path, column_type, other)),
    };
    if parsed > max {
        return Err(MappingError::Parse {
            path: path.to_string(),
            detail: format!("{parsed} out of range for {column_type:?}"),
        });
    }
    Ok(ColumnValue::UInt(parsed))
}

fn coerce_float(
    value: &Value,
    path: &str,
    column_type: ColumnType,
) -> Result<ColumnValue, MappingError> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .map(ColumnValue::Float)
            .ok_or_else(|| mismatch(path, column_type, value)),
        Value::String(s) => s.trim().parse::<f64>().map(ColumnValue::Float).map_err(|e| {
            MappingError::Parse {
                path: path.to_string(),
                detail: format!("not a float: {e}"),
            }
        }),
        other => Err(mismatch(path, column_type, other)),
    }
}

fn coerce_datetime(value: &Value, path: &str) -> Result<ColumnValue, MappingError> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| ColumnValue::DateTime(dt.with_timezone(&Utc)))
            .map_err(|e| MappingError::Parse {
                path: path.to_string(),
                detail: format!("not an RFC3339 timestamp: {e}"),
            }),
        Value::Number(n) => {
            let secs = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)).ok_or_else(
                || MappingError::Parse {
                    path: path.to_string(),
                    detail: "not an epoch timestamp".to_string(),
                },
            )?;
            match Utc.timestamp_opt(secs, 0) {
                chrono::LocalResult::Single(dt) => Ok(ColumnValue::DateTime(dt)),
                _ => Err(MappingError::Parse {
                    path: path.to_string(),
                    detail: format!("epoch seconds {secs} out of range"),
                }),
            }
        }
        other => Err(mismatch(path, ColumnType::DateTime, other)),
    }
}

fn mismatch(path: &str, expected: ColumnType, found: &Value) -> MappingError {
    let found = match found {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    };
    MappingError::TypeMismatch {
        path: path.to_string(),
        expected,
        found: found.to_string(),
    }
}
