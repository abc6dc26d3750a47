//! Dynamically-typed scalar values exchanged with plugins.
//!
//! Plugins produce whatever their upstream API hands them: numbers of any
//! width, string-encoded numbers, booleans, timestamps in three formats, or
//! nothing at all. The host coerces each value to the column's declared type
//! before it reaches the engine; coercion is best-effort and total, because
//! a sloppy plugin must never abort a whole scan.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Declared type of a table column.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Int,
    Float,
    String,
    Bool,
    DateTime,
    Blob,
}

impl ColumnType {
    /// The SQL type keyword used when declaring the table to the engine.
    pub fn sql_name(&self) -> &'static str {
        match self {
            ColumnType::Int => "INTEGER",
            ColumnType::Float => "REAL",
            ColumnType::String => "TEXT",
            // Booleans and timestamps are stored with integer/text affinity.
            ColumnType::Bool => "INTEGER",
            ColumnType::DateTime => "TEXT",
            ColumnType::Blob => "BLOB",
        }
    }
}

/// A single scalar value in a row, a constraint, or a write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    String(String),
    Bool(bool),
    DateTime(DateTime<FixedOffset>),
    Blob(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get the type name as a string, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Bool(_) => "bool",
            Value::DateTime(_) => "datetime",
            Value::Blob(_) => "blob",
        }
    }

    /// Coerce this value to a column's declared type.
    ///
    /// This is a total function: a value that cannot be represented under
    /// the declared type is passed through unchanged rather than rejected,
    /// since the engine layer is dynamically typed anyway. Numeric
    /// conversions only happen when they lose no precision; string-encoded
    /// numbers are parsed when the declared type is numeric.
    ///
    /// # Example
    /// ```rust
    /// use plugtab_common::{ColumnType, Value};
    ///
    /// assert_eq!(Value::String("42".into()).coerce_to(ColumnType::Int), Value::Int(42));
    /// assert_eq!(Value::Int(3).coerce_to(ColumnType::Float), Value::Float(3.0));
    /// assert_eq!(Value::Null.coerce_to(ColumnType::String), Value::Null);
    /// ```
    pub fn coerce_to(self, target: ColumnType) -> Value {
        match (self, target) {
            (Value::Null, _) => Value::Null,

            // Int target
            (v @ Value::Int(_), ColumnType::Int) => v,
            (Value::Bool(b), ColumnType::Int) => Value::Int(b as i64),
            (Value::Float(f), ColumnType::Int) => {
                if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
                    Value::Int(f as i64)
                } else {
                    Value::Float(f)
                }
            }
            (Value::String(s), ColumnType::Int) => match s.trim().parse::<i64>() {
                Ok(i) => Value::Int(i),
                Err(_) => match s.trim().parse::<f64>() {
                    Ok(f) => Value::Float(f).coerce_to(ColumnType::Int),
                    Err(_) => Value::String(s),
                },
            },
            (Value::DateTime(dt), ColumnType::Int) => Value::Int(dt.timestamp()),

            // Float target
            (v @ Value::Float(_), ColumnType::Float) => v,
            (Value::Int(i), ColumnType::Float) => Value::Float(i as f64),
            (Value::Bool(b), ColumnType::Float) => Value::Float(b as i64 as f64),
            (Value::String(s), ColumnType::Float) => match s.trim().parse::<f64>() {
                Ok(f) => Value::Float(f),
                Err(_) => Value::String(s),
            },

            // String target
            (v @ Value::String(_), ColumnType::String) => v,
            (Value::Int(i), ColumnType::String) => Value::String(i.to_string()),
            (Value::Float(f), ColumnType::String) => Value::String(f.to_string()),
            (Value::Bool(b), ColumnType::String) => {
                Value::String(if b { "1" } else { "0" }.into())
            }
            (Value::DateTime(dt), ColumnType::String) => Value::String(dt.to_rfc3339()),

            // Bool target
            (v @ Value::Bool(_), ColumnType::Bool) => v,
            (Value::Int(i), ColumnType::Bool) => Value::Bool(i != 0),
            (Value::String(s), ColumnType::Bool) => match s.trim() {
                "1" | "true" | "TRUE" | "True" => Value::Bool(true),
                "0" | "false" | "FALSE" | "False" => Value::Bool(false),
                _ => Value::String(s),
            },

            // DateTime target
            (v @ Value::DateTime(_), ColumnType::DateTime) => v,
            (Value::Int(i), ColumnType::DateTime) => match Utc.timestamp_opt(i, 0) {
                chrono::LocalResult::Single(dt) => Value::DateTime(dt.fixed_offset()),
                _ => Value::Int(i),
            },
            (Value::String(s), ColumnType::DateTime) => match parse_datetime(&s) {
                Some(dt) => Value::DateTime(dt),
                None => Value::String(s),
            },

            // Blob target: nothing is reinterpreted as raw bytes.
            (v, ColumnType::Blob) => v,

            // No sensible conversion, pass through.
            (v, _) => v,
        }
    }
}

/// Parse the timestamp formats plugins commonly emit: RFC 3339, then a
/// naive `YYYY-MM-DD HH:MM:SS`, then a bare date.
fn parse_datetime(s: &str) -> Option<DateTime<FixedOffset>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt);
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S"))
    {
        return Some(naive.and_utc().fixed_offset());
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(date.and_hms_opt(0, 0, 0)?.and_utc().fixed_offset());
    }
    None
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}
