//! Query result types for querymux.
//!
//! Defines the page, column and value structures connectors produce.

use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Largest integer magnitude a JSON consumer backed by IEEE doubles can hold
/// exactly (2^53 - 1).
pub const MAX_SAFE_INTEGER: i64 = 9_007_199_254_740_991;

/// One page of results produced by a connector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPage {
    /// Column metadata, present on the first page that knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<ColumnDef>>,

    /// Rows of data.
    #[serde(default)]
    pub data: Vec<Row>,

    /// Present when more pages are expected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,

    /// Backend-reported progress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<PageStats>,
}

impl QueryPage {
    /// Creates a page with the given rows.
    pub fn new(data: Vec<Row>) -> Self {
        Self {
            data,
            ..Default::default()
        }
    }

    /// Sets the column metadata.
    pub fn with_columns(mut self, columns: Vec<ColumnDef>) -> Self {
        self.columns = Some(columns);
        self
    }

    /// Marks the page as non-terminal.
    pub fn with_next_token(mut self, token: impl Into<String>) -> Self {
        self.next_token = Some(token.into());
        self
    }

    /// Sets the page statistics.
    pub fn with_stats(mut self, stats: PageStats) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Returns true if no further pages follow this one.
    pub fn is_terminal(&self) -> bool {
        self.next_token.is_none()
    }
}

/// Progress statistics attached to a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageStats {
    /// Backend execution state (e.g. "RUNNING", "FINISHED").
    pub state: String,

    /// Rows produced so far, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
}

impl PageStats {
    pub fn new(state: impl Into<String>, row_count: Option<u64>) -> Self {
        Self {
            state: state.into(),
            row_count,
        }
    }
}

/// Metadata about a column in a result set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,

    /// Backend-reported or inferred type, a display hint only.
    #[serde(rename = "type")]
    pub data_type: String,
}

impl ColumnDef {
    /// Creates a new column with the given name and type.
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// A row of data from a query result.
pub type Row = Vec<Value>;

/// Represents a single value from a database query.
///
/// Serialized untagged, so a row goes over the wire as a plain JSON array.
/// Binary values are encoded as base64 strings.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Value {
    /// NULL value.
    #[default]
    Null,

    /// Boolean value.
    Bool(bool),

    /// Signed integer (up to i64).
    Int(i64),

    /// Floating point number.
    Float(f64),

    /// Text value, also used for integers too wide for JSON doubles.
    String(String),

    /// Binary data.
    Bytes(Vec<u8>),
}

impl Value {
    /// Returns true if this value is NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Converts a JSON value into a cell value.
    ///
    /// Integers outside ±(2^53 - 1) become decimal strings so no consumer
    /// rounds them. This holds past the u64 range because serde_json keeps
    /// the literal text of every number. Arrays and objects are kept as their JSON text.
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    if (-MAX_SAFE_INTEGER..=MAX_SAFE_INTEGER).contains(&i) {
                        Value::Int(i)
                    } else {
                        Value::String(i.to_string())
                    }
                } else if let Some(u) = n.as_u64() {
                    Value::String(u.to_string())
                } else {
                    // Number text is kept verbatim, so wider literals survive.
                    let text = n.to_string();
                    if is_integer_literal(&text) {
                        Value::String(text)
                    } else {
                        n.as_f64().map(Value::Float).unwrap_or(Value::Null)
                    }
                }
            }
            serde_json::Value::String(s) => Value::String(s.clone()),
            other => Value::String(other.to_string()),
        }
    }

    /// Infers a value from a text cell (CSV output, delimited files).
    ///
    /// Empty cells are NULL.
    pub fn infer(text: &str) -> Self {
        if text.is_empty() {
            return Value::Null;
        }
        if let Ok(i) = text.parse::<i64>() {
            return if (-MAX_SAFE_INTEGER..=MAX_SAFE_INTEGER).contains(&i) {
                Value::Int(i)
            } else {
                Value::String(text.to_string())
            };
        }
        if is_integer_literal(text) {
            return Value::String(text.to_string());
        }
        if looks_like_decimal(text) {
            if let Ok(f) = text.parse::<f64>() {
                return Value::Float(f);
            }
        }
        match text {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::String(text.to_string()),
        }
    }

    /// Returns a display type name for inferred columns.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Float(_) => "double",
            Value::String(_) => "varchar",
            Value::Bytes(_) => "blob",
        }
    }

    /// Attempts to convert the value to a string representation.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::String(s) => s.clone(),
            Value::Bytes(b) => format!("<{} bytes>", b.len()),
        }
    }
}

/// An optionally signed run of digits.
fn is_integer_literal(text: &str) -> bool {
    let digits = text.strip_prefix(['-', '+']).unwrap_or(text);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

/// Rejects strings `f64::from_str` accepts but that are not numbers in a
/// data file ("inf", "NaN").
fn looks_like_decimal(text: &str) -> bool {
    text.bytes()
        .all(|b| b.is_ascii_digit() || matches!(b, b'.' | b'-' | b'+' | b'e' | b'E'))
        && text.bytes().any(|b| b.is_ascii_digit())
}

/// Infers display types for each column from the first non-null value.
pub fn infer_column_types(names: &[String], rows: &[Row]) -> Vec<ColumnDef> {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let data_type = rows
                .iter()
                .filter_map(|row| row.get(i))
                .find(|v| !v.is_null())
                .map(Value::type_name)
                .unwrap_or("varchar");
            ColumnDef::new(name.clone(), data_type)
        })
        .collect()
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_display_string())
    }
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::String(s) => serializer.serialize_str(s),
            Value::Bytes(b) => {
                serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(b))
            }
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let json = serde_json::Value::deserialize(deserializer)?;
        Ok(Value::from_json(&json))
    }
}

// Conversion implementations for common types
impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
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

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl<T> From<Option<T>> for Value
where
    T: Into<Value>,
{
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => Value::Null,
        }
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}
