//! Value types for duraconn
//!
//! The scalar model is deliberately small: every backend value is narrowed
//! to one of seven shapes so cached row sets serialize losslessly and
//! compare cheaply. Temporal values arrive as text in the backend's
//! canonical rendering.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// SQL value type for binds and result columns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// SQL NULL
    Null,
    /// Boolean value
    Bool(bool),
    /// 64-bit signed integer
    Int(i64),
    /// 64-bit unsigned integer
    UInt(u64),
    /// 64-bit floating point
    Float(f64),
    /// Text string
    Text(String),
    /// Binary data
    Bytes(Vec<u8>),
}

impl Value {
    /// The marker inlined as a SQL keyword instead of being bound
    pub fn current_timestamp() -> Self {
        Self::Text("current_timestamp".to_string())
    }

    /// The marker inlined as a SQL keyword instead of being bound
    pub fn current_date() -> Self {
        Self::Text("current_date".to_string())
    }

    /// Check if value is NULL
    #[inline]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// If this value is a server-side time keyword marker, return the
    /// keyword text to inline. Any text starting with `current_timestamp`
    /// qualifies (so `current_timestamp(6)` passes through verbatim);
    /// `current_date` must match exactly.
    pub fn as_sql_keyword(&self) -> Option<&str> {
        match self {
            Self::Text(s) if s.starts_with("current_timestamp") || s == "current_date" => {
                Some(s.as_str())
            }
            _ => None,
        }
    }

    /// Try to convert to bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Int(n) => Some(*n != 0),
            Self::UInt(n) => Some(*n != 0),
            _ => None,
        }
    }

    /// Try to convert to i64; numeric text coerces
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            Self::UInt(n) => i64::try_from(*n).ok(),
            Self::Bool(b) => Some(i64::from(*b)),
            Self::Float(n) => {
                if n.is_finite() {
                    Some(*n as i64)
                } else {
                    None
                }
            }
            Self::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Try to convert to u64; numeric text coerces
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::UInt(n) => Some(*n),
            Self::Int(n) => u64::try_from(*n).ok(),
            Self::Bool(b) => Some(u64::from(*b)),
            Self::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Try to convert to f64; numeric text coerces
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(n) => Some(*n),
            Self::Int(n) => Some(*n as f64),
            Self::UInt(n) => Some(*n as f64),
            Self::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Try to convert to string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Try to convert to bytes
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b.as_slice()),
            Self::Text(s) => Some(s.as_bytes()),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(n) => write!(f, "{n}"),
            Self::UInt(n) => write!(f, "{n}"),
            Self::Float(n) => write!(f, "{n}"),
            Self::Text(s) => write!(f, "{s}"),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::UInt(u64::from(v))
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Self::UInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => Self::Null,
        }
    }
}

/// Database row as ordered column values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// Column names
    columns: Vec<String>,
    /// Column values (same order as columns)
    values: Vec<Value>,
}

impl Row {
    /// Create a new row
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    /// Get column count
    #[inline]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Check if row is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Get column names
    #[inline]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Get all values
    #[inline]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Get value by column index
    #[inline]
    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// Get value by column name (case-insensitive)
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .and_then(|idx| self.values.get(idx))
    }

    /// Convert row to HashMap
    pub fn into_map(self) -> HashMap<String, Value> {
        self.columns.into_iter().zip(self.values).collect()
    }
}

/// Result of a single executed statement
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    /// A read statement with its (possibly empty) result set
    Rows(Vec<Row>),
    /// A write statement that executed successfully
    Write,
}

impl QueryOutcome {
    /// Result rows; a write yields an empty slice
    pub fn rows(&self) -> &[Row] {
        match self {
            Self::Rows(rows) => rows.as_slice(),
            Self::Write => &[],
        }
    }

    /// Consume into the result rows; a write yields an empty vec
    pub fn into_rows(self) -> Vec<Row> {
        match self {
            Self::Rows(rows) => rows,
            Self::Write => Vec::new(),
        }
    }

    /// Whether the statement was classified as a write
    #[inline]
    pub fn is_write(&self) -> bool {
        matches!(self, Self::Write)
    }
}

/// Split a packed string column into rows and columns.
///
/// Server-side aggregation (e.g. `group_concat`) often packs several
/// logical rows into one text value; this unpacks them.
///
/// ```
/// use duraconn::types::dissociate;
///
/// let rows = dissociate("1^2^3`4^5^6", "`", "^");
/// assert_eq!(rows, vec![vec!["1", "2", "3"], vec!["4", "5", "6"]]);
/// ```
pub fn dissociate(data: &str, row_delim: &str, column_delim: &str) -> Vec<Vec<String>> {
    data.split(row_delim)
        .map(|row| row.split(column_delim).map(str::to_string).collect())
        .collect()
}

/// Like [`dissociate`], but key each row on its first column.
pub fn dissociate_keyed(
    data: &str,
    row_delim: &str,
    column_delim: &str,
) -> HashMap<String, Vec<String>> {
    let mut results = HashMap::new();
    for row in data.split(row_delim) {
        let mut columns = row.split(column_delim).map(str::to_string);
        if let Some(key) = columns.next() {
            results.insert(key, columns.collect());
        }
    }
    results
}
