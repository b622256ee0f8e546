//! Values, rows and query results exchanged with database workers

use crate::error::DbError;
use std::sync::Arc;

/// A single SQL value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Integer(_) => "integer",
            Value::Real(_) => "real",
            Value::Text(_) => "text",
            Value::Blob(_) => "blob",
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// One result row. Accessors fail instead of guessing on malformed rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get(&self, column: &str) -> Result<&Value, DbError> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))
            .ok_or_else(|| DbError::MissingColumn(column.to_string()))
    }

    fn mismatch(column: &str, expected: &'static str, found: &Value) -> DbError {
        DbError::ColumnType {
            column: column.to_string(),
            expected,
            found: found.type_name(),
        }
    }

    pub fn integer(&self, column: &str) -> Result<i64, DbError> {
        match self.get(column)? {
            Value::Integer(v) => Ok(*v),
            other => Err(Self::mismatch(column, "integer", other)),
        }
    }

    pub fn optional_integer(&self, column: &str) -> Result<Option<i64>, DbError> {
        match self.get(column)? {
            Value::Null => Ok(None),
            Value::Integer(v) => Ok(Some(*v)),
            other => Err(Self::mismatch(column, "integer", other)),
        }
    }

    /// Accepts integers too, since SQLite may store whole reals as integers.
    pub fn real(&self, column: &str) -> Result<f64, DbError> {
        match self.get(column)? {
            Value::Real(v) => Ok(*v),
            Value::Integer(v) => Ok(*v as f64),
            other => Err(Self::mismatch(column, "real", other)),
        }
    }

    pub fn text(&self, column: &str) -> Result<&str, DbError> {
        match self.get(column)? {
            Value::Text(v) => Ok(v),
            other => Err(Self::mismatch(column, "text", other)),
        }
    }

    pub fn blob(&self, column: &str) -> Result<&[u8], DbError> {
        match self.get(column)? {
            Value::Blob(v) => Ok(v),
            other => Err(Self::mismatch(column, "blob", other)),
        }
    }
}

/// Outcome of one statement. Invalid when `error` is set.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub columns: Arc<[String]>,
    pub rows: Vec<Row>,
    pub affected: u64,
    pub last_insert_id: i64,
    pub error: Option<DbError>,
}

impl QueryResult {
    pub fn empty() -> Self {
        Self {
            columns: Arc::from(Vec::new()),
            rows: Vec::new(),
            affected: 0,
            last_insert_id: 0,
            error: None,
        }
    }

    pub fn failed(error: DbError) -> Self {
        Self {
            error: Some(error),
            ..Self::empty()
        }
    }

    pub fn is_valid(&self) -> bool {
        self.error.is_none()
    }

    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }
}
