//! SQLite backend

use super::value::{QueryResult, Row, Value};
use super::{Connection, Connector, Control};
use crate::error::DbError;
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{ErrorCode, ToSql};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            Value::Integer(v) => ToSqlOutput::Borrowed(ValueRef::Integer(*v)),
            Value::Real(v) => ToSqlOutput::Borrowed(ValueRef::Real(*v)),
            Value::Text(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
            Value::Blob(v) => ToSqlOutput::Borrowed(ValueRef::Blob(v.as_slice())),
        })
    }
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(v) => Value::Integer(v),
        ValueRef::Real(v) => Value::Real(v),
        ValueRef::Text(v) => Value::Text(String::from_utf8_lossy(v).into_owned()),
        ValueRef::Blob(v) => Value::Blob(v.to_vec()),
    }
}

fn map_error(e: rusqlite::Error) -> DbError {
    match e.sqlite_error_code() {
        Some(ErrorCode::ConstraintViolation) => DbError::Constraint(e.to_string()),
        Some(
            ErrorCode::CannotOpen
            | ErrorCode::SystemIoFailure
            | ErrorCode::NotADatabase
            | ErrorCode::DatabaseCorrupt,
        ) => DbError::ConnectionLost(e.to_string()),
        _ => DbError::Statement(e.to_string()),
    }
}

/// Opens SQLite connections on one database file.
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    path: PathBuf,
    busy_timeout: Duration,
    schema: Option<String>,
}

impl SqliteConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout: Duration::from_secs(5),
            schema: None,
        }
    }

    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Idempotent DDL run on every new connection, before statements are
    /// prepared against it.
    pub fn schema(mut self, sql: impl Into<String>) -> Self {
        self.schema = Some(sql.into());
        self
    }
}

impl Connector for SqliteConnector {
    type Connection = SqliteConnection;

    fn connect(&self) -> Result<SqliteConnection, DbError> {
        let conn = rusqlite::Connection::open(&self.path).map_err(|e| DbError::ConnectionLost(e.to_string()))?;
        conn.busy_timeout(self.busy_timeout).map_err(map_error)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(map_error)?;
        conn.pragma_update(None, "foreign_keys", "ON").map_err(map_error)?;
        if let Some(schema) = &self.schema {
            conn.execute_batch(schema).map_err(map_error)?;
        }
        conn.set_prepared_statement_cache_capacity(64);
        Ok(SqliteConnection {
            conn,
            statements: HashMap::new(),
        })
    }
}

pub struct SqliteConnection {
    conn: rusqlite::Connection,
    statements: HashMap<String, String>,
}

impl Connection for SqliteConnection {
    fn prepare(&mut self, name: &str, sql: &str) -> Result<(), DbError> {
        self.conn.prepare_cached(sql).map_err(map_error)?;
        self.statements.insert(name.to_string(), sql.to_string());
        Ok(())
    }

    fn execute(&mut self, name: &str, params: &[Value]) -> Result<QueryResult, DbError> {
        let sql = self
            .statements
            .get(name)
            .ok_or_else(|| DbError::UnknownStatement(name.to_string()))?;
        let mut stmt = self.conn.prepare_cached(sql).map_err(map_error)?;
        let columns: Arc<[String]> = stmt
            .column_names()
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>()
            .into();

        let mut result = QueryResult::empty();
        if columns.is_empty() {
            result.affected = stmt.execute(rusqlite::params_from_iter(params)).map_err(map_error)? as u64;
        } else {
            let mut rows = stmt.query(rusqlite::params_from_iter(params)).map_err(map_error)?;
            while let Some(row) = rows.next().map_err(map_error)? {
                let values = (0..columns.len())
                    .map(|i| row.get_ref(i).map(from_sql))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(map_error)?;
                result.rows.push(Row::new(Arc::clone(&columns), values));
            }
        }
        result.columns = columns;
        result.last_insert_id = self.conn.last_insert_rowid();
        Ok(result)
    }

    fn control(&mut self, control: Control) -> Result<QueryResult, DbError> {
        let sql = match control {
            Control::Begin => "BEGIN IMMEDIATE",
            Control::Commit => "COMMIT",
            Control::Rollback => "ROLLBACK",
        };
        self.conn.execute_batch(sql).map_err(map_error)?;
        Ok(QueryResult::empty())
    }

    fn ping(&mut self) -> bool {
        self.conn
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS items (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        weight REAL
    );";

    fn open(dir: &tempfile::TempDir) -> SqliteConnection {
        let mut conn = SqliteConnector::new(dir.path().join("test.db"))
            .schema(SCHEMA)
            .connect()
            .unwrap();
        conn.prepare("insert", "INSERT INTO items (name, weight) VALUES (?1, ?2)")
            .unwrap();
        conn.prepare("by_name", "SELECT id, name, weight FROM items WHERE name = ?1")
            .unwrap();
        conn
    }

    #[test]
    fn test_insert_and_select() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = open(&dir);

        let inserted = conn
            .execute("insert", &[Value::from("anchor"), Value::Real(2.5)])
            .unwrap();
        assert_eq!(inserted.affected, 1);
        assert_eq!(inserted.last_insert_id, 1);

        let selected = conn.execute("by_name", &[Value::from("anchor")]).unwrap();
        let row = selected.first().unwrap();
        assert_eq!(row.integer("id").unwrap(), 1);
        assert_eq!(row.text("name").unwrap(), "anchor");
        assert_eq!(row.real("weight").unwrap(), 2.5);
    }

    #[test]
    fn test_unique_violation_maps_to_constraint() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = open(&dir);
        conn.execute("insert", &[Value::from("anchor"), Value::Null]).unwrap();
        let err = conn
            .execute("insert", &[Value::from("anchor"), Value::Null])
            .unwrap_err();
        assert!(matches!(err, DbError::Constraint(_)), "{:?}", err);
    }

    #[test]
    fn test_unprepared_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = open(&dir);
        assert_eq!(
            conn.execute("drop_everything", &[]).unwrap_err(),
            DbError::UnknownStatement("drop_everything".to_string())
        );
    }

    #[test]
    fn test_bad_sql_fails_to_prepare() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = open(&dir);
        assert!(conn.prepare("broken", "SELEC nothing").is_err());
        assert!(conn.ping());
    }

    #[test]
    fn test_rollback_discards_changes() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = open(&dir);
        conn.control(Control::Begin).unwrap();
        conn.execute("insert", &[Value::from("ghost"), Value::Null]).unwrap();
        conn.control(Control::Rollback).unwrap();
        let selected = conn.execute("by_name", &[Value::from("ghost")]).unwrap();
        assert!(selected.rows.is_empty());
    }
}
