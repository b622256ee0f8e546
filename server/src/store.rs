//! Persistent schema and the statements the game runs against it

use crate::credentials::HashedPassword;
use crate::database::{QueryResult, Row, SqliteConnector, StatementRegistry, Transaction, Value};
use crate::error::DbError;
use crate::world::Prefab;
use std::path::Path;

pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS prefabs (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    mass REAL NOT NULL,
    max_thrust REAL NOT NULL
);
INSERT OR IGNORE INTO prefabs (id, name, mass, max_thrust) VALUES
    (1, 'shuttle', 10.0, 50.0),
    (2, 'corvette', 40.0, 160.0),
    (3, 'frigate', 120.0, 400.0);
CREATE TABLE IF NOT EXISTS accounts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    salt TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS fleets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
    name TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS spaceships (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    fleet_id INTEGER NOT NULL REFERENCES fleets(id) ON DELETE CASCADE,
    prefab_id INTEGER NOT NULL REFERENCES prefabs(id),
    name TEXT NOT NULL
);
";

pub const ACCOUNT_BY_NAME: &str = "account_by_name";
pub const INSERT_ACCOUNT: &str = "insert_account";
pub const INSERT_FLEET: &str = "insert_fleet";
pub const INSERT_SPACESHIP: &str = "insert_spaceship";
pub const SELECT_PREFABS: &str = "select_prefabs";

/// Prefab every new account starts with.
pub const STARTER_PREFAB: u32 = 1;

pub fn statements() -> StatementRegistry {
    StatementRegistry::new()
        .register(
            ACCOUNT_BY_NAME,
            "SELECT a.id AS account_id, a.password_hash, a.salt, s.prefab_id
             FROM accounts a
             LEFT JOIN fleets f ON f.account_id = a.id
             LEFT JOIN spaceships s ON s.fleet_id = f.id
             WHERE a.username = ?1
             ORDER BY s.id
             LIMIT 1",
        )
        .register(
            INSERT_ACCOUNT,
            "INSERT INTO accounts (username, password_hash, salt) VALUES (?1, ?2, ?3)",
        )
        .register(INSERT_FLEET, "INSERT INTO fleets (account_id, name) VALUES (?1, ?2)")
        .register(
            INSERT_SPACESHIP,
            "INSERT INTO spaceships (fleet_id, prefab_id, name) VALUES (?1, ?2, ?3)",
        )
        .register(
            SELECT_PREFABS,
            "SELECT id, name, mass, max_thrust FROM prefabs ORDER BY id",
        )
}

pub fn connector(path: &Path) -> SqliteConnector {
    SqliteConnector::new(path).schema(SCHEMA)
}

/// Login lookup row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRecord {
    pub account_id: u64,
    pub password_hash: String,
    pub salt: String,
    /// Prefab of the account's first ship, if it has one
    pub prefab_id: Option<u32>,
}

impl AccountRecord {
    pub fn from_row(row: &Row) -> Result<Self, DbError> {
        let prefab_id = row
            .optional_integer("prefab_id")?
            .map(|id| u32::try_from(id).map_err(|_| DbError::Statement(format!("prefab id {} out of range", id))))
            .transpose()?;
        Ok(Self {
            account_id: row.integer("account_id")? as u64,
            password_hash: row.text("password_hash")?.to_string(),
            salt: row.text("salt")?.to_string(),
            prefab_id,
        })
    }
}

/// Account, fleet and starter ship, created atomically. Each insert's hook
/// feeds the new row id into the next statement.
pub fn create_account(username: &str, password: &HashedPassword) -> Transaction {
    let fleet_name = format!("{}'s fleet", username);
    let ship_name = format!("{}'s shuttle", username);
    Transaction::new().statement_with_hook(
        INSERT_ACCOUNT,
        vec![
            Value::from(username),
            Value::from(password.hash.as_str()),
            Value::from(password.salt.as_str()),
        ],
        move |account, plan| {
            let ship_name = ship_name.clone();
            plan.push_with_hook(
                INSERT_FLEET,
                vec![Value::Integer(account.last_insert_id), Value::from(fleet_name.as_str())],
                move |fleet, plan| {
                    plan.push(
                        INSERT_SPACESHIP,
                        vec![
                            Value::Integer(fleet.last_insert_id),
                            Value::from(STARTER_PREFAB),
                            Value::from(ship_name.as_str()),
                        ],
                    );
                    Ok(())
                },
            );
            Ok(())
        },
    )
}

pub fn parse_prefabs(result: &QueryResult) -> Result<Vec<Prefab>, DbError> {
    if let Some(error) = &result.error {
        return Err(error.clone());
    }
    result
        .rows
        .iter()
        .map(|row| {
            let id = row.integer("id")?;
            Ok(Prefab {
                id: u32::try_from(id).map_err(|_| DbError::Statement(format!("prefab id {} out of range", id)))?,
                name: row.text("name")?.to_string(),
                mass: row.real("mass")? as f32,
                max_thrust: row.real("max_thrust")? as f32,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::hash_password;
    use crate::database::{run_transaction, Connection, Connector};

    fn open(dir: &tempfile::TempDir) -> impl Connection {
        let mut conn = connector(&dir.path().join("armada.db")).connect().unwrap();
        for (name, sql) in statements().iter() {
            conn.prepare(name, sql).unwrap();
        }
        conn
    }

    #[test]
    fn test_schema_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let _first = open(&dir);
        let mut second = open(&dir);
        let prefabs = parse_prefabs(&second.execute(SELECT_PREFABS, &[]).unwrap()).unwrap();
        assert_eq!(prefabs.len(), 3);
        assert_eq!(prefabs[0].name, "shuttle");
    }

    #[test]
    fn test_create_account_chain() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = open(&dir);
        let password = hash_password("pw");

        let result = run_transaction(&mut conn, &create_account("ada", &password)).unwrap();
        assert!(result.committed);
        // BEGIN, three inserts, COMMIT
        assert_eq!(result.results.len(), 5);

        let lookup = conn.execute(ACCOUNT_BY_NAME, &[Value::from("ada")]).unwrap();
        let record = AccountRecord::from_row(lookup.first().unwrap()).unwrap();
        assert_eq!(record.prefab_id, Some(STARTER_PREFAB));
        assert_eq!(record.password_hash, password.hash);
    }

    #[test]
    fn test_duplicate_name_is_constraint_at_first_statement() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = open(&dir);
        let password = hash_password("pw");
        run_transaction(&mut conn, &create_account("ada", &password)).unwrap();

        let again = run_transaction(&mut conn, &create_account("ada", &password)).unwrap();
        assert!(!again.committed);
        assert_eq!(again.failed_at(), Some(1));
        assert!(matches!(again.error(), Some(DbError::Constraint(_))));
    }

    #[test]
    fn test_unknown_account_has_no_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = open(&dir);
        let lookup = conn.execute(ACCOUNT_BY_NAME, &[Value::from("nobody")]).unwrap();
        assert!(lookup.rows.is_empty());
    }
}
