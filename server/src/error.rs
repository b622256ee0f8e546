//! Error types for the server crate

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

/// Failure to bring up a transport endpoint. Fatal at construction.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind UDP endpoint {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to configure UDP endpoint: {0}")]
    Socket(#[source] io::Error),

    #[error("failed to start reactor thread: {0}")]
    Thread(#[source] io::Error),

    #[error("invalid address {0}")]
    Address(String),

    #[error("peer slot range {base}..{base}+{max_peers} overflows the peer id space")]
    IdRange { base: u32, max_peers: usize },
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Startup failures of the server binary.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] shared::command::RegistryError),

    #[error(transparent)]
    Database(#[from] DbError),

    #[error("database startup failed: {0}")]
    Startup(String),
}

/// Database pipeline errors. Carried inside results, so they are cloneable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DbError {
    #[error("database connection lost: {0}")]
    ConnectionLost(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("statement failed: {0}")]
    Statement(String),

    #[error("unknown statement {0}")]
    UnknownStatement(String),

    #[error("no column named {0}")]
    MissingColumn(String),

    #[error("column {column} holds {found}, expected {expected}")]
    ColumnType {
        column: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("transaction hook failed: {0}")]
    Hook(String),

    #[error("database request queue is full")]
    Overloaded,

    #[error("database pipeline stopped")]
    Stopped,

    #[error("failed to start database worker: {0}")]
    Spawn(String),
}
