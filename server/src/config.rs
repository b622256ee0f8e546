//! Server configuration
//!
//! Values come from three layers: built-in defaults, an optional TOML file,
//! then command-line overrides applied by the binary.

use crate::error::ConfigError;
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Simulation updates per second
    pub tick_rate: u32,
    pub max_peers: usize,
    /// First peer id handed out by the reactor
    pub peer_base_id: u32,
    pub max_entities: usize,
    pub database: DatabaseSection,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    pub path: PathBuf,
    pub workers: usize,
    pub queue_capacity: usize,
    pub reconnect_backoff_ms: u64,
    /// How long startup waits for every worker to connect
    pub startup_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            tick_rate: 30,
            max_peers: 64,
            peer_base_id: 0,
            max_entities: 4096,
            database: DatabaseSection::default(),
        }
    }
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("armada.db"),
            workers: 2,
            queue_capacity: 1024,
            reconnect_backoff_ms: 1000,
            startup_timeout_ms: 10_000,
        }
    }
}

impl ServerConfig {
    /// Parses a TOML document; missing keys keep their defaults.
    pub fn from_toml(text: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text, path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_rate == 0 || self.tick_rate > 1000 {
            return Err(ConfigError::Invalid(format!(
                "tick_rate must be between 1 and 1000, got {}",
                self.tick_rate
            )));
        }
        if self.max_peers == 0 {
            return Err(ConfigError::Invalid("max_peers must be positive".to_string()));
        }
        if u64::from(self.peer_base_id) + self.max_peers as u64 > u64::from(u32::MAX) {
            return Err(ConfigError::Invalid(format!(
                "peer ids {}..{} overflow",
                self.peer_base_id,
                u64::from(self.peer_base_id) + self.max_peers as u64
            )));
        }
        if self.max_entities == 0 || self.max_entities > shared::protocol::MAX_BATCH_ENTRIES {
            return Err(ConfigError::Invalid(format!(
                "max_entities must be between 1 and {}",
                shared::protocol::MAX_BATCH_ENTRIES
            )));
        }
        if self.database.workers == 0 {
            return Err(ConfigError::Invalid("database.workers must be positive".to_string()));
        }
        if self.database.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "database.queue_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let address = format!("{}:{}", self.host, self.port);
        address
            .to_socket_addrs()
            .map_err(|e| ConfigError::Invalid(format!("cannot resolve {}: {}", address, e)))?
            .next()
            .ok_or_else(|| ConfigError::Invalid(format!("{} resolves to nothing", address)))
    }

    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.tick_rate.max(1)))
    }
}

impl DatabaseSection {
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.bind_addr().unwrap(), "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.tick_duration(), Duration::from_secs_f64(1.0 / 30.0));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let text = r#"
            port = 9000
            tick_rate = 60

            [database]
            path = "/tmp/fleet.db"
            workers = 4
        "#;
        let config = ServerConfig::from_toml(text, Path::new("server.toml")).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.tick_rate, 60);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.database.workers, 4);
        assert_eq!(config.database.path, PathBuf::from("/tmp/fleet.db"));
        assert_eq!(config.database.reconnect_backoff(), Duration::from_secs(1));
    }

    #[test]
    fn test_load_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_peers = 8").unwrap();
        let config = ServerConfig::load(file.path()).unwrap();
        assert_eq!(config.max_peers, 8);
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = ServerConfig::load(Path::new("/nonexistent/armada.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(err.to_string().contains("/nonexistent/armada.toml"));
    }

    #[test]
    fn test_malformed_file_rejected() {
        let err = ServerConfig::from_toml("port = \"eighty\"", Path::new("bad.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_validation() {
        let mut config = ServerConfig::default();
        config.tick_rate = 0;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.peer_base_id = u32::MAX - 4;
        config.max_peers = 8;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.database.workers = 0;
        assert!(config.validate().is_err());
    }
}
