//! Server configuration.
//!
//! Values come from an optional TOML file, then `SIFT_*` environment variables
//! (e.g. `SIFT_PORT=9000`), then whatever the caller overrides afterwards.

use std::{path::PathBuf, time::Duration};

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::protocol::{DEFAULT_MAX_MESSAGE_SIZE, MAX_MESSAGE_SIZE_LIMIT};

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Connections in the session store pool.
    pub pool_size: usize,
    /// SQLite database file.
    pub database: PathBuf,
    /// Largest accepted message body, in bytes.
    pub max_message_size: usize,
    /// Read timeout for each receive attempt in a connection handler.
    pub poll_interval_ms: u64,
    /// How often a handler flushes its outbound queue.
    pub drain_interval_ms: u64,
    /// Queued messages sent per flush.
    pub drain_batch: usize,
    /// Queued messages kept per client before the oldest are dropped.
    pub outbox_capacity: usize,
    pub acquire_timeout_ms: u64,
    pub accept_poll_ms: u64,
    /// Bounded wait for each handler thread when stopping.
    pub join_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8888,
            pool_size: 5,
            database: PathBuf::from("sift.db"),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            poll_interval_ms: 100,
            drain_interval_ms: 100,
            drain_batch: 10,
            outbox_capacity: 1024,
            acquire_timeout_ms: 5_000,
            accept_poll_ms: 100,
            join_timeout_ms: 2_000,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from `path` (if given) with environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path));
        }
        let settings = builder
            .add_source(Environment::with_prefix("SIFT"))
            .build()?;

        let config: ServerConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(ConfigError::Message(
                "pool_size must be greater than 0".into(),
            ));
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::Message(
                "max_message_size must be greater than 0".into(),
            ));
        }
        if self.max_message_size > MAX_MESSAGE_SIZE_LIMIT {
            return Err(ConfigError::Message(format!(
                "max_message_size must not exceed {MAX_MESSAGE_SIZE_LIMIT} bytes"
            )));
        }
        if self.drain_batch == 0 {
            return Err(ConfigError::Message(
                "drain_batch must be greater than 0".into(),
            ));
        }
        if self.outbox_capacity == 0 {
            return Err(ConfigError::Message(
                "outbox_capacity must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn accept_poll(&self) -> Duration {
        Duration::from_millis(self.accept_poll_ms.max(1))
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempdir::TempDir;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.address(), "127.0.0.1:8888");
    }

    #[test]
    fn load_from_file() {
        let temp = TempDir::new("config").unwrap();
        let path = temp.path().join("sift.toml");
        fs::write(&path, "port = 9100\npool_size = 2\ndrain_batch = 4\n").unwrap();

        let config = ServerConfig::load(path.to_str()).unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.pool_size, 2);
        assert_eq!(config.drain_batch, 4);
        assert_eq!(config.host, "127.0.0.1");
    }

    #[test]
    fn zero_pool_rejected() {
        let config = ServerConfig {
            pool_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn message_size_above_limit_rejected() {
        let config = ServerConfig {
            max_message_size: MAX_MESSAGE_SIZE_LIMIT + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ServerConfig {
            max_message_size: MAX_MESSAGE_SIZE_LIMIT,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}
