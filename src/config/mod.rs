//! Configuration Module
//!
//! TOML-based configuration for the broker core:
//! - Logging level (consumed by the embedding application)
//! - Session parameters (inflight window, retransmission interval)
//! - Storage backend selection (memory, fjall, redis)
//! - Environment variable overrides (POSTMQ_* prefix)

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

#[cfg(test)]
mod tests;

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Session configuration
    pub session: SessionConfig,
    /// Storage backend configuration
    pub storage: StorageConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// QoS 1/2 messages allowed in flight per session before queueing
    #[serde(default = "default_inflight_window")]
    pub inflight_window: usize,
    /// How long an unacked message waits before redelivery
    #[serde(default = "default_retry_interval", with = "humantime_serde")]
    pub retry_interval: Duration,
    /// Outbound channel capacity per connection
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,
}

fn default_inflight_window() -> usize {
    10
}

fn default_retry_interval() -> Duration {
    Duration::from_secs(20)
}

fn default_outbound_capacity() -> usize {
    1024
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inflight_window: default_inflight_window(),
            retry_interval: default_retry_interval(),
            outbound_capacity: default_outbound_capacity(),
        }
    }
}

/// Which storage backend to build at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    /// Volatile; only for non-persistent deployments
    #[default]
    Memory,
    /// Embedded LSM-tree log on the local disk
    Fjall,
    /// Remote key-value store
    Redis,
}

/// Storage backend configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackendKind,
    pub fjall: FjallConfig,
    pub redis: RedisConfig,
}

/// Fjall backend settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FjallConfig {
    /// Keyspace directory
    pub path: PathBuf,
}

impl Default for FjallConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./postmq-data"),
        }
    }
}

/// Redis backend settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Connection URL
    pub url: String,
    /// Prefix applied to every key this broker writes
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "postmq:".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string with environment overrides.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let content = substitute_env_vars(content);

        let config: Config = config::Config::builder()
            .add_source(File::from_str(&content, FileFormat::Toml))
            .add_source(Environment::with_prefix("POSTMQ").separator("__"))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.inflight_window == 0 {
            return Err(ConfigError::Validation(
                "session.inflight_window must be at least 1".to_string(),
            ));
        }
        if self.session.outbound_capacity == 0 {
            return Err(ConfigError::Validation(
                "session.outbound_capacity must be at least 1".to_string(),
            ));
        }
        if self.session.retry_interval.is_zero() {
            return Err(ConfigError::Validation(
                "session.retry_interval must be non-zero".to_string(),
            ));
        }
        if self.storage.backend == StorageBackendKind::Redis && self.storage.redis.url.is_empty() {
            return Err(ConfigError::Validation(
                "storage.redis.url must be set for the redis backend".to_string(),
            ));
        }
        match self.log.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => Ok(()),
            other => Err(ConfigError::Validation(format!(
                "invalid log level: {}",
                other
            ))),
        }
    }
}
