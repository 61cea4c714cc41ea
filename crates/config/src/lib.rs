//! Configuration management for kreplay
//!
//! Values are layered: built-in defaults, then an optional YAML file, then
//! environment variables prefixed with `KREPLAY_` (nested keys split on `__`,
//! e.g. `KREPLAY_KAFKA__BROKERS`). Command-line flags are applied on top by the
//! binary.

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "KREPLAY_";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Main kreplay configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KreplayConfig {
    /// Broker connection settings
    pub kafka: KafkaConfig,

    /// Local offset store settings
    pub store: StoreConfig,

    /// Consumption settings
    pub consumer: ConsumerConfig,

    /// Logging settings
    pub logging: LoggingConfig,
}

impl KreplayConfig {
    /// Load configuration from file and environment
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(KreplayConfig::default()));

        if let Some(path) = config_path {
            if !path.exists() {
                return Err(ConfigError::LoadError(format!(
                    "configuration file {} does not exist",
                    path.display()
                )));
            }
            figment = figment.merge(Yaml::file(path));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: KreplayConfig = figment
            .extract()
            .map_err(|e| ConfigError::LoadError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.kafka.brokers.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one broker address is required".to_string(),
            ));
        }

        if self.consumer.environment.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "environment name must not be empty".to_string(),
            ));
        }

        if self.consumer.channel_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "consumer.channel_capacity must be greater than 0".to_string(),
            ));
        }

        if self.consumer.idle_timeout_secs == Some(0) {
            return Err(ConfigError::ValidationError(
                "consumer.idle_timeout_secs must be greater than 0 when set".to_string(),
            ));
        }

        let auto_create = &self.consumer.auto_create;
        if auto_create.partitions <= 0 || auto_create.replication_factor <= 0 {
            return Err(ConfigError::ValidationError(
                "auto_create partitions and replication_factor must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

/// Broker connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    /// Kafka brokers (comma-separated list)
    pub brokers: String,

    /// Client ID reported to the brokers
    pub client_id: String,

    /// Timeout for metadata and offset lookups in milliseconds
    pub metadata_timeout_ms: u64,

    /// Additional librdkafka properties
    pub extra: HashMap<String, String>,
}

impl KafkaConfig {
    /// Metadata timeout as a duration
    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_millis(self.metadata_timeout_ms)
    }
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            client_id: "kreplay".to_string(),
            metadata_timeout_ms: 10_000,
            extra: HashMap::new(),
        }
    }
}

/// Local offset store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding the offset database
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

/// `$HOME/.kreplay/offsets`, or `.kreplay/offsets` when no home directory is set
fn default_store_path() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_default()
        .join(".kreplay")
        .join("offsets")
}

/// Consumption configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Namespace local offsets are tracked under
    pub environment: String,

    /// Stop cleanly when no message arrives for this many seconds
    pub idle_timeout_secs: Option<u64>,

    /// Upper bound for partition consumers to stop after cancellation
    pub drain_timeout_ms: u64,

    /// Capacity of the merged event channel
    pub channel_capacity: usize,

    /// Topic auto-creation settings
    pub auto_create: AutoCreateConfig,
}

impl ConsumerConfig {
    /// Idle timeout as a duration
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }

    /// Drain timeout as a duration
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            environment: "default".to_string(),
            idle_timeout_secs: None,
            drain_timeout_ms: 5_000,
            channel_capacity: 1_024,
            auto_create: AutoCreateConfig::default(),
        }
    }
}

/// Topic auto-creation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoCreateConfig {
    /// Create missing topics before consuming
    pub enabled: bool,

    /// Partition count for created topics
    pub partitions: i32,

    /// Replication factor for created topics
    pub replication_factor: i32,
}

impl Default for AutoCreateConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            partitions: 1,
            replication_factor: 1,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or filter directive
    pub level: String,

    /// Enable structured JSON logging
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            json: false,
        }
    }
}
