//! CLI error types

use consumer::error::{BrokerError, CheckpointError, ConsumerError, StoreError};
use kreplay_config::ConfigError;
use thiserror::Error;

/// Result type for CLI operations
pub type CliResult<T> = std::result::Result<T, CliError>;

/// Errors surfaced by kreplay commands
#[derive(Error, Debug)]
pub enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Consumer(#[from] ConsumerError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    OperationFailed(String),
}
