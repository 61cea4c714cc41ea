//! Error types for checkpoint resolution, broker access and offset storage.

use std::fmt;
use thiserror::Error;

/// Result type for checkpoint parsing and validation.
pub type CheckpointResult<T> = std::result::Result<T, CheckpointError>;

/// Result type for broker operations.
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// Result type for local offset store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result type for consumer operations.
pub type ConsumerResult<T> = std::result::Result<T, ConsumerError>;

/// Errors raised while turning checkpoint expressions into checkpoints.
///
/// All of these are startup errors: they are reported before any partition
/// consumer is spawned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CheckpointError {
    /// The expression matches no keyword, offset or timestamp layout
    #[error("invalid checkpoint '{input}': {reason}")]
    Parse { input: String, reason: String },

    /// The expression is valid as a start position but cannot end consumption
    #[error("'{input}' is not an acceptable stop condition")]
    NotAStopCondition { input: String },

    /// The `partition#` prefix is not a non-negative partition number
    #[error("invalid partition '{input}' in checkpoint expression")]
    InvalidPartition { input: String },

    /// A start/stop pair is inconsistent
    #[error("invalid checkpoint range for {scope}: {message}")]
    Validation { scope: String, message: String },
}

impl CheckpointError {
    /// Create a parse error.
    pub fn parse(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Parse {
            input: input.into(),
            reason: reason.into(),
        }
    }

    /// Create a validation error.
    pub fn validation(scope: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            scope: scope.into(),
            message: message.into(),
        }
    }
}

/// Errors surfaced by a [`BrokerClient`](crate::broker::BrokerClient).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The topic does not exist on the cluster
    #[error("topic '{topic}' does not exist")]
    TopicNotFound { topic: String },

    /// The partition does not exist within the topic
    #[error("partition {partition} of topic '{topic}' does not exist")]
    PartitionNotFound { topic: String, partition: i32 },

    /// Transport-level failure talking to the brokers
    #[error("broker communication error: {message}")]
    Communication { message: String },

    /// The client could not be configured or created
    #[error("invalid broker client configuration: {message}")]
    Configuration { message: String },

    /// A broker request did not complete in time
    #[error("operation timed out after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Any other client error
    #[error("broker client error: {message}")]
    Client {
        message: String,
        code: Option<String>,
    },
}

impl BrokerError {
    /// Create a topic not found error.
    pub fn topic_not_found(topic: impl Into<String>) -> Self {
        Self::TopicNotFound {
            topic: topic.into(),
        }
    }

    /// Create a partition not found error.
    pub fn partition_not_found(topic: impl Into<String>, partition: i32) -> Self {
        Self::PartitionNotFound {
            topic: topic.into(),
            partition,
        }
    }

    /// Create a communication error.
    pub fn communication(message: impl Into<String>) -> Self {
        Self::Communication {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a generic client error.
    pub fn client(message: impl Into<String>, code: Option<String>) -> Self {
        Self::Client {
            message: message.into(),
            code,
        }
    }

    /// Check if the failed operation may succeed when retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BrokerError::Communication { .. } | BrokerError::Timeout { .. }
        )
    }

    /// Check if the error means the topic or partition does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            BrokerError::TopicNotFound { .. } | BrokerError::PartitionNotFound { .. }
        )
    }
}

impl From<rdkafka::error::KafkaError> for BrokerError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        use rdkafka::error::KafkaError as RdKafkaError;
        use rdkafka::types::RDKafkaErrorCode;

        if let RdKafkaError::ClientConfig(..) | RdKafkaError::ClientCreation(_) = err {
            return BrokerError::configuration(err.to_string());
        }

        match err.rdkafka_error_code() {
            Some(RDKafkaErrorCode::OperationTimedOut) | Some(RDKafkaErrorCode::RequestTimedOut) => {
                BrokerError::timeout(err.to_string(), 0)
            }
            Some(
                RDKafkaErrorCode::BrokerTransportFailure
                | RDKafkaErrorCode::AllBrokersDown
                | RDKafkaErrorCode::NetworkException
                | RDKafkaErrorCode::LeaderNotAvailable
                | RDKafkaErrorCode::NotLeaderForPartition,
            ) => BrokerError::communication(err.to_string()),
            code => BrokerError::client(err.to_string(), code.map(|c| format!("{:?}", c))),
        }
    }
}

/// Errors raised by the local offset store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The storage backend failed
    #[error("offset store backend error ({backend}): {details}")]
    Backend { backend: String, details: String },

    /// A stored record could not be encoded or decoded
    #[error("offset record serialization error: {details}")]
    Serialization { details: String },

    /// A list filter is not a valid regular expression
    #[error("invalid filter '{pattern}': {details}")]
    InvalidFilter { pattern: String, details: String },
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::Backend {
            backend: "sled".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        StoreError::Serialization {
            details: err.to_string(),
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Backend {
            backend: "filesystem".to_string(),
            details: err.to_string(),
        }
    }
}

/// Top-level error for consumer operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsumerError {
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("no topics requested")]
    NoTopics,

    #[error("orchestrator has already been started")]
    AlreadyStarted,

    #[error("{0}")]
    Supervisor(String),
}

/// A runtime failure attributed to one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionError {
    pub topic: String,
    pub partition: i32,
    pub error: ConsumerError,
}

impl PartitionError {
    pub fn new(topic: impl Into<String>, partition: i32, error: impl Into<ConsumerError>) -> Self {
        Self {
            topic: topic.into(),
            partition,
            error: error.into(),
        }
    }
}

impl fmt::Display for PartitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}: {}", self.topic, self.partition, self.error)
    }
}

impl std::error::Error for PartitionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}
