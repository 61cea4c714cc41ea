//! Partition addressing types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Represents a topic-partition pair
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct TopicPartition {
    /// Kafka topic name
    pub topic: String,
    /// Partition number
    pub partition: i32,
}

impl TopicPartition {
    /// Create a new TopicPartition
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition)
    }
}

/// Which partitions a checkpoint token applies to.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum PartitionScope {
    /// Token without a `partition#` prefix
    All,
    /// Token with a `partition#` prefix
    Partition(i32),
}

impl fmt::Display for PartitionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionScope::All => write!(f, "all partitions"),
            PartitionScope::Partition(p) => write!(f, "partition {}", p),
        }
    }
}

/// Broker-side view of a partition offset, as used in lag reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "value")]
pub enum RemoteOffset {
    /// The broker reported this offset
    Known(i64),
    /// The broker could not be asked; carries the reason
    Unknown(String),
    /// The topic or partition does not exist on the broker
    NotFound,
}

impl RemoteOffset {
    /// The offset, if the broker reported one
    pub fn known(&self) -> Option<i64> {
        match self {
            RemoteOffset::Known(offset) => Some(*offset),
            _ => None,
        }
    }
}

impl fmt::Display for RemoteOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteOffset::Known(offset) => write!(f, "{}", offset),
            RemoteOffset::Unknown(_) => write!(f, "unknown"),
            RemoteOffset::NotFound => write!(f, "not found"),
        }
    }
}
