//! Broker client facade.
//!
//! [`BrokerClient`] is the narrow surface the consumer core needs from a
//! Kafka cluster: partition discovery, offset lookup, per-partition message
//! streams and topic creation. [`KafkaBrokerClient`] implements it with
//! rdkafka; [`InMemoryBroker`] implements it without a cluster.

mod kafka;
mod memory;

pub use kafka::{KafkaBrokerClient, KafkaClientConfig};
pub use memory::InMemoryBroker;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use kreplay_types::Event;

use crate::checkpoint::Predefined;
use crate::error::BrokerResult;

/// Which offset to look up for a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetQuery {
    /// First offset still retained (low watermark)
    Oldest,
    /// Offset the next produced message will get (high watermark)
    Newest,
    /// First offset whose timestamp is at or after the instant, or the high
    /// watermark when there is none
    Timestamp(DateTime<Utc>),
}

impl From<Predefined> for OffsetQuery {
    fn from(predefined: Predefined) -> Self {
        match predefined {
            Predefined::Oldest => OffsetQuery::Oldest,
            Predefined::Newest => OffsetQuery::Newest,
        }
    }
}

/// A message as read from a partition stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub timestamp: Option<DateTime<Utc>>,
    pub offset: i64,
}

impl RawMessage {
    /// Attach topic and partition to produce an event.
    pub fn into_event(self, topic: &str, partition: i32) -> Event {
        Event {
            topic: topic.to_string(),
            partition,
            key: self.key,
            value: self.value,
            timestamp: self.timestamp,
            offset: self.offset,
        }
    }
}

/// Settings for topics created on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicSpec {
    pub partitions: i32,
    pub replication_factor: i32,
}

impl Default for TopicSpec {
    fn default() -> Self {
        Self {
            partitions: 1,
            replication_factor: 1,
        }
    }
}

/// Messages of one partition, in offset order.
///
/// The stream ends when the partition can no longer be read. Dropping it
/// releases the underlying partition reader.
pub type MessageStream = BoxStream<'static, BrokerResult<RawMessage>>;

/// Access to a Kafka cluster.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// List the partition ids of a topic, in ascending order.
    ///
    /// Fails with `TopicNotFound` when the topic does not exist.
    async fn list_partitions(&self, topic: &str) -> BrokerResult<Vec<i32>>;

    /// Look up an absolute offset of a partition.
    async fn get_offset(&self, topic: &str, partition: i32, query: OffsetQuery)
        -> BrokerResult<i64>;

    /// Open a stream over one partition starting at `start_offset`.
    async fn consume_partition(
        &self,
        topic: &str,
        partition: i32,
        start_offset: i64,
    ) -> BrokerResult<MessageStream>;

    /// Create a topic. Succeeds if the topic already exists.
    async fn create_topic(&self, topic: &str, spec: &TopicSpec) -> BrokerResult<()>;
}
