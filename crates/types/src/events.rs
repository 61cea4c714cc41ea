//! Event types emitted by partition consumers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::partitions::TopicPartition;

/// A single record read from a topic partition.
///
/// Events are immutable once produced. Ownership passes to the caller as soon
/// as the event leaves the merged event channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Topic the record was read from
    pub topic: String,
    /// Partition the record was read from
    pub partition: i32,
    /// Record key (if present)
    pub key: Option<Vec<u8>>,
    /// Record value (if present)
    pub value: Option<Vec<u8>>,
    /// Broker or producer timestamp (if available)
    pub timestamp: Option<DateTime<Utc>>,
    /// Offset of the record within its partition
    pub offset: i64,
}

impl Event {
    /// Create a new event
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            key: None,
            value: None,
            timestamp: None,
            offset,
        }
    }

    /// Set the record key
    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Set the record value
    pub fn with_value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = Some(value.into());
        self
    }

    /// Set the record timestamp
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// The topic-partition this event belongs to
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    /// Size of key and value in bytes
    pub fn payload_size(&self) -> usize {
        self.key.as_ref().map_or(0, Vec::len) + self.value.as_ref().map_or(0, Vec::len)
    }

    /// Render the value as UTF-8, replacing invalid sequences
    pub fn value_lossy(&self) -> Option<String> {
        self.value
            .as_deref()
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }

    /// Render the key as UTF-8, replacing invalid sequences
    pub fn key_lossy(&self) -> Option<String> {
        self.key
            .as_deref()
            .map(|k| String::from_utf8_lossy(k).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_builder() {
        let ts = Utc::now();
        let event = Event::new("orders", 3, 42)
            .with_key("k1")
            .with_value(b"hello".to_vec())
            .with_timestamp(ts);

        assert_eq!(event.topic, "orders");
        assert_eq!(event.partition, 3);
        assert_eq!(event.offset, 42);
        assert_eq!(event.key_lossy().as_deref(), Some("k1"));
        assert_eq!(event.value_lossy().as_deref(), Some("hello"));
        assert_eq!(event.timestamp, Some(ts));
        assert_eq!(event.payload_size(), 7);
        assert_eq!(event.topic_partition(), TopicPartition::new("orders", 3));
    }

    #[test]
    fn test_event_json_shape() {
        let event = Event::new("orders", 0, 7).with_value(b"v".to_vec());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["topic"], "orders");
        assert_eq!(json["offset"], 7);
        assert!(json["key"].is_null());
    }
}
