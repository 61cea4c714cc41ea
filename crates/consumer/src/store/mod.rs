//! Local offset persistence.
//!
//! Offsets are namespaced by environment and topic. Each (environment, topic)
//! pair maps to one [`TopicOffsets`] record holding the next offset to read for
//! every partition that has been committed.

mod memory;
mod sled_store;

pub use memory::InMemoryOffsetStore;
pub use sled_store::{SledOffsetStore, SledStoreConfig};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{StoreError, StoreResult};

/// Stored offsets for one topic within one environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicOffsets {
    /// Next offset to read, by partition
    pub offsets: BTreeMap<i32, i64>,
    /// Time of the last commit
    pub updated_at: Option<DateTime<Utc>>,
}

impl TopicOffsets {
    /// The stored offset for a partition.
    pub fn get(&self, partition: i32) -> Option<i64> {
        self.offsets.get(&partition).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Record a partition's offset and stamp the update time.
    pub fn set(&mut self, partition: i32, offset: i64) {
        self.offsets.insert(partition, offset);
        self.updated_at = Some(Utc::now());
    }
}

/// One partition's stored offset, as returned by [`OffsetStore::list_all`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionOffsetRecord {
    pub environment: String,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl PartitionOffsetRecord {
    fn from_topic(environment: &str, topic: &str, offsets: &TopicOffsets) -> Vec<Self> {
        offsets
            .offsets
            .iter()
            .map(|(partition, offset)| Self {
                environment: environment.to_string(),
                topic: topic.to_string(),
                partition: *partition,
                offset: *offset,
                updated_at: offsets.updated_at,
            })
            .collect()
    }
}

/// Regex filters on environment and topic names.
#[derive(Debug, Clone, Default)]
pub struct OffsetFilter {
    environment: Option<Regex>,
    topic: Option<Regex>,
}

impl OffsetFilter {
    /// Match everything.
    pub fn all() -> Self {
        Self::default()
    }

    /// Build a filter from optional regular expressions.
    pub fn new(environment: Option<&str>, topic: Option<&str>) -> StoreResult<Self> {
        Ok(Self {
            environment: environment.map(compile).transpose()?,
            topic: topic.map(compile).transpose()?,
        })
    }

    pub fn matches_environment(&self, environment: &str) -> bool {
        self.environment
            .as_ref()
            .map_or(true, |re| re.is_match(environment))
    }

    pub fn matches_topic(&self, topic: &str) -> bool {
        self.topic.as_ref().map_or(true, |re| re.is_match(topic))
    }
}

fn compile(pattern: &str) -> StoreResult<Regex> {
    Regex::new(pattern).map_err(|e| StoreError::InvalidFilter {
        pattern: pattern.to_string(),
        details: e.to_string(),
    })
}

/// Trait for local offset storage backends.
///
/// Implementations must serialise concurrent commits so that commits for
/// different partitions of the same topic are merged into one record.
#[async_trait]
pub trait OffsetStore: Send + Sync {
    /// Read the stored offsets of a topic. Empty if nothing was stored.
    async fn read_topic_offsets(&self, environment: &str, topic: &str)
        -> StoreResult<TopicOffsets>;

    /// Upsert one partition's offset.
    async fn commit(
        &self,
        environment: &str,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> StoreResult<()>;

    /// List stored offsets matching the filter, ordered by environment, topic and partition.
    async fn list_all(&self, filter: &OffsetFilter) -> StoreResult<Vec<PartitionOffsetRecord>>;

    /// Delete one topic, or the whole environment when `topic` is `None`.
    ///
    /// Returns the number of topic records removed.
    async fn delete(&self, environment: &str, topic: Option<&str>) -> StoreResult<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_offsets() {
        let mut offsets = TopicOffsets::default();
        assert!(offsets.is_empty());
        assert!(offsets.updated_at.is_none());

        offsets.set(1, 100);
        offsets.set(0, 5);
        offsets.set(1, 101);
        assert_eq!(offsets.get(1), Some(101));
        assert_eq!(offsets.get(2), None);
        assert_eq!(offsets.offsets.keys().copied().collect::<Vec<_>>(), vec![0, 1]);
        assert!(offsets.updated_at.is_some());
    }

    #[test]
    fn test_topic_offsets_bincode() {
        let mut offsets = TopicOffsets::default();
        offsets.set(0, 42);
        offsets.set(7, 9_000_000_000);

        let bytes = bincode::serialize(&offsets).unwrap();
        let decoded: TopicOffsets = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, offsets);
    }

    #[test]
    fn test_offset_filter() {
        let filter = OffsetFilter::new(Some("^prod"), Some("orders|payments")).unwrap();
        assert!(filter.matches_environment("prod-eu"));
        assert!(!filter.matches_environment("staging"));
        assert!(filter.matches_topic("payments.v2"));
        assert!(!filter.matches_topic("users"));

        let all = OffsetFilter::all();
        assert!(all.matches_environment("anything"));
        assert!(all.matches_topic("anything"));

        assert!(matches!(
            OffsetFilter::new(Some("("), None),
            Err(StoreError::InvalidFilter { .. })
        ));
    }
}
