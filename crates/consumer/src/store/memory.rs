//! In-memory offset store.
//!
//! Used by tests and by runs that must not touch the on-disk store. Nothing
//! survives the process.

use async_trait::async_trait;
use dashmap::DashMap;

use super::{OffsetFilter, OffsetStore, PartitionOffsetRecord, TopicOffsets};
use crate::error::StoreResult;

/// Offset store backed by a concurrent map keyed by (environment, topic).
#[derive(Debug, Default)]
pub struct InMemoryOffsetStore {
    records: DashMap<(String, String), TopicOffsets>,
}

impl InMemoryOffsetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of (environment, topic) records held.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl OffsetStore for InMemoryOffsetStore {
    async fn read_topic_offsets(
        &self,
        environment: &str,
        topic: &str,
    ) -> StoreResult<TopicOffsets> {
        Ok(self
            .records
            .get(&(environment.to_string(), topic.to_string()))
            .map(|r| r.value().clone())
            .unwrap_or_default())
    }

    async fn commit(
        &self,
        environment: &str,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> StoreResult<()> {
        // The entry guard holds the shard lock for the whole update.
        self.records
            .entry((environment.to_string(), topic.to_string()))
            .or_default()
            .set(partition, offset);
        Ok(())
    }

    async fn list_all(&self, filter: &OffsetFilter) -> StoreResult<Vec<PartitionOffsetRecord>> {
        let mut records: Vec<PartitionOffsetRecord> = self
            .records
            .iter()
            .filter(|entry| {
                let (environment, topic) = entry.key();
                filter.matches_environment(environment) && filter.matches_topic(topic)
            })
            .flat_map(|entry| {
                let (environment, topic) = entry.key();
                PartitionOffsetRecord::from_topic(environment, topic, entry.value())
            })
            .collect();

        records.sort_by(|a, b| {
            (&a.environment, &a.topic, a.partition).cmp(&(&b.environment, &b.topic, b.partition))
        });
        Ok(records)
    }

    async fn delete(&self, environment: &str, topic: Option<&str>) -> StoreResult<usize> {
        let removed = match topic {
            Some(topic) => usize::from(
                self.records
                    .remove(&(environment.to_string(), topic.to_string()))
                    .is_some(),
            ),
            None => {
                let before = self.records.len();
                self.records.retain(|(env, _), _| env != environment);
                before - self.records.len()
            }
        };
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_commit_and_read() {
        let store = InMemoryOffsetStore::new();
        assert!(store.read_topic_offsets("dev", "orders").await.unwrap().is_empty());

        store.commit("dev", "orders", 0, 10).await.unwrap();
        store.commit("dev", "orders", 1, 20).await.unwrap();

        let offsets = store.read_topic_offsets("dev", "orders").await.unwrap();
        assert_eq!(offsets.get(0), Some(10));
        assert_eq!(offsets.get(1), Some(20));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_commits_merge() {
        let store = Arc::new(InMemoryOffsetStore::new());
        let mut handles = Vec::new();
        for partition in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.commit("dev", "orders", partition, 1).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let offsets = store.read_topic_offsets("dev", "orders").await.unwrap();
        assert_eq!(offsets.offsets.len(), 16);
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let store = InMemoryOffsetStore::new();
        store.commit("prod", "orders", 0, 1).await.unwrap();
        store.commit("prod", "payments", 0, 2).await.unwrap();
        store.commit("dev", "orders", 0, 3).await.unwrap();

        let listed = store
            .list_all(&OffsetFilter::new(None, Some("orders")).unwrap())
            .await
            .unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].environment, "dev");

        assert_eq!(store.delete("prod", None).await.unwrap(), 2);
        assert_eq!(store.delete("dev", Some("orders")).await.unwrap(), 1);
        assert!(store.is_empty());
    }
}
