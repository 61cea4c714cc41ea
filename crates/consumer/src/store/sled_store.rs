//! Sled-based offset store.
//!
//! Layout: one sled tree per environment (named `env:<environment>`), keyed by
//! topic name, holding a bincode-encoded [`TopicOffsets`]. Every commit is
//! flushed to disk before it returns, so sled's periodic background flush is
//! turned off. Without that thread the database lock is released as soon as
//! the store is dropped and the same path can be reopened right away.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, error, info, trace};

use super::{OffsetFilter, OffsetStore, PartitionOffsetRecord, TopicOffsets};
use crate::error::{StoreError, StoreResult};

const TREE_PREFIX: &str = "env:";

/// Configuration for the sled offset store
#[derive(Debug, Clone)]
pub struct SledStoreConfig {
    /// Path to the database directory
    pub path: PathBuf,
    /// Cache size in bytes (default: 8MB)
    pub cache_capacity: u64,
}

impl SledStoreConfig {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            cache_capacity: 8 * 1024 * 1024,
        }
    }

    pub fn with_cache_capacity(mut self, capacity: u64) -> Self {
        self.cache_capacity = capacity;
        self
    }
}

/// Persistent offset store backed by sled.
pub struct SledOffsetStore {
    db: sled::Db,
    path: PathBuf,
    /// Serialises read-modify-write cycles on topic records
    write_lock: Mutex<()>,
}

impl SledOffsetStore {
    /// Open (or create) the store.
    pub async fn open(config: SledStoreConfig) -> StoreResult<Self> {
        info!(path = %config.path.display(), "Opening offset store");

        tokio::fs::create_dir_all(&config.path)
            .await
            .map_err(|e| StoreError::Backend {
                backend: "sled".to_string(),
                details: format!("failed to create directory {}: {}", config.path.display(), e),
            })?;

        let db = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_capacity)
            .flush_every_ms(None)
            .open()
            .map_err(|e| StoreError::Backend {
                backend: "sled".to_string(),
                details: format!("failed to open database: {}", e),
            })?;

        debug!(
            environments = db.tree_names().len().saturating_sub(1),
            "Offset store opened"
        );

        Ok(Self {
            db,
            path: config.path,
            write_lock: Mutex::new(()),
        })
    }

    /// Directory holding the database.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tree(&self, environment: &str) -> StoreResult<sled::Tree> {
        Ok(self.db.open_tree(tree_name(environment))?)
    }

    fn environments(&self) -> Vec<String> {
        self.db
            .tree_names()
            .into_iter()
            .filter_map(|name| {
                std::str::from_utf8(&name)
                    .ok()
                    .and_then(|n| n.strip_prefix(TREE_PREFIX))
                    .map(str::to_string)
            })
            .collect()
    }

    fn has_environment(&self, environment: &str) -> bool {
        let name = tree_name(environment);
        self.db
            .tree_names()
            .iter()
            .any(|n| &n[..] == name.as_bytes())
    }
}

fn tree_name(environment: &str) -> String {
    format!("{}{}", TREE_PREFIX, environment)
}

fn decode(bytes: &[u8]) -> StoreResult<TopicOffsets> {
    Ok(bincode::deserialize(bytes)?)
}

#[async_trait]
impl OffsetStore for SledOffsetStore {
    async fn read_topic_offsets(
        &self,
        environment: &str,
        topic: &str,
    ) -> StoreResult<TopicOffsets> {
        if !self.has_environment(environment) {
            return Ok(TopicOffsets::default());
        }

        match self.tree(environment)?.get(topic.as_bytes())? {
            Some(bytes) => decode(&bytes),
            None => Ok(TopicOffsets::default()),
        }
    }

    async fn commit(
        &self,
        environment: &str,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;

        let tree = self.tree(environment)?;
        let mut record = match tree.get(topic.as_bytes())? {
            Some(bytes) => decode(&bytes)?,
            None => TopicOffsets::default(),
        };
        record.set(partition, offset);

        let bytes = bincode::serialize(&record)?;
        tree.insert(topic.as_bytes(), bytes)?;
        tree.flush_async().await?;

        trace!(
            environment = environment,
            topic = topic,
            partition = partition,
            offset = offset,
            "Committed offset"
        );
        Ok(())
    }

    async fn list_all(&self, filter: &OffsetFilter) -> StoreResult<Vec<PartitionOffsetRecord>> {
        let mut records = Vec::new();

        let mut environments = self.environments();
        environments.sort();

        for environment in environments {
            if !filter.matches_environment(&environment) {
                continue;
            }
            // sled iterates keys in byte order, so topics come out sorted
            for entry in self.tree(&environment)?.iter() {
                let (key, value) = entry?;
                let topic = String::from_utf8_lossy(&key);
                if !filter.matches_topic(&topic) {
                    continue;
                }
                let offsets = decode(&value)?;
                records.extend(PartitionOffsetRecord::from_topic(
                    &environment,
                    &topic,
                    &offsets,
                ));
            }
        }

        Ok(records)
    }

    async fn delete(&self, environment: &str, topic: Option<&str>) -> StoreResult<usize> {
        let _guard = self.write_lock.lock().await;

        if !self.has_environment(environment) {
            return Ok(0);
        }

        let tree = self.tree(environment)?;
        let removed = match topic {
            Some(topic) => usize::from(tree.remove(topic.as_bytes())?.is_some()),
            None => tree.len(),
        };

        if topic.is_none() || tree.is_empty() {
            drop(tree);
            self.db.drop_tree(tree_name(environment))?;
        }
        self.db.flush_async().await?;

        info!(
            environment = environment,
            topic = topic.unwrap_or("*"),
            removed = removed,
            "Deleted stored offsets"
        );
        Ok(removed)
    }
}

impl Drop for SledOffsetStore {
    fn drop(&mut self) {
        if let Err(e) = self.db.flush() {
            error!("Failed to flush offset store on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn open_store(dir: &TempDir) -> SledOffsetStore {
        SledOffsetStore::open(SledStoreConfig::new(dir.path().join("offsets")))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_read_missing_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let offsets = store.read_topic_offsets("dev", "orders").await.unwrap();
        assert!(offsets.is_empty());
        assert!(store.list_all(&OffsetFilter::all()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_commit_survives_reopen() {
        let dir = TempDir::new().unwrap();

        {
            let store = open_store(&dir).await;
            store.commit("dev", "orders", 0, 11).await.unwrap();
            store.commit("dev", "orders", 2, 40).await.unwrap();
            store.commit("dev", "orders", 0, 16).await.unwrap();
        }

        let store = open_store(&dir).await;
        let offsets = store.read_topic_offsets("dev", "orders").await.unwrap();
        assert_eq!(offsets.get(0), Some(16));
        assert_eq!(offsets.get(2), Some(40));
        assert_eq!(offsets.offsets.len(), 2);
        assert!(offsets.updated_at.is_some());
    }

    #[tokio::test]
    async fn test_environments_are_isolated() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        store.commit("dev", "orders", 0, 1).await.unwrap();
        store.commit("prod", "orders", 0, 99).await.unwrap();

        assert_eq!(
            store.read_topic_offsets("dev", "orders").await.unwrap().get(0),
            Some(1)
        );
        assert_eq!(
            store.read_topic_offsets("prod", "orders").await.unwrap().get(0),
            Some(99)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_partition_commits_merge() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(open_store(&dir).await);

        let mut handles = Vec::new();
        for partition in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for offset in 1..=5 {
                    store
                        .commit("dev", "orders", partition, offset * 10)
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let offsets = store.read_topic_offsets("dev", "orders").await.unwrap();
        assert_eq!(offsets.offsets.len(), 8);
        assert!(offsets.offsets.values().all(|o| *o == 50));
    }

    #[tokio::test]
    async fn test_list_all_with_filters() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        store.commit("prod", "payments", 1, 7).await.unwrap();
        store.commit("prod", "orders", 0, 3).await.unwrap();
        store.commit("dev", "orders", 0, 5).await.unwrap();

        let all = store.list_all(&OffsetFilter::all()).await.unwrap();
        let keys: Vec<_> = all
            .iter()
            .map(|r| (r.environment.as_str(), r.topic.as_str(), r.partition))
            .collect();
        assert_eq!(
            keys,
            vec![("dev", "orders", 0), ("prod", "orders", 0), ("prod", "payments", 1)]
        );

        let filter = OffsetFilter::new(Some("^prod$"), Some("^pay")).unwrap();
        let filtered = store.list_all(&filter).await.unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].offset, 7);
    }

    #[tokio::test]
    async fn test_delete_topic_and_environment() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        store.commit("dev", "orders", 0, 1).await.unwrap();
        store.commit("dev", "payments", 0, 2).await.unwrap();
        store.commit("prod", "orders", 0, 3).await.unwrap();

        assert_eq!(store.delete("dev", Some("orders")).await.unwrap(), 1);
        assert_eq!(store.delete("dev", Some("orders")).await.unwrap(), 0);
        assert!(store.read_topic_offsets("dev", "orders").await.unwrap().is_empty());
        assert_eq!(
            store.read_topic_offsets("dev", "payments").await.unwrap().get(0),
            Some(2)
        );

        assert_eq!(store.delete("prod", None).await.unwrap(), 1);
        assert_eq!(store.delete("missing", None).await.unwrap(), 0);

        let remaining = store.list_all(&OffsetFilter::all()).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].topic, "payments");
    }
}
