//! Shared helpers for consumer integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use consumer::broker::{MessageStream, OffsetQuery};
use consumer::error::{BrokerResult, StoreError, StoreResult};
use consumer::store::{OffsetFilter, OffsetStore, PartitionOffsetRecord, TopicOffsets};
use consumer::{
    BrokerClient, ConsumerStreams, InMemoryBroker, InMemoryOffsetStore, OrchestratorConfig,
    PartitionCheckpoints, TopicSpec,
};
use futures::StreamExt;
use kreplay_types::Event;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Upper bound for any single wait in these tests.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A broker holding `topic` with `counts[p]` messages in partition `p`.
pub fn seeded_broker(topic: &str, counts: &[usize]) -> Arc<InMemoryBroker> {
    let broker = InMemoryBroker::new().with_topic(topic, counts.len() as i32);
    for (partition, &count) in counts.iter().enumerate() {
        for i in 0..count {
            let key = format!("k{}", i);
            let value = format!("p{}-{}", partition, i);
            broker
                .produce(topic, partition as i32, Some(key.as_bytes()), value.as_bytes())
                .unwrap();
        }
    }
    Arc::new(broker)
}

pub fn memory_store() -> Arc<InMemoryOffsetStore> {
    Arc::new(InMemoryOffsetStore::new())
}

pub fn test_config(environment: &str) -> OrchestratorConfig {
    OrchestratorConfig {
        environment: environment.to_string(),
        channel_capacity: 16,
        drain_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

pub fn checkpoints(from: &[&str], to: &[&str], exclusive: bool) -> PartitionCheckpoints {
    PartitionCheckpoints::build(from, to, exclusive).unwrap()
}

/// A single-topic request.
pub fn single_topic(
    topic: &str,
    from: &[&str],
    to: &[&str],
) -> BTreeMap<String, PartitionCheckpoints> {
    let mut topics = BTreeMap::new();
    topics.insert(topic.to_string(), checkpoints(from, to, false));
    topics
}

/// Receive every event until the merged channel closes.
pub async fn drain_events(streams: &mut ConsumerStreams) -> Vec<Event> {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let mut events = Vec::new();
        while let Some(event) = streams.events.recv().await {
            events.push(event);
        }
        events
    })
    .await
    .expect("event channel did not close")
}

/// Offsets delivered for one partition, in delivery order.
pub fn offsets_of(events: &[Event], topic: &str, partition: i32) -> Vec<i64> {
    events
        .iter()
        .filter(|e| e.topic == topic && e.partition == partition)
        .map(|e| e.offset)
        .collect()
}

/// A store whose writes always fail.
#[derive(Debug, Default)]
pub struct FailingStore;

#[async_trait]
impl OffsetStore for FailingStore {
    async fn read_topic_offsets(
        &self,
        _environment: &str,
        _topic: &str,
    ) -> StoreResult<TopicOffsets> {
        Ok(TopicOffsets::default())
    }

    async fn commit(
        &self,
        _environment: &str,
        _topic: &str,
        _partition: i32,
        _offset: i64,
    ) -> StoreResult<()> {
        Err(StoreError::Backend {
            backend: "failing".to_string(),
            details: "disk full".to_string(),
        })
    }

    async fn list_all(&self, _filter: &OffsetFilter) -> StoreResult<Vec<PartitionOffsetRecord>> {
        Ok(Vec::new())
    }

    async fn delete(&self, _environment: &str, _topic: Option<&str>) -> StoreResult<usize> {
        Ok(0)
    }
}

/// A single-partition broker whose offset lookup blocks its worker thread.
///
/// The blocked lookup cannot observe shutdown, so the consumer only stops
/// when its task is aborted. `entered` is notified once the lookup starts.
#[derive(Debug)]
pub struct StalledBroker {
    pub entered: Notify,
    pub stall: Duration,
}

impl StalledBroker {
    pub fn new(stall: Duration) -> Self {
        Self {
            entered: Notify::new(),
            stall,
        }
    }
}

#[async_trait]
impl BrokerClient for StalledBroker {
    async fn list_partitions(&self, _topic: &str) -> BrokerResult<Vec<i32>> {
        Ok(vec![0])
    }

    async fn get_offset(
        &self,
        _topic: &str,
        _partition: i32,
        _query: OffsetQuery,
    ) -> BrokerResult<i64> {
        self.entered.notify_one();
        std::thread::sleep(self.stall);
        // hand control back so a pending abort takes effect
        tokio::task::yield_now().await;
        Ok(0)
    }

    async fn consume_partition(
        &self,
        _topic: &str,
        _partition: i32,
        _start_offset: i64,
    ) -> BrokerResult<MessageStream> {
        Ok(futures::stream::pending().boxed())
    }

    async fn create_topic(&self, _topic: &str, _spec: &TopicSpec) -> BrokerResult<()> {
        Ok(())
    }
}
