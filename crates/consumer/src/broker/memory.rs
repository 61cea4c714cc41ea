//! In-process broker.
//!
//! Holds topics as vectors of append-only partition logs. Open partition
//! streams wait for new messages and end once the partition is closed and
//! fully read. Failures can be injected per partition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use super::{BrokerClient, MessageStream, OffsetQuery, RawMessage, TopicSpec};
use crate::error::{BrokerError, BrokerResult};

struct LogState {
    low: i64,
    messages: Vec<RawMessage>,
    closed: bool,
    pending_errors: VecDeque<BrokerError>,
}

impl LogState {
    fn high(&self) -> i64 {
        self.low + self.messages.len() as i64
    }
}

struct PartitionLog {
    state: Mutex<LogState>,
    changed: watch::Sender<u64>,
}

enum ReadOutcome {
    Message(RawMessage),
    Error(BrokerError),
    Pending,
    Closed,
}

impl PartitionLog {
    fn new() -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            state: Mutex::new(LogState {
                low: 0,
                messages: Vec::new(),
                closed: false,
                pending_errors: VecDeque::new(),
            }),
            changed,
        }
    }

    fn update<R>(&self, f: impl FnOnce(&mut LogState) -> R) -> R {
        let result = f(&mut self.state.lock());
        self.changed.send_modify(|version| *version += 1);
        result
    }

    fn read(&self, next: i64) -> ReadOutcome {
        let mut state = self.state.lock();
        if let Some(err) = state.pending_errors.pop_front() {
            return ReadOutcome::Error(err);
        }
        let index = (next.max(state.low) - state.low) as usize;
        match state.messages.get(index) {
            Some(msg) => ReadOutcome::Message(msg.clone()),
            None if state.closed => ReadOutcome::Closed,
            None => ReadOutcome::Pending,
        }
    }
}

/// Decrements the open stream count when a stream is dropped.
struct StreamGuard(Arc<AtomicUsize>);

impl StreamGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Cursor {
    log: Arc<PartitionLog>,
    changes: watch::Receiver<u64>,
    next: i64,
    _guard: StreamGuard,
}

/// A broker that lives entirely in memory.
#[derive(Default)]
pub struct InMemoryBroker {
    topics: RwLock<HashMap<String, Vec<Arc<PartitionLog>>>>,
    created: Mutex<Vec<String>>,
    offset_errors: Mutex<HashMap<(String, i32), BrokerError>>,
    open_streams: Arc<AtomicUsize>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a topic with empty partitions.
    pub fn with_topic(self, topic: &str, partitions: i32) -> Self {
        self.add_topic(topic, partitions);
        self
    }

    /// Add a topic with empty partitions, replacing any existing one.
    pub fn add_topic(&self, topic: &str, partitions: i32) {
        let logs = (0..partitions.max(0))
            .map(|_| Arc::new(PartitionLog::new()))
            .collect();
        self.topics.write().insert(topic.to_string(), logs);
    }

    fn log(&self, topic: &str, partition: i32) -> BrokerResult<Arc<PartitionLog>> {
        let topics = self.topics.read();
        let logs = topics
            .get(topic)
            .ok_or_else(|| BrokerError::topic_not_found(topic))?;
        usize::try_from(partition)
            .ok()
            .and_then(|p| logs.get(p))
            .cloned()
            .ok_or_else(|| BrokerError::partition_not_found(topic, partition))
    }

    /// Append a message stamped with the current time. Returns its offset.
    pub fn produce(
        &self,
        topic: &str,
        partition: i32,
        key: Option<&[u8]>,
        value: &[u8],
    ) -> BrokerResult<i64> {
        self.produce_at(topic, partition, key, value, Utc::now())
    }

    /// Append a message with an explicit timestamp. Returns its offset.
    pub fn produce_at(
        &self,
        topic: &str,
        partition: i32,
        key: Option<&[u8]>,
        value: &[u8],
        timestamp: DateTime<Utc>,
    ) -> BrokerResult<i64> {
        let log = self.log(topic, partition)?;
        Ok(log.update(|state| {
            let offset = state.high();
            state.messages.push(RawMessage {
                key: key.map(<[u8]>::to_vec),
                value: Some(value.to_vec()),
                timestamp: Some(timestamp),
                offset,
            });
            offset
        }))
    }

    /// Drop every message below `offset`, as retention would.
    pub fn truncate_before(&self, topic: &str, partition: i32, offset: i64) -> BrokerResult<()> {
        let log = self.log(topic, partition)?;
        log.update(|state| {
            if offset <= state.low {
                return;
            }
            let drop_count = ((offset - state.low) as usize).min(state.messages.len());
            state.messages.drain(..drop_count);
            state.low = offset;
        });
        Ok(())
    }

    /// End every stream on the partition once it has been read to the end.
    pub fn close_partition(&self, topic: &str, partition: i32) -> BrokerResult<()> {
        let log = self.log(topic, partition)?;
        log.update(|state| state.closed = true);
        Ok(())
    }

    /// Make the next read of the partition yield `error`.
    pub fn inject_stream_error(
        &self,
        topic: &str,
        partition: i32,
        error: BrokerError,
    ) -> BrokerResult<()> {
        let log = self.log(topic, partition)?;
        log.update(|state| state.pending_errors.push_back(error));
        Ok(())
    }

    /// Make every offset lookup on the partition fail with `error`.
    pub fn fail_offset_lookups(&self, topic: &str, partition: i32, error: BrokerError) {
        self.offset_errors
            .lock()
            .insert((topic.to_string(), partition), error);
    }

    /// Topics created through [`BrokerClient::create_topic`].
    pub fn created_topics(&self) -> Vec<String> {
        self.created.lock().clone()
    }

    /// Number of partition streams currently open.
    pub fn open_streams(&self) -> usize {
        self.open_streams.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    async fn list_partitions(&self, topic: &str) -> BrokerResult<Vec<i32>> {
        let topics = self.topics.read();
        let logs = topics
            .get(topic)
            .ok_or_else(|| BrokerError::topic_not_found(topic))?;
        Ok((0..logs.len() as i32).collect())
    }

    async fn get_offset(
        &self,
        topic: &str,
        partition: i32,
        query: OffsetQuery,
    ) -> BrokerResult<i64> {
        let log = self.log(topic, partition)?;
        if let Some(err) = self
            .offset_errors
            .lock()
            .get(&(topic.to_string(), partition))
        {
            return Err(err.clone());
        }

        let state = log.state.lock();
        Ok(match query {
            OffsetQuery::Oldest => state.low,
            OffsetQuery::Newest => state.high(),
            OffsetQuery::Timestamp(ts) => state
                .messages
                .iter()
                .find(|m| m.timestamp.map_or(false, |t| t >= ts))
                .map_or(state.high(), |m| m.offset),
        })
    }

    async fn consume_partition(
        &self,
        topic: &str,
        partition: i32,
        start_offset: i64,
    ) -> BrokerResult<MessageStream> {
        let log = self.log(topic, partition)?;
        debug!(
            topic = topic,
            partition = partition,
            start_offset = start_offset,
            "Opening in-memory partition stream"
        );

        let cursor = Cursor {
            changes: log.changed.subscribe(),
            log,
            next: start_offset,
            _guard: StreamGuard::new(&self.open_streams),
        };

        Ok(stream::unfold(cursor, |mut cursor| async move {
            loop {
                cursor.changes.borrow_and_update();
                match cursor.log.read(cursor.next) {
                    ReadOutcome::Message(msg) => {
                        cursor.next = msg.offset + 1;
                        return Some((Ok(msg), cursor));
                    }
                    ReadOutcome::Error(err) => return Some((Err(err), cursor)),
                    ReadOutcome::Closed => return None,
                    ReadOutcome::Pending => {
                        if cursor.changes.changed().await.is_err() {
                            return None;
                        }
                    }
                }
            }
        })
        .boxed())
    }

    async fn create_topic(&self, topic: &str, spec: &TopicSpec) -> BrokerResult<()> {
        if self.topics.read().contains_key(topic) {
            return Ok(());
        }
        self.add_topic(topic, spec.partitions);
        self.created.lock().push(topic.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    #[tokio::test]
    async fn test_offsets() {
        let broker = InMemoryBroker::new().with_topic("orders", 2);
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        for i in 0..5 {
            broker
                .produce_at("orders", 0, None, b"v", base + chrono::Duration::minutes(i))
                .unwrap();
        }

        assert_eq!(broker.list_partitions("orders").await.unwrap(), vec![0, 1]);
        assert_eq!(broker.get_offset("orders", 0, OffsetQuery::Oldest).await.unwrap(), 0);
        assert_eq!(broker.get_offset("orders", 0, OffsetQuery::Newest).await.unwrap(), 5);
        assert_eq!(
            broker
                .get_offset("orders", 0, OffsetQuery::Timestamp(base + chrono::Duration::seconds(90)))
                .await
                .unwrap(),
            2
        );
        assert_eq!(
            broker
                .get_offset("orders", 0, OffsetQuery::Timestamp(base + chrono::Duration::hours(1)))
                .await
                .unwrap(),
            5
        );

        broker.truncate_before("orders", 0, 3).unwrap();
        assert_eq!(broker.get_offset("orders", 0, OffsetQuery::Oldest).await.unwrap(), 3);
        assert_eq!(broker.get_offset("orders", 0, OffsetQuery::Newest).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_not_found() {
        let broker = InMemoryBroker::new().with_topic("orders", 1);
        assert!(matches!(
            broker.list_partitions("missing").await,
            Err(BrokerError::TopicNotFound { .. })
        ));
        assert!(matches!(
            broker.get_offset("orders", 4, OffsetQuery::Newest).await,
            Err(BrokerError::PartitionNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_stream_waits_for_new_messages() {
        let broker = Arc::new(InMemoryBroker::new().with_topic("orders", 1));
        broker.produce("orders", 0, Some(b"k".as_slice()), b"first").unwrap();

        let mut stream = broker.consume_partition("orders", 0, 0).await.unwrap();
        assert_eq!(broker.open_streams(), 1);

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.offset, 0);
        assert_eq!(first.key.as_deref(), Some(&b"k"[..]));

        let producer = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.produce("orders", 0, None, b"second").unwrap();
            producer.close_partition("orders", 0).unwrap();
        });

        let second = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(second.offset, 1);
        assert!(stream.next().await.is_none());

        drop(stream);
        assert_eq!(broker.open_streams(), 0);
    }

    #[tokio::test]
    async fn test_injected_stream_error() {
        let broker = InMemoryBroker::new().with_topic("orders", 1);
        broker.produce("orders", 0, None, b"a").unwrap();
        broker
            .inject_stream_error("orders", 0, BrokerError::communication("reset"))
            .unwrap();

        let mut stream = broker.consume_partition("orders", 0, 0).await.unwrap();
        assert!(stream.next().await.unwrap().is_err());
        assert_eq!(stream.next().await.unwrap().unwrap().offset, 0);
    }

    #[tokio::test]
    async fn test_create_topic() {
        let broker = InMemoryBroker::new();
        let spec = TopicSpec {
            partitions: 3,
            replication_factor: 1,
        };
        broker.create_topic("events", &spec).await.unwrap();
        broker.create_topic("events", &spec).await.unwrap();

        assert_eq!(broker.list_partitions("events").await.unwrap().len(), 3);
        assert_eq!(broker.created_topics(), vec!["events".to_string()]);
    }
}
