//! Partition consumer.
//!
//! One [`PartitionConsumer`] reads exactly one topic partition: it resolves its
//! [`CheckpointPair`] to absolute offsets, streams messages into a sink and
//! stops at the stop bound, on cancellation, or when the upstream ends.
//!
//! ```text
//! Created -> ResolvingStart -> Streaming -> StoppedAtCheckpoint | Cancelled | UpstreamClosed -> Closed
//! ```

use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use kreplay_types::Event;

use crate::broker::{BrokerClient, OffsetQuery, RawMessage};
use crate::checkpoint::{Checkpoint, CheckpointPair, Predefined};
use crate::error::{CheckpointError, ConsumerError, ConsumerResult, PartitionError};
use crate::shutdown::cancelled;
use crate::stats::ConsumptionStats;
use crate::store::OffsetStore;

/// Pause after a retryable stream error before reading again.
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Why a partition consumer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Termination {
    /// The stop bound was reached (inclusive) or lies before the start
    StoppedAtCheckpoint,
    /// Cancellation was requested or the event receiver went away
    Cancelled,
    /// The partition stream ended
    UpstreamClosed,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::StoppedAtCheckpoint => write!(f, "stopped at checkpoint"),
            Termination::Cancelled => write!(f, "cancelled"),
            Termination::UpstreamClosed => write!(f, "upstream closed"),
        }
    }
}

/// Lifecycle of a partition consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    Created,
    ResolvingStart,
    Streaming,
    Stopped(Termination),
    Failed,
    Closed,
}

/// A stop bound resolved against the partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBound {
    Offset(i64),
    Timestamp(DateTime<Utc>),
}

impl StopBound {
    /// Whether the message reaches or passes the bound.
    fn reached_by(&self, msg: &RawMessage) -> bool {
        match self {
            StopBound::Offset(stop) => msg.offset >= *stop,
            StopBound::Timestamp(stop) => msg.timestamp.map_or(false, |ts| ts >= *stop),
        }
    }
}

/// Consumes a single topic partition.
pub struct PartitionConsumer {
    topic: String,
    partition: i32,
    pair: CheckpointPair,
    environment: String,
    client: Arc<dyn BrokerClient>,
    store: Arc<dyn OffsetStore>,
    stats: Option<Arc<ConsumptionStats>>,
    errors: Option<mpsc::UnboundedSender<PartitionError>>,
    state: PartitionState,
}

impl PartitionConsumer {
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        pair: CheckpointPair,
        environment: impl Into<String>,
        client: Arc<dyn BrokerClient>,
        store: Arc<dyn OffsetStore>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            pair,
            environment: environment.into(),
            client,
            store,
            stats: None,
            errors: None,
            state: PartitionState::Created,
        }
    }

    /// Record delivered events in shared statistics.
    pub fn with_stats(mut self, stats: Arc<ConsumptionStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Report recoverable stream errors on a shared error channel.
    pub fn with_error_reporter(mut self, errors: mpsc::UnboundedSender<PartitionError>) -> Self {
        self.errors = Some(errors);
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn state(&self) -> PartitionState {
        self.state
    }

    fn set_state(&mut self, state: PartitionState) {
        debug!(
            topic = %self.topic,
            partition = self.partition,
            from = ?self.state,
            to = ?state,
            "Partition state transition"
        );
        self.state = state;
    }

    /// Consume the partition into `sink` until a terminal condition.
    ///
    /// Cancellation is a normal termination, not an error. Errors are returned
    /// for failed start/stop resolution and for non-retryable stream errors.
    pub async fn run(
        &mut self,
        sink: mpsc::Sender<Event>,
        mut shutdown: watch::Receiver<bool>,
    ) -> ConsumerResult<Termination> {
        let result = self.consume(&sink, &mut shutdown).await;
        match &result {
            Ok(termination) => {
                self.set_state(PartitionState::Stopped(*termination));
                info!(
                    topic = %self.topic,
                    partition = self.partition,
                    termination = %termination,
                    "Partition consumer finished"
                );
            }
            Err(e) => {
                self.set_state(PartitionState::Failed);
                warn!(
                    topic = %self.topic,
                    partition = self.partition,
                    error = %e,
                    "Partition consumer failed"
                );
            }
        }
        self.set_state(PartitionState::Closed);
        result
    }

    /// Run on a new task with its own event channel.
    pub fn spawn(
        mut self,
        capacity: usize,
        shutdown: watch::Receiver<bool>,
    ) -> (
        mpsc::Receiver<Event>,
        JoinHandle<ConsumerResult<Termination>>,
    ) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = tokio::spawn(async move { self.run(tx, shutdown).await });
        (rx, handle)
    }

    async fn consume(
        &mut self,
        sink: &mpsc::Sender<Event>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ConsumerResult<Termination> {
        self.set_state(PartitionState::ResolvingStart);

        let bounds = tokio::select! {
            biased;
            _ = cancelled(shutdown) => return Ok(Termination::Cancelled),
            bounds = self.resolve_bounds() => bounds?,
        };
        let (start, stop) = bounds;

        if let Some(StopBound::Offset(stop)) = stop {
            if stop < start {
                debug!(
                    topic = %self.topic,
                    partition = self.partition,
                    start = start,
                    stop = stop,
                    "Stop offset precedes start offset"
                );
                return Ok(Termination::StoppedAtCheckpoint);
            }
        }

        let mut stream = tokio::select! {
            biased;
            _ = cancelled(shutdown) => return Ok(Termination::Cancelled),
            stream = self.client.consume_partition(&self.topic, self.partition, start) => stream?,
        };

        self.set_state(PartitionState::Streaming);
        info!(
            topic = %self.topic,
            partition = self.partition,
            start = start,
            stop = ?stop,
            "Streaming partition"
        );

        loop {
            let next = tokio::select! {
                biased;
                _ = cancelled(shutdown) => return Ok(Termination::Cancelled),
                next = stream.next() => next,
            };

            let msg = match next {
                None => return Ok(Termination::UpstreamClosed),
                Some(Ok(msg)) => msg,
                Some(Err(e)) if e.is_retryable() => {
                    warn!(
                        topic = %self.topic,
                        partition = self.partition,
                        error = %e,
                        "Retryable stream error"
                    );
                    self.report(e.into());
                    tokio::select! {
                        biased;
                        _ = cancelled(shutdown) => return Ok(Termination::Cancelled),
                        _ = tokio::time::sleep(RETRY_BACKOFF) => continue,
                    }
                }
                Some(Err(e)) => return Err(e.into()),
            };

            if msg.offset < start {
                continue;
            }

            let reached = stop.map_or(false, |bound| bound.reached_by(&msg));
            let offset = msg.offset;
            let event = msg.into_event(&self.topic, self.partition);

            tokio::select! {
                biased;
                _ = cancelled(shutdown) => return Ok(Termination::Cancelled),
                sent = sink.send(event) => {
                    if sent.is_err() {
                        debug!(
                            topic = %self.topic,
                            partition = self.partition,
                            "Event receiver dropped"
                        );
                        return Ok(Termination::Cancelled);
                    }
                }
            }

            if let Some(stats) = &self.stats {
                stats.record(&self.topic, self.partition, offset);
            }

            if reached {
                return Ok(Termination::StoppedAtCheckpoint);
            }
        }
    }

    /// Resolve the start offset and the stop bound.
    async fn resolve_bounds(&self) -> ConsumerResult<(i64, Option<StopBound>)> {
        let start = self.resolve_start().await?;
        let stop = match self.pair.to {
            None => None,
            Some(Checkpoint::Explicit(offset)) => Some(StopBound::Offset(offset)),
            Some(Checkpoint::Timestamp(ts)) => Some(StopBound::Timestamp(ts)),
            Some(Checkpoint::Predefined(Predefined::Newest)) => {
                let high = self
                    .client
                    .get_offset(&self.topic, self.partition, OffsetQuery::Newest)
                    .await?;
                Some(StopBound::Offset(high - 1))
            }
            Some(other) => {
                return Err(CheckpointError::NotAStopCondition {
                    input: other.to_string(),
                }
                .into())
            }
        };

        debug!(
            topic = %self.topic,
            partition = self.partition,
            pair = %self.pair,
            start = start,
            stop = ?stop,
            "Resolved checkpoints"
        );
        Ok((start, stop))
    }

    async fn resolve_start(&self) -> ConsumerResult<i64> {
        let offset = match self.pair.from {
            Checkpoint::Explicit(offset) => offset,
            Checkpoint::Predefined(predefined) => {
                self.client
                    .get_offset(&self.topic, self.partition, predefined.into())
                    .await?
            }
            Checkpoint::Timestamp(ts) => {
                self.client
                    .get_offset(&self.topic, self.partition, OffsetQuery::Timestamp(ts))
                    .await?
            }
            Checkpoint::Local => match self.stored_offset().await {
                Some(offset) => offset,
                None => {
                    self.client
                        .get_offset(&self.topic, self.partition, OffsetQuery::Newest)
                        .await?
                }
            },
        };
        Ok(offset)
    }

    /// The next offset recorded locally, if any.
    async fn stored_offset(&self) -> Option<i64> {
        match self
            .store
            .read_topic_offsets(&self.environment, &self.topic)
            .await
        {
            Ok(offsets) => {
                let stored = offsets.get(self.partition);
                if stored.is_none() {
                    debug!(
                        topic = %self.topic,
                        partition = self.partition,
                        environment = %self.environment,
                        "No stored offset, starting from newest"
                    );
                }
                stored
            }
            Err(e) => {
                warn!(
                    topic = %self.topic,
                    partition = self.partition,
                    error = %e,
                    "Failed to read stored offsets, starting from newest"
                );
                None
            }
        }
    }

    fn report(&self, error: ConsumerError) {
        if let Some(errors) = &self.errors {
            errors
                .send(PartitionError::new(self.topic.clone(), self.partition, error))
                .ok();
        }
    }
}
