//! Consumer orchestrator.
//!
//! The [`Orchestrator`] owns every partition consumer of a run. It fetches
//! partition metadata for the requested topics, spawns one consumer per
//! partition that is not excluded, merges their events into a single channel
//! and supervises shutdown.
//!
//! The merged event channel closes once every partition consumer has reached a
//! terminal state. On cancellation or idle timeout the supervisor signals all
//! consumers and waits up to the drain timeout before aborting stragglers.

use dashmap::DashMap;
use kreplay_types::{Event, TopicPartition};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerClient, TopicSpec};
use crate::checkpoint::CheckpointPair;
use crate::error::{BrokerError, BrokerResult, ConsumerError, ConsumerResult, PartitionError, StoreResult};
use crate::partition::{PartitionConsumer, Termination};
use crate::resolver::{PartitionCheckpoints, Resolution};
use crate::shutdown::{self, cancelled};
use crate::stats::ConsumptionStats;
use crate::store::OffsetStore;

/// Orchestrator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Idle,
    FetchingMetadata,
    Running,
    Draining,
    Closed,
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OrchestratorState::Idle => "idle",
            OrchestratorState::FetchingMetadata => "fetching metadata",
            OrchestratorState::Running => "running",
            OrchestratorState::Draining => "draining",
            OrchestratorState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why the orchestrator shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Every partition consumer finished on its own
    Completed,
    /// The caller requested cancellation
    Cancelled,
    /// No event arrived within the idle timeout
    IdleTimeout,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Completed => write!(f, "completed"),
            ShutdownReason::Cancelled => write!(f, "cancelled"),
            ShutdownReason::IdleTimeout => write!(f, "idle timeout"),
        }
    }
}

/// How a partition consumer ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionOutcome {
    Finished(Termination),
    Failed(String),
    /// Still running when the drain timeout expired
    Aborted,
}

/// Final state of one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSummary {
    pub outcome: PartitionOutcome,
    pub consumed: u64,
    pub last_offset: Option<i64>,
}

/// Result of a whole run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumptionSummary {
    pub reason: ShutdownReason,
    pub partitions: BTreeMap<TopicPartition, PartitionSummary>,
}

impl ConsumptionSummary {
    fn empty(reason: ShutdownReason) -> Self {
        Self {
            reason,
            partitions: BTreeMap::new(),
        }
    }

    /// Total events delivered.
    pub fn total_consumed(&self) -> u64 {
        self.partitions.values().map(|p| p.consumed).sum()
    }
}

/// Output of [`Orchestrator::start`].
pub struct ConsumerStreams {
    /// Merged events of all partitions; closes when every consumer has stopped
    pub events: mpsc::Receiver<Event>,
    /// Runtime failures attributed to a partition
    pub errors: mpsc::UnboundedReceiver<PartitionError>,
    completion: JoinHandle<ConsumptionSummary>,
}

impl ConsumerStreams {
    /// Wait for the supervisor to finish and return the run summary.
    ///
    /// Dropping the event receiver first cancels consumers still sending.
    pub async fn wait(self) -> ConsumerResult<ConsumptionSummary> {
        let ConsumerStreams {
            events,
            errors,
            completion,
        } = self;
        drop(events);
        drop(errors);
        completion.await.map_err(|e| {
            ConsumerError::Supervisor(format!("supervisor task failed: {}", e))
        })
    }
}

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Namespace for local offsets
    pub environment: String,
    /// Capacity of the merged event channel
    pub channel_capacity: usize,
    /// Stop cleanly when no event arrives for this long
    pub idle_timeout: Option<Duration>,
    /// Upper bound for consumers to stop after shutdown is signalled
    pub drain_timeout: Duration,
    /// Create missing topics with these settings
    pub auto_create: Option<TopicSpec>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            environment: "default".to_string(),
            channel_capacity: 1024,
            idle_timeout: None,
            drain_timeout: Duration::from_secs(5),
            auto_create: None,
        }
    }
}

struct PlannedPartition {
    tp: TopicPartition,
    pair: CheckpointPair,
}

/// Runs partition consumers for a set of topics.
pub struct Orchestrator {
    client: Arc<dyn BrokerClient>,
    store: Arc<dyn OffsetStore>,
    config: OrchestratorConfig,
    state: Arc<watch::Sender<OrchestratorState>>,
    stats: Arc<ConsumptionStats>,
    progress: DashMap<TopicPartition, i64>,
    started: AtomicBool,
}

impl Orchestrator {
    pub fn new(
        client: Arc<dyn BrokerClient>,
        store: Arc<dyn OffsetStore>,
        config: OrchestratorConfig,
    ) -> Self {
        let (state, _) = watch::channel(OrchestratorState::Idle);
        Self {
            client,
            store,
            config,
            state: Arc::new(state),
            stats: Arc::new(ConsumptionStats::new()),
            progress: DashMap::new(),
            started: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> OrchestratorState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<OrchestratorState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> Arc<ConsumptionStats> {
        self.stats.clone()
    }

    pub fn environment(&self) -> &str {
        &self.config.environment
    }

    /// Start consuming.
    ///
    /// All metadata is fetched before any consumer is spawned, so startup
    /// errors leave nothing running. Cancelling `shutdown` stops every
    /// partition consumer.
    pub async fn start(
        &self,
        topics: BTreeMap<String, PartitionCheckpoints>,
        mut shutdown: watch::Receiver<bool>,
    ) -> ConsumerResult<ConsumerStreams> {
        if topics.is_empty() {
            return Err(ConsumerError::NoTopics);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ConsumerError::AlreadyStarted);
        }

        set_state(&self.state, OrchestratorState::FetchingMetadata);
        let plan = tokio::select! {
            biased;
            _ = cancelled(&mut shutdown) => None,
            plan = self.plan(&topics) => Some(plan),
        };

        let plan = match plan {
            Some(Ok(plan)) => plan,
            Some(Err(e)) => {
                set_state(&self.state, OrchestratorState::Closed);
                return Err(e);
            }
            None => {
                info!("Cancelled while fetching metadata");
                set_state(&self.state, OrchestratorState::Closed);
                return Ok(self.finished_streams(ShutdownReason::Cancelled));
            }
        };

        let (event_tx, event_rx) = mpsc::channel(self.config.channel_capacity);
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = shutdown::channel();

        let mut tasks = JoinSet::new();
        let planned: Vec<TopicPartition> = plan.iter().map(|p| p.tp.clone()).collect();
        for PlannedPartition { tp, pair } in plan {
            let mut consumer = PartitionConsumer::new(
                tp.topic.clone(),
                tp.partition,
                pair,
                self.config.environment.clone(),
                self.client.clone(),
                self.store.clone(),
            )
            .with_stats(self.stats.clone())
            .with_error_reporter(error_tx.clone());
            let sink = event_tx.clone();
            let stop = stop_rx.clone();
            tasks.spawn(async move {
                let result = consumer.run(sink, stop).await;
                (tp, result)
            });
        }
        // Consumers hold the only senders from here on.
        drop(event_tx);

        info!(
            topics = topics.len(),
            partitions = planned.len(),
            environment = %self.config.environment,
            "Started partition consumers"
        );
        self.stats.touch();
        set_state(&self.state, OrchestratorState::Running);

        let supervisor = Supervisor {
            tasks,
            planned,
            outcomes: BTreeMap::new(),
            external: shutdown,
            stop: stop_tx,
            errors: error_tx,
            state: self.state.clone(),
            stats: self.stats.clone(),
            idle_timeout: self.config.idle_timeout,
            drain_timeout: self.config.drain_timeout,
        };
        let completion = tokio::spawn(supervisor.run());

        Ok(ConsumerStreams {
            events: event_rx,
            errors: error_rx,
            completion,
        })
    }

    /// Streams for a run that ended before any consumer was spawned.
    fn finished_streams(&self, reason: ShutdownReason) -> ConsumerStreams {
        let (_, events) = mpsc::channel(1);
        let (_, errors) = mpsc::unbounded_channel();
        ConsumerStreams {
            events,
            errors,
            completion: tokio::spawn(async move { ConsumptionSummary::empty(reason) }),
        }
    }

    /// Resolve every partition of every topic to a checkpoint pair.
    async fn plan(
        &self,
        topics: &BTreeMap<String, PartitionCheckpoints>,
    ) -> ConsumerResult<Vec<PlannedPartition>> {
        let mut plan = Vec::new();

        for (topic, checkpoints) in topics {
            let partitions = self.fetch_partitions(topic).await?;

            for partition in checkpoints.overrides().keys() {
                if !partitions.contains(partition) {
                    warn!(
                        topic = %topic,
                        partition = partition,
                        "Checkpoint override names a partition the topic does not have"
                    );
                }
            }

            for partition in partitions {
                match checkpoints.get(partition) {
                    Resolution::UseOverride(pair) | Resolution::UseDefault(pair) => {
                        plan.push(PlannedPartition {
                            tp: TopicPartition::new(topic.clone(), partition),
                            pair,
                        });
                    }
                    Resolution::Excluded => {
                        debug!(topic = %topic, partition = partition, "Partition excluded");
                    }
                }
            }
        }

        Ok(plan)
    }

    /// List partitions, creating the topic once if it is missing and
    /// auto-creation is enabled.
    async fn fetch_partitions(&self, topic: &str) -> BrokerResult<Vec<i32>> {
        match self.client.list_partitions(topic).await {
            Err(BrokerError::TopicNotFound { .. }) if self.config.auto_create.is_some() => {
                let spec = self.config.auto_create.unwrap_or_default();
                info!(
                    topic = topic,
                    partitions = spec.partitions,
                    replication_factor = spec.replication_factor,
                    "Topic not found, creating it"
                );
                self.client.create_topic(topic, &spec).await?;
                self.client.list_partitions(topic).await
            }
            other => other,
        }
    }

    /// Record that `offset` of a partition has been processed.
    ///
    /// Progress never moves backwards: committing an older offset keeps the
    /// furthest next offset in memory and in the store. A store failure is logged and returned but does not affect
    /// consumption.
    pub async fn commit(&self, topic: &str, partition: i32, offset: i64) -> StoreResult<()> {
        let next = *self
            .progress
            .entry(TopicPartition::new(topic, partition))
            .and_modify(|current| *current = (*current).max(offset + 1))
            .or_insert(offset + 1);

        if let Err(e) = self
            .store
            .commit(&self.config.environment, topic, partition, next)
            .await
        {
            warn!(
                topic = topic,
                partition = partition,
                offset = offset,
                error = %e,
                "Failed to persist offset"
            );
            return Err(e);
        }
        Ok(())
    }

    /// Next offset to read for every partition committed during this run.
    pub fn progress(&self) -> BTreeMap<TopicPartition, i64> {
        self.progress
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}

fn set_state(state: &watch::Sender<OrchestratorState>, next: OrchestratorState) {
    let previous = state.send_replace(next);
    if previous != next {
        debug!(from = %previous, to = %next, "Orchestrator state transition");
    }
}

type TaskOutput = (TopicPartition, ConsumerResult<Termination>);

/// Waits for partition consumers and drives shutdown.
struct Supervisor {
    tasks: JoinSet<TaskOutput>,
    planned: Vec<TopicPartition>,
    outcomes: BTreeMap<TopicPartition, PartitionOutcome>,
    external: watch::Receiver<bool>,
    stop: watch::Sender<bool>,
    errors: mpsc::UnboundedSender<PartitionError>,
    state: Arc<watch::Sender<OrchestratorState>>,
    stats: Arc<ConsumptionStats>,
    idle_timeout: Option<Duration>,
    drain_timeout: Duration,
}

impl Supervisor {
    async fn run(mut self) -> ConsumptionSummary {
        let mut reason = ShutdownReason::Completed;

        while !self.tasks.is_empty() {
            let idle_deadline = self
                .idle_timeout
                .map(|timeout| self.stats.last_activity() + timeout);

            tokio::select! {
                joined = self.tasks.join_next() => {
                    if let Some(joined) = joined {
                        self.record(joined);
                    }
                }
                _ = cancelled(&mut self.external) => {
                    info!("Cancellation requested, stopping partition consumers");
                    reason = ShutdownReason::Cancelled;
                    break;
                }
                _ = sleep_until(idle_deadline) => {
                    if let Some(timeout) = self.idle_timeout {
                        if self.stats.idle_for() >= timeout {
                            info!(idle_secs = timeout.as_secs_f64(), "Idle timeout reached");
                            reason = ShutdownReason::IdleTimeout;
                            break;
                        }
                    }
                }
            }
        }

        if !self.tasks.is_empty() {
            self.drain().await;
        }

        set_state(&self.state, OrchestratorState::Closed);
        let summary = self.summary(reason);
        info!(
            reason = %summary.reason,
            partitions = summary.partitions.len(),
            consumed = summary.total_consumed(),
            "Consumption finished"
        );
        summary
    }

    /// Signal every consumer and wait for them, aborting after the drain timeout.
    async fn drain(&mut self) {
        set_state(&self.state, OrchestratorState::Draining);
        self.stop.send(true).ok();

        let deadline = Instant::now() + self.drain_timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.tasks.join_next()).await {
                Ok(Some(joined)) => self.record(joined),
                Ok(None) => return,
                Err(_) => {
                    warn!(
                        remaining = self.tasks.len(),
                        "Drain timeout expired, aborting partition consumers"
                    );
                    self.tasks.abort_all();
                    while self.tasks.join_next().await.is_some() {}
                    return;
                }
            }
        }
    }

    fn record(&mut self, joined: Result<TaskOutput, tokio::task::JoinError>) {
        match joined {
            Ok((tp, Ok(termination))) => {
                self.outcomes
                    .insert(tp, PartitionOutcome::Finished(termination));
            }
            Ok((tp, Err(e))) => {
                let message = e.to_string();
                self.errors
                    .send(PartitionError::new(tp.topic.clone(), tp.partition, e))
                    .ok();
                self.outcomes.insert(tp, PartitionOutcome::Failed(message));
            }
            Err(e) if e.is_panic() => {
                error!(error = %e, "Partition consumer panicked");
            }
            Err(_) => {}
        }
    }

    fn summary(self, reason: ShutdownReason) -> ConsumptionSummary {
        let mut outcomes = self.outcomes;
        let counters = self.stats.snapshot();

        let partitions = self
            .planned
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(|tp| {
                let outcome = outcomes.remove(&tp).unwrap_or(PartitionOutcome::Aborted);
                let counters = counters.get(&tp).copied().unwrap_or_default();
                let summary = PartitionSummary {
                    outcome,
                    consumed: counters.consumed,
                    last_offset: counters.last_offset,
                };
                (tp, summary)
            })
            .collect();

        ConsumptionSummary { reason, partitions }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::store::InMemoryOffsetStore;

    fn checkpoints(from: &[&str], to: &[&str], exclusive: bool) -> PartitionCheckpoints {
        PartitionCheckpoints::build(from, to, exclusive).unwrap()
    }

    fn orchestrator(broker: Arc<InMemoryBroker>, config: OrchestratorConfig) -> Orchestrator {
        Orchestrator::new(broker, Arc::new(InMemoryOffsetStore::new()), config)
    }

    #[tokio::test]
    async fn test_start_requires_topics() {
        let orch = orchestrator(Arc::new(InMemoryBroker::new()), OrchestratorConfig::default());
        let (_tx, rx) = shutdown::channel();
        assert!(matches!(
            orch.start(BTreeMap::new(), rx).await,
            Err(ConsumerError::NoTopics)
        ));
        assert_eq!(orch.state(), OrchestratorState::Idle);
    }

    #[tokio::test]
    async fn test_missing_topic_fails_before_spawning() {
        let broker = Arc::new(InMemoryBroker::new().with_topic("orders", 1));
        let orch = orchestrator(broker.clone(), OrchestratorConfig::default());
        let (_tx, rx) = shutdown::channel();

        let mut topics = BTreeMap::new();
        topics.insert("orders".to_string(), checkpoints(&["oldest"], &[], false));
        topics.insert("missing".to_string(), checkpoints(&["oldest"], &[], false));

        let result = orch.start(topics, rx).await;
        assert!(matches!(
            result,
            Err(ConsumerError::Broker(BrokerError::TopicNotFound { .. }))
        ));
        assert_eq!(orch.state(), OrchestratorState::Closed);
        assert_eq!(broker.open_streams(), 0);
    }

    #[tokio::test]
    async fn test_start_twice() {
        let broker = Arc::new(InMemoryBroker::new().with_topic("orders", 1));
        let orch = orchestrator(broker, OrchestratorConfig::default());
        let (_tx, rx) = shutdown::channel();

        let mut topics = BTreeMap::new();
        topics.insert("orders".to_string(), checkpoints(&["0"], &["0"], false));

        let streams = orch.start(topics.clone(), rx.clone()).await.unwrap();
        assert!(matches!(
            orch.start(topics, rx).await,
            Err(ConsumerError::AlreadyStarted)
        ));
        drop(streams);
    }

    #[tokio::test]
    async fn test_commit_tracks_progress() {
        let store = Arc::new(InMemoryOffsetStore::new());
        let orch = Orchestrator::new(
            Arc::new(InMemoryBroker::new()),
            store.clone(),
            OrchestratorConfig {
                environment: "dev".to_string(),
                ..Default::default()
            },
        );

        orch.commit("orders", 0, 9).await.unwrap();
        orch.commit("orders", 0, 4).await.unwrap();
        orch.commit("orders", 1, 0).await.unwrap();

        let progress = orch.progress();
        assert_eq!(progress.get(&TopicPartition::new("orders", 0)), Some(&10));
        assert_eq!(progress.get(&TopicPartition::new("orders", 1)), Some(&1));

        let stored = store.read_topic_offsets("dev", "orders").await.unwrap();
        assert_eq!(stored.get(0), Some(10));
        assert_eq!(stored.get(1), Some(1));
    }
}
