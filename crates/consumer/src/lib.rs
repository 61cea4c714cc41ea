//! Topic and partition replay engine.
//!
//! This crate turns checkpoint expressions into per-partition start/stop
//! positions, consumes every selected partition concurrently and merges the
//! results into a single event stream.
//!
//! # Components
//!
//! - **Checkpoints**: parsing of `oldest`, `newest`, `local`, offsets and timestamps
//! - **Resolver**: per-partition overrides and exclusive mode
//! - **Store**: locally persisted offsets, grouped by environment
//! - **Broker**: a narrow client facade with Kafka and in-memory backends
//! - **Partition consumer**: one partition from start to stop
//! - **Orchestrator**: fan-in of all partition consumers and shutdown
//!
//! # Example
//!
//! ```rust,no_run
//! use consumer::broker::{KafkaBrokerClient, KafkaClientConfig};
//! use consumer::orchestrator::{Orchestrator, OrchestratorConfig};
//! use consumer::resolver::PartitionCheckpoints;
//! use consumer::store::{SledOffsetStore, SledStoreConfig};
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = KafkaBrokerClient::new(KafkaClientConfig::default())?;
//! let store = SledOffsetStore::open(SledStoreConfig::new("/tmp/kreplay")).await?;
//! let orchestrator = Orchestrator::new(
//!     Arc::new(client),
//!     Arc::new(store),
//!     OrchestratorConfig::default(),
//! );
//!
//! let mut topics = BTreeMap::new();
//! topics.insert(
//!     "orders".to_string(),
//!     PartitionCheckpoints::build(&["oldest"], &["newest"], false)?,
//! );
//!
//! let (_stop, shutdown) = consumer::shutdown::channel();
//! let mut streams = orchestrator.start(topics, shutdown).await?;
//! while let Some(event) = streams.events.recv().await {
//!     println!("{}@{}", event.topic_partition(), event.offset);
//!     orchestrator.commit(&event.topic, event.partition, event.offset).await.ok();
//! }
//! let summary = streams.wait().await?;
//! println!("consumed {} events", summary.total_consumed());
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod checkpoint;
pub mod error;
pub mod lag;
pub mod orchestrator;
pub mod partition;
pub mod resolver;
pub mod shutdown;
pub mod stats;
pub mod store;

pub use broker::{BrokerClient, InMemoryBroker, KafkaBrokerClient, KafkaClientConfig, TopicSpec};
pub use checkpoint::{Checkpoint, CheckpointPair, Predefined};
pub use error::{
    BrokerError, CheckpointError, ConsumerError, ConsumerResult, PartitionError, StoreError,
};
pub use lag::{partition_lags, PartitionLag};
pub use orchestrator::{
    ConsumerStreams, ConsumptionSummary, Orchestrator, OrchestratorConfig, OrchestratorState,
    PartitionOutcome, ShutdownReason,
};
pub use partition::{PartitionConsumer, PartitionState, Termination};
pub use resolver::{PartitionCheckpoints, Resolution};
pub use stats::ConsumptionStats;
pub use store::{InMemoryOffsetStore, OffsetFilter, OffsetStore, SledOffsetStore, SledStoreConfig};
