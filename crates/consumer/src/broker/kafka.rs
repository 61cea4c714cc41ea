//! rdkafka-backed broker client.
//!
//! Metadata and offset lookups go through one shared `BaseConsumer` and run on
//! the blocking pool. Every partition stream gets its own `StreamConsumer`
//! assigned to exactly that partition, with a throwaway group id and no
//! offset commits, so consumption never joins a consumer group.

use async_trait::async_trait;
use chrono::DateTime;
use futures::stream::{self, StreamExt};
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer, StreamConsumer};
use rdkafka::error::KafkaError as RdKafkaError;
use rdkafka::message::BorrowedMessage;
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{Message, Offset, TopicPartitionList};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use super::{BrokerClient, MessageStream, OffsetQuery, RawMessage, TopicSpec};
use crate::error::{BrokerError, BrokerResult};

/// Connection settings for [`KafkaBrokerClient`].
#[derive(Debug, Clone)]
pub struct KafkaClientConfig {
    /// Comma-separated bootstrap servers
    pub brokers: String,
    pub client_id: String,
    /// Timeout for metadata, watermark and admin requests
    pub metadata_timeout: Duration,
    /// Raw librdkafka properties applied last
    pub extra: HashMap<String, String>,
}

impl Default for KafkaClientConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            client_id: "kreplay".to_string(),
            metadata_timeout: Duration::from_secs(10),
            extra: HashMap::new(),
        }
    }
}

impl KafkaClientConfig {
    fn client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &self.brokers)
            .set("client.id", &self.client_id);

        for (key, value) in &self.extra {
            client_config.set(key, value);
        }
        client_config
    }

    /// Settings for a single-partition reader that never commits.
    fn reader_config(&self) -> ClientConfig {
        let mut client_config = self.client_config();
        client_config
            .set("group.id", format!("kreplay-{}", Uuid::new_v4()))
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest");
        client_config
    }

    fn timeout_ms(&self) -> u64 {
        self.metadata_timeout.as_millis() as u64
    }
}

/// Broker client talking to a Kafka cluster through rdkafka.
pub struct KafkaBrokerClient {
    config: KafkaClientConfig,
    metadata: Arc<BaseConsumer>,
    admin: AdminClient<DefaultClientContext>,
}

impl KafkaBrokerClient {
    pub fn new(config: KafkaClientConfig) -> BrokerResult<Self> {
        let metadata: BaseConsumer = config.reader_config().create()?;
        let admin: AdminClient<DefaultClientContext> = config.client_config().create()?;

        info!(brokers = %config.brokers, "Created Kafka broker client");
        Ok(Self {
            config,
            metadata: Arc::new(metadata),
            admin,
        })
    }

    /// Run a blocking librdkafka call on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> BrokerResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&BaseConsumer, Duration) -> BrokerResult<T> + Send + 'static,
    {
        let consumer = self.metadata.clone();
        let timeout = self.config.metadata_timeout;
        tokio::task::spawn_blocking(move || f(&consumer, timeout))
            .await
            .map_err(|e| BrokerError::client(format!("blocking task failed: {}", e), None))?
    }
}

fn is_unknown(code: RDKafkaErrorCode) -> bool {
    matches!(
        code,
        RDKafkaErrorCode::UnknownTopicOrPartition
            | RDKafkaErrorCode::UnknownTopic
            | RDKafkaErrorCode::UnknownPartition
    )
}

/// Map a per-partition lookup failure, keeping not-found distinct.
fn lookup_error(err: RdKafkaError, topic: &str, partition: i32) -> BrokerError {
    match err.rdkafka_error_code() {
        Some(code) if is_unknown(code) => BrokerError::partition_not_found(topic, partition),
        _ => err.into(),
    }
}

fn raw_message(msg: &BorrowedMessage<'_>) -> RawMessage {
    RawMessage {
        key: msg.key().map(<[u8]>::to_vec),
        value: msg.payload().map(<[u8]>::to_vec),
        timestamp: msg
            .timestamp()
            .to_millis()
            .and_then(DateTime::from_timestamp_millis),
        offset: msg.offset(),
    }
}

#[async_trait]
impl BrokerClient for KafkaBrokerClient {
    async fn list_partitions(&self, topic: &str) -> BrokerResult<Vec<i32>> {
        let topic = topic.to_string();
        self.blocking(move |consumer, timeout| {
            let metadata = consumer.fetch_metadata(Some(topic.as_str()), timeout)?;
            let entry = metadata
                .topics()
                .iter()
                .find(|t| t.name() == topic)
                .ok_or_else(|| BrokerError::topic_not_found(&topic))?;

            if let Some(err) = entry.error() {
                let code = RDKafkaErrorCode::from(err);
                return Err(if is_unknown(code) {
                    BrokerError::topic_not_found(&topic)
                } else {
                    BrokerError::client(
                        format!("metadata error for topic '{}': {}", topic, code),
                        Some(format!("{:?}", code)),
                    )
                });
            }

            let mut partitions: Vec<i32> = entry.partitions().iter().map(|p| p.id()).collect();
            if partitions.is_empty() {
                return Err(BrokerError::topic_not_found(&topic));
            }
            partitions.sort_unstable();
            debug!(topic = %topic, partitions = partitions.len(), "Fetched topic metadata");
            Ok(partitions)
        })
        .await
    }

    async fn get_offset(
        &self,
        topic: &str,
        partition: i32,
        query: OffsetQuery,
    ) -> BrokerResult<i64> {
        let topic = topic.to_string();
        let timeout_ms = self.config.timeout_ms();
        self.blocking(move |consumer, timeout| {
            let watermarks = |consumer: &BaseConsumer| {
                consumer
                    .fetch_watermarks(&topic, partition, timeout)
                    .map_err(|e| lookup_error(e, &topic, partition))
            };

            match query {
                OffsetQuery::Oldest => watermarks(consumer).map(|(low, _)| low),
                OffsetQuery::Newest => watermarks(consumer).map(|(_, high)| high),
                OffsetQuery::Timestamp(ts) => {
                    let mut tpl = TopicPartitionList::new();
                    tpl.add_partition_offset(
                        &topic,
                        partition,
                        Offset::Offset(ts.timestamp_millis()),
                    )?;
                    let resolved = consumer
                        .offsets_for_times(tpl, timeout)
                        .map_err(|e| lookup_error(e, &topic, partition))?;

                    let elem = resolved
                        .find_partition(&topic, partition)
                        .ok_or_else(|| BrokerError::partition_not_found(&topic, partition))?;
                    elem.error().map_err(|e| lookup_error(e, &topic, partition))?;

                    match elem.offset() {
                        Offset::Offset(offset) => Ok(offset),
                        // No message at or after the timestamp
                        Offset::End => watermarks(consumer).map(|(_, high)| high),
                        other => Err(BrokerError::timeout(
                            format!(
                                "offsets_for_times on {}/{} returned {:?}",
                                topic, partition, other
                            ),
                            timeout_ms,
                        )),
                    }
                }
            }
        })
        .await
    }

    async fn consume_partition(
        &self,
        topic: &str,
        partition: i32,
        start_offset: i64,
    ) -> BrokerResult<MessageStream> {
        let consumer: StreamConsumer = self.config.reader_config().create()?;

        let mut assignment = TopicPartitionList::new();
        assignment.add_partition_offset(topic, partition, Offset::Offset(start_offset))?;
        consumer.assign(&assignment)?;

        debug!(
            topic = topic,
            partition = partition,
            start_offset = start_offset,
            "Assigned partition reader"
        );

        Ok(stream::unfold(consumer, |consumer| async move {
            let item = match consumer.recv().await {
                Ok(msg) => Ok(raw_message(&msg)),
                Err(e) => Err(BrokerError::from(e)),
            };
            Some((item, consumer))
        })
        .boxed())
    }

    async fn create_topic(&self, topic: &str, spec: &TopicSpec) -> BrokerResult<()> {
        let new_topic = NewTopic::new(
            topic,
            spec.partitions,
            TopicReplication::Fixed(spec.replication_factor),
        );
        let options = AdminOptions::new().operation_timeout(Some(self.config.metadata_timeout));

        let results = self.admin.create_topics([&new_topic], &options).await?;
        for result in results {
            match result {
                Ok(name) => info!(topic = %name, partitions = spec.partitions, "Created topic"),
                Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    debug!(topic = %name, "Topic already exists")
                }
                Err((name, code)) => {
                    return Err(BrokerError::client(
                        format!("failed to create topic '{}': {}", name, code),
                        Some(format!("{:?}", code)),
                    ))
                }
            }
        }
        Ok(())
    }
}
