//! CLI command implementations

pub mod consume;
pub mod offsets;

pub use consume::ConsumeArgs;
pub use offsets::OffsetsCommand;

use crate::CliResult;
use consumer::{KafkaBrokerClient, KafkaClientConfig, SledOffsetStore, SledStoreConfig};
use kreplay_config::KreplayConfig;
use tracing::debug;

/// Create the broker client from the merged configuration
pub fn kafka_client(config: &KreplayConfig) -> CliResult<KafkaBrokerClient> {
    let kafka = &config.kafka;
    debug!(brokers = %kafka.brokers, client_id = %kafka.client_id, "Creating broker client");
    Ok(KafkaBrokerClient::new(KafkaClientConfig {
        brokers: kafka.brokers.clone(),
        client_id: kafka.client_id.clone(),
        metadata_timeout: kafka.metadata_timeout(),
        extra: kafka.extra.clone(),
    })?)
}

/// Open the on-disk offset store
pub async fn open_store(config: &KreplayConfig) -> CliResult<SledOffsetStore> {
    debug!(path = %config.store.path.display(), "Opening offset store");
    Ok(SledOffsetStore::open(SledStoreConfig::new(&config.store.path)).await?)
}
