//! Lag between locally stored offsets and the broker.

use kreplay_types::RemoteOffset;
use serde::Serialize;
use tracing::debug;

use crate::broker::{BrokerClient, OffsetQuery};
use crate::error::BrokerError;
use crate::store::TopicOffsets;

/// Lag of one stored partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionLag {
    pub partition: i32,
    /// Next offset to read, as stored locally
    pub stored: i64,
    /// Newest offset on the broker
    pub remote: RemoteOffset,
    /// Messages not yet read; `None` when the remote offset is not known
    pub lag: Option<i64>,
}

/// Compute the lag of every partition in `offsets`.
///
/// Broker failures are reported per partition and never fail the whole report.
pub async fn partition_lags(
    client: &dyn BrokerClient,
    topic: &str,
    offsets: &TopicOffsets,
) -> Vec<PartitionLag> {
    let mut lags = Vec::with_capacity(offsets.offsets.len());

    for (&partition, &stored) in &offsets.offsets {
        let remote = match client
            .get_offset(topic, partition, OffsetQuery::Newest)
            .await
        {
            Ok(newest) => RemoteOffset::Known(newest),
            Err(BrokerError::TopicNotFound { .. } | BrokerError::PartitionNotFound { .. }) => {
                RemoteOffset::NotFound
            }
            Err(e) => {
                debug!(topic = topic, partition = partition, error = %e, "Lag lookup failed");
                RemoteOffset::Unknown(e.to_string())
            }
        };

        let lag = remote.known().map(|newest| (newest - stored).max(0));
        lags.push(PartitionLag {
            partition,
            stored,
            remote,
            lag,
        });
    }

    lags
}
