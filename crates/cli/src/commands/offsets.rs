//! Offsets command - inspect and delete locally stored offsets

use crate::{
    output::{Formatter, OffsetRow},
    CliResult,
};
use clap::Subcommand;
use colored::Colorize;
use consumer::store::{OffsetFilter, OffsetStore, TopicOffsets};
use consumer::{partition_lags, BrokerClient};
use kreplay_config::KreplayConfig;
use std::collections::BTreeMap;
use tracing::debug;

/// Offsets command variants
#[derive(Subcommand, Debug, Clone)]
pub enum OffsetsCommand {
    /// List stored offsets
    #[command(name = "list", about = "List locally stored offsets")]
    List {
        /// Only environments matching this regular expression
        #[arg(long, short, value_name = "REGEX")]
        environment: Option<String>,

        /// Only topics matching this regular expression
        #[arg(long, short, value_name = "REGEX")]
        topic: Option<String>,

        /// Compare against the newest offsets on the broker
        #[arg(long)]
        lag: bool,
    },

    /// Delete stored offsets
    #[command(name = "delete", about = "Delete the offsets of an environment or one of its topics")]
    Delete {
        /// Environment to delete from
        environment: String,

        /// Only delete this topic
        topic: Option<String>,
    },
}

impl OffsetsCommand {
    /// Execute the offsets command
    pub async fn execute(&self, config: &KreplayConfig, formatter: &dyn Formatter) -> CliResult<()> {
        let store = super::open_store(config).await?;

        match self {
            OffsetsCommand::List {
                environment,
                topic,
                lag,
            } => {
                let filter = OffsetFilter::new(environment.as_deref(), topic.as_deref())?;
                let rows = if *lag {
                    let client = super::kafka_client(config)?;
                    list_offsets(&store, &filter, Some(&client as &dyn BrokerClient)).await?
                } else {
                    list_offsets(&store, &filter, None).await?
                };
                println!("{}", formatter.format_offsets(&rows)?);
            }
            OffsetsCommand::Delete { environment, topic } => {
                let removed = store.delete(environment, topic.as_deref()).await?;
                let scope = match topic {
                    Some(topic) => format!("{} in {}", topic, environment),
                    None => environment.clone(),
                };
                if removed == 0 {
                    eprintln!("{} nothing stored for {}", "Note:".yellow(), scope);
                } else {
                    eprintln!(
                        "{} deleted {} topic record(s) for {}",
                        "✓".green(),
                        removed,
                        scope
                    );
                }
            }
        }

        Ok(())
    }
}

/// Stored offsets matching `filter`, with lag when a broker client is given
pub async fn list_offsets(
    store: &dyn OffsetStore,
    filter: &OffsetFilter,
    client: Option<&dyn BrokerClient>,
) -> CliResult<Vec<OffsetRow>> {
    let records = store.list_all(filter).await?;
    let mut rows: Vec<OffsetRow> = records.into_iter().map(OffsetRow::from).collect();

    let Some(client) = client else {
        return Ok(rows);
    };

    let mut by_topic: BTreeMap<(String, String), TopicOffsets> = BTreeMap::new();
    for row in &rows {
        by_topic
            .entry((row.environment.clone(), row.topic.clone()))
            .or_default()
            .offsets
            .insert(row.partition, row.offset);
    }

    for ((environment, topic), offsets) in by_topic {
        debug!(environment = %environment, topic = %topic, "Computing lag");
        for lag in partition_lags(client, &topic, &offsets).await {
            if let Some(row) = rows.iter_mut().find(|r| {
                r.environment == environment && r.topic == topic && r.partition == lag.partition
            }) {
                row.remote = Some(lag.remote);
                row.lag = lag.lag;
            }
        }
    }

    Ok(rows)
}
