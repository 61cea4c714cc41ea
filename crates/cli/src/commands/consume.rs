//! Consume command - replay topics and partitions to stdout

use crate::{output::Formatter, CliError, CliResult};
use clap::Args;
use colored::Colorize;
use consumer::shutdown;
use consumer::store::OffsetStore;
use consumer::{
    BrokerClient, ConsumptionSummary, InMemoryOffsetStore, Orchestrator, OrchestratorConfig,
    PartitionCheckpoints, PartitionOutcome, TopicSpec,
};
use kreplay_config::KreplayConfig;
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Arguments of `kreplay consume`
#[derive(Args, Debug, Clone, Default)]
pub struct ConsumeArgs {
    /// Topics to consume
    #[arg(required = true, value_name = "TOPIC")]
    pub topics: Vec<String>,

    /// Start checkpoints: oldest, newest, local, an offset or a timestamp,
    /// optionally prefixed with `partition#`
    #[arg(long, value_delimiter = ',', value_name = "CHECKPOINT")]
    pub from: Vec<String>,

    /// Stop checkpoints: newest, an offset or a timestamp, optionally
    /// prefixed with `partition#`
    #[arg(long, value_delimiter = ',', value_name = "CHECKPOINT")]
    pub to: Vec<String>,

    /// Only consume partitions that have an explicit checkpoint
    #[arg(long)]
    pub exclusive: bool,

    /// Environment for local offsets
    #[arg(short, long, value_name = "ENV")]
    pub environment: Option<String>,

    /// Stop after this many seconds without events
    #[arg(long, value_name = "SECS")]
    pub idle_timeout: Option<u64>,

    /// Create missing topics
    #[arg(long)]
    pub auto_create: bool,

    /// Do not record consumed offsets
    #[arg(long)]
    pub no_commit: bool,

    /// Keep offsets in memory only
    #[arg(long)]
    pub no_store: bool,
}

impl ConsumeArgs {
    /// Apply flags that override configuration values
    pub fn apply_overrides(&self, config: &mut KreplayConfig) {
        if let Some(environment) = &self.environment {
            config.consumer.environment = environment.clone();
        }
        if let Some(idle) = self.idle_timeout {
            config.consumer.idle_timeout_secs = Some(idle);
        }
        if self.auto_create {
            config.consumer.auto_create.enabled = true;
        }
    }

    /// Checkpoints for every requested topic.
    ///
    /// The same checkpoints apply to all topics, so exclusive mode spans the
    /// whole invocation.
    pub fn checkpoints(&self) -> CliResult<BTreeMap<String, PartitionCheckpoints>> {
        let checkpoints = PartitionCheckpoints::build(&self.from, &self.to, self.exclusive)?;
        Ok(self
            .topics
            .iter()
            .map(|topic| (topic.clone(), checkpoints.clone()))
            .collect())
    }

    /// Execute the consume command
    pub async fn execute(&self, config: &KreplayConfig, formatter: &dyn Formatter) -> CliResult<()> {
        let topics = self.checkpoints()?;
        let client: Arc<dyn BrokerClient> = Arc::new(super::kafka_client(config)?);
        let store: Arc<dyn OffsetStore> = if self.no_store {
            Arc::new(InMemoryOffsetStore::new())
        } else {
            Arc::new(super::open_store(config).await?)
        };

        let orchestrator = Orchestrator::new(client, store, orchestrator_config(config));
        let (stop, shutdown) = shutdown::channel();
        let ctrl_c = tokio::spawn(cancel_on_ctrl_c(stop));

        let options = ReplayOptions {
            commit: !self.no_commit,
        };
        let mut stdout = io::stdout();
        let result = replay(&orchestrator, topics, shutdown, &options, formatter, &mut stdout).await;
        ctrl_c.abort();

        let summary = result?;
        print_summary(&summary);

        let failed = summary
            .partitions
            .values()
            .filter(|p| matches!(p.outcome, PartitionOutcome::Failed(_)))
            .count();
        if failed > 0 {
            return Err(CliError::OperationFailed(format!(
                "{} partition(s) failed",
                failed
            )));
        }
        Ok(())
    }
}

/// Build the orchestrator settings from the merged configuration
pub fn orchestrator_config(config: &KreplayConfig) -> OrchestratorConfig {
    let consumer = &config.consumer;
    OrchestratorConfig {
        environment: consumer.environment.clone(),
        channel_capacity: consumer.channel_capacity,
        idle_timeout: consumer.idle_timeout(),
        drain_timeout: consumer.drain_timeout(),
        auto_create: consumer.auto_create.enabled.then(|| TopicSpec {
            partitions: consumer.auto_create.partitions,
            replication_factor: consumer.auto_create.replication_factor,
        }),
    }
}

/// Options for [`replay`]
#[derive(Debug, Clone, Copy)]
pub struct ReplayOptions {
    /// Record every written event in the offset store
    pub commit: bool,
}

/// Run the orchestrator and write every event to `out`.
///
/// Stops early without error when `out` is closed by the reader.
pub async fn replay<W: Write>(
    orchestrator: &Orchestrator,
    topics: BTreeMap<String, PartitionCheckpoints>,
    shutdown: watch::Receiver<bool>,
    options: &ReplayOptions,
    formatter: &dyn Formatter,
    out: &mut W,
) -> CliResult<ConsumptionSummary> {
    let mut streams = orchestrator.start(topics, shutdown).await?;
    let mut errors_open = true;

    loop {
        tokio::select! {
            event = streams.events.recv() => {
                let Some(event) = event else { break };
                let line = formatter.format_event(&event)?;
                if let Err(e) = writeln!(out, "{}", line) {
                    if e.kind() == io::ErrorKind::BrokenPipe {
                        debug!("Output closed, stopping");
                        break;
                    }
                    return Err(e.into());
                }
                if options.commit {
                    // failures are logged by the orchestrator and do not stop the replay
                    orchestrator
                        .commit(&event.topic, event.partition, event.offset)
                        .await
                        .ok();
                }
            }
            error = streams.errors.recv(), if errors_open => {
                match error {
                    Some(error) => warn!(error = %error, "Partition error"),
                    None => errors_open = false,
                }
            }
        }
    }

    while let Ok(error) = streams.errors.try_recv() {
        warn!(error = %error, "Partition error");
    }
    out.flush()?;
    Ok(streams.wait().await?)
}

async fn cancel_on_ctrl_c(stop: watch::Sender<bool>) {
    if tokio::signal::ctrl_c().await.is_ok() {
        eprintln!("{}", "Interrupted, stopping consumers...".yellow());
        stop.send(true).ok();
    }
}

fn print_summary(summary: &ConsumptionSummary) {
    eprintln!(
        "{} {} event(s) from {} partition(s) ({})",
        "Done:".green().bold(),
        summary.total_consumed(),
        summary.partitions.len(),
        summary.reason
    );
    for (tp, partition) in &summary.partitions {
        if let PartitionOutcome::Failed(reason) = &partition.outcome {
            eprintln!("  {} {}: {}", "✗".red(), tp, reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::{JsonFormatter, PlainFormatter};
    use clap::Parser;
    use consumer::{InMemoryBroker, Resolution};

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        args: ConsumeArgs,
    }

    fn parse(args: &[&str]) -> ConsumeArgs {
        TestCli::try_parse_from(std::iter::once("kreplay").chain(args.iter().copied()))
            .unwrap()
            .args
    }

    #[test]
    fn test_parse_args() {
        let args = parse(&[
            "orders",
            "payments",
            "--from",
            "oldest,1#100",
            "--to",
            "newest",
            "--exclusive",
            "-e",
            "staging",
        ]);
        assert_eq!(args.topics, vec!["orders", "payments"]);
        assert_eq!(args.from, vec!["oldest", "1#100"]);
        assert_eq!(args.to, vec!["newest"]);
        assert!(args.exclusive);
        assert_eq!(args.environment.as_deref(), Some("staging"));
    }

    #[test]
    fn test_topics_required() {
        assert!(TestCli::try_parse_from(["kreplay"]).is_err());
    }

    #[test]
    fn test_checkpoints_shared_by_topics() {
        let args = parse(&["orders", "payments", "--from", "2#oldest", "--exclusive"]);
        let topics = args.checkpoints().unwrap();
        assert_eq!(topics.len(), 2);
        for checkpoints in topics.values() {
            assert_eq!(checkpoints.get(0), Resolution::Excluded);
            assert!(checkpoints.pair_for(2).is_some());
        }
    }

    #[test]
    fn test_invalid_stop_rejected() {
        let args = parse(&["orders", "--to", "oldest"]);
        assert!(matches!(
            args.checkpoints(),
            Err(CliError::Checkpoint(_))
        ));
    }

    #[test]
    fn test_apply_overrides() {
        let mut config = KreplayConfig::default();
        let args = parse(&["orders", "-e", "qa", "--idle-timeout", "30", "--auto-create"]);
        args.apply_overrides(&mut config);

        assert_eq!(config.consumer.environment, "qa");
        assert_eq!(config.consumer.idle_timeout_secs, Some(30));

        let orchestrator = orchestrator_config(&config);
        assert_eq!(orchestrator.environment, "qa");
        assert_eq!(orchestrator.idle_timeout, Some(std::time::Duration::from_secs(30)));
        assert!(orchestrator.auto_create.is_some());
    }

    fn seeded() -> Arc<InMemoryBroker> {
        let broker = InMemoryBroker::new().with_topic("orders", 2);
        for i in 0..3 {
            broker
                .produce("orders", i % 2, Some(b"k".as_slice()), format!("v{}", i).as_bytes())
                .unwrap();
        }
        Arc::new(broker)
    }

    #[tokio::test]
    async fn test_replay_writes_and_commits() {
        let store = Arc::new(InMemoryOffsetStore::new());
        let orchestrator = Orchestrator::new(
            seeded(),
            store.clone(),
            OrchestratorConfig {
                environment: "dev".to_string(),
                ..Default::default()
            },
        );
        let args = parse(&["orders", "--from", "oldest", "--to", "newest"]);
        let (_stop, shutdown) = shutdown::channel();
        let mut out = Vec::new();

        let summary = replay(
            &orchestrator,
            args.checkpoints().unwrap(),
            shutdown,
            &ReplayOptions { commit: true },
            &PlainFormatter,
            &mut out,
        )
        .await
        .unwrap();

        let text = String::from_utf8(out).unwrap();
        let mut lines: Vec<&str> = text.lines().collect();
        lines.sort();
        assert_eq!(
            lines,
            vec!["orders/0@0\tk\tv0", "orders/0@1\tk\tv2", "orders/1@0\tk\tv1"]
        );
        assert_eq!(summary.total_consumed(), 3);

        let stored = store.read_topic_offsets("dev", "orders").await.unwrap();
        assert_eq!(stored.get(0), Some(2));
        assert_eq!(stored.get(1), Some(1));
    }

    #[tokio::test]
    async fn test_replay_without_commit() {
        let store = Arc::new(InMemoryOffsetStore::new());
        let orchestrator = Orchestrator::new(seeded(), store.clone(), OrchestratorConfig::default());
        let args = parse(&["orders", "--from", "oldest", "--to", "newest"]);
        let (_stop, shutdown) = shutdown::channel();
        let mut out = Vec::new();

        replay(
            &orchestrator,
            args.checkpoints().unwrap(),
            shutdown,
            &ReplayOptions { commit: false },
            &JsonFormatter,
            &mut out,
        )
        .await
        .unwrap();

        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), 3);
        for line in text.lines() {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(value["topic"], "orders");
        }
        assert!(store.is_empty());
    }
}
