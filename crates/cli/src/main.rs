//! kreplay CLI
//!
//! Replay Kafka topics and partitions from the command line.

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use colored::Colorize;
use kreplay_cli::{
    commands::{ConsumeArgs, OffsetsCommand},
    output::{get_formatter, OutputFormat},
};
use kreplay_config::{KreplayConfig, LoggingConfig};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "kreplay",
    version,
    about = "Replay Kafka topics and partitions between checkpoints",
    long_about = "Replay Kafka topics and partitions between checkpoints.\n\n\
                  Checkpoints are oldest, newest, local, an offset or a timestamp,\n\
                  optionally prefixed with `partition#` to target one partition."
)]
struct Cli {
    /// Configuration file
    #[arg(
        short,
        long,
        env = "KREPLAY_CONFIG",
        global = true,
        value_name = "FILE",
        help = "Path to configuration file"
    )]
    config: Option<PathBuf>,

    /// Bootstrap servers
    #[arg(long, short = 'b', global = true, value_name = "BROKERS")]
    brokers: Option<String>,

    /// Output format
    #[arg(long, short = 'f', global = true, value_enum, default_value_t = OutputFormat::Plain)]
    format: OutputFormat,

    /// Verbose output
    #[arg(short, long, global = true, help = "Enable debug logging")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume topics between checkpoints
    #[command(name = "consume", about = "Consume topics between checkpoints")]
    Consume(ConsumeArgs),

    /// Locally stored offsets
    #[command(name = "offsets", about = "Inspect and delete locally stored offsets")]
    Offsets {
        #[command(subcommand)]
        command: OffsetsCommand,
    },

    /// Generate shell completions
    #[command(name = "completions", about = "Generate shell completions")]
    Completions {
        /// Shell type
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        let bin_name = cmd.get_name().to_string();
        clap_complete::generate(*shell, &mut cmd, bin_name, &mut std::io::stdout());
        return Ok(());
    }

    let mut config =
        KreplayConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    // Override with CLI arguments
    if let Some(brokers) = &cli.brokers {
        config.kafka.brokers = brokers.clone();
    }
    if let Commands::Consume(args) = &cli.command {
        args.apply_overrides(&mut config);
    }
    config.validate()?;

    init_tracing(&config.logging, cli.verbose);

    let formatter = get_formatter(cli.format);
    match &cli.command {
        Commands::Consume(args) => args.execute(&config, formatter.as_ref()).await?,
        Commands::Offsets { command } => command.execute(&config, formatter.as_ref()).await?,
        Commands::Completions { .. } => {
            // Already handled above
        }
    }

    Ok(())
}

/// Initialize tracing/logging on stderr
fn init_tracing(logging: &LoggingConfig, verbose: bool) {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "kreplay={level},kreplay_cli={level},consumer={level}",
            level = level
        ))
    });

    let registry = tracing_subscriber::registry().with(filter);
    if logging.json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}
