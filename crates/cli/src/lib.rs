//! kreplay command-line interface
//!
//! Replays Kafka topics and partitions between checkpoints and manages the
//! locally stored offsets used to resume them.

pub mod commands;
pub mod error;
pub mod output;

pub use error::{CliError, CliResult};
