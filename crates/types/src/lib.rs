//! Core types shared across kreplay
//!
//! This crate provides the data structures exchanged between the consumer
//! core, the configuration layer and the command-line front-end.

pub mod events;
pub mod partitions;

pub use events::Event;
pub use partitions::{PartitionScope, RemoteOffset, TopicPartition};
