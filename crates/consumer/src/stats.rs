//! Consumption statistics shared by all partition consumers of one run.

use dashmap::DashMap;
use kreplay_types::TopicPartition;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Counters for a single partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionCounters {
    pub consumed: u64,
    pub last_offset: Option<i64>,
}

/// Event counters and last-activity tracking.
#[derive(Debug)]
pub struct ConsumptionStats {
    partitions: DashMap<TopicPartition, PartitionCounters>,
    total: AtomicU64,
    started: Instant,
    last_activity: Mutex<Instant>,
}

impl Default for ConsumptionStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsumptionStats {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            partitions: DashMap::new(),
            total: AtomicU64::new(0),
            started: now,
            last_activity: Mutex::new(now),
        }
    }

    /// Record one event delivered from a partition.
    pub fn record(&self, topic: &str, partition: i32, offset: i64) {
        let mut counters = self
            .partitions
            .entry(TopicPartition::new(topic, partition))
            .or_default();
        counters.consumed += 1;
        counters.last_offset = Some(offset);
        drop(counters);

        self.total.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    /// Mark activity without an event.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn total_consumed(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn partition(&self, topic: &str, partition: i32) -> Option<PartitionCounters> {
        self.partitions
            .get(&TopicPartition::new(topic, partition))
            .map(|c| *c)
    }

    /// Counters for every partition that delivered at least one event.
    pub fn snapshot(&self) -> BTreeMap<TopicPartition, PartitionCounters> {
        self.partitions
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    /// Time since the last event.
    pub fn idle_for(&self) -> Duration {
        self.last_activity().elapsed()
    }

    /// Average events per second since the stats were created.
    pub fn throughput(&self) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.total_consumed() as f64 / elapsed
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record() {
        let stats = ConsumptionStats::new();
        stats.record("orders", 0, 10);
        stats.record("orders", 0, 11);
        stats.record("orders", 1, 3);

        assert_eq!(stats.total_consumed(), 3);
        assert_eq!(
            stats.partition("orders", 0),
            Some(PartitionCounters {
                consumed: 2,
                last_offset: Some(11),
            })
        );
        assert_eq!(stats.partition("orders", 2), None);
        assert_eq!(stats.snapshot().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_tracking() {
        let stats = ConsumptionStats::new();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(stats.idle_for(), Duration::from_secs(5));

        stats.record("orders", 0, 1);
        assert_eq!(stats.idle_for(), Duration::ZERO);
    }
}
