//! Per-partition checkpoint resolution.
//!
//! [`PartitionCheckpoints`] merges a global default start/stop pair with
//! `partition#expression` overrides. It is built once from the user's
//! expressions and then queried by every partition consumer.

use std::collections::{BTreeMap, BTreeSet};

use kreplay_types::PartitionScope;
use tracing::debug;

use crate::checkpoint::{Checkpoint, CheckpointPair};
use crate::error::{CheckpointError, CheckpointResult};

/// How a single partition should be consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The partition has its own override
    UseOverride(CheckpointPair),
    /// The partition follows the global default
    UseDefault(CheckpointPair),
    /// Exclusive mode is active and the partition has no override
    Excluded,
}

impl Resolution {
    /// The pair to consume with, if the partition is not excluded.
    pub fn pair(&self) -> Option<CheckpointPair> {
        match self {
            Resolution::UseOverride(pair) | Resolution::UseDefault(pair) => Some(*pair),
            Resolution::Excluded => None,
        }
    }
}

/// Start/stop checkpoints for every partition of a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionCheckpoints {
    default: CheckpointPair,
    overrides: BTreeMap<i32, CheckpointPair>,
    exclusive: bool,
}

impl Default for PartitionCheckpoints {
    fn default() -> Self {
        Self {
            default: CheckpointPair::default(),
            overrides: BTreeMap::new(),
            exclusive: false,
        }
    }
}

impl PartitionCheckpoints {
    /// Build from ordered "from" and "to" expressions.
    ///
    /// Later expressions for the same scope replace earlier ones. A global
    /// "to" expression also applies to every override that has no "to" of its
    /// own. Any invalid expression or pair fails the whole build.
    pub fn build<S: AsRef<str>>(
        from_exprs: &[S],
        to_exprs: &[S],
        exclusive: bool,
    ) -> CheckpointResult<Self> {
        let mut default = CheckpointPair::default();
        let mut overrides: BTreeMap<i32, CheckpointPair> = BTreeMap::new();
        let mut explicit_to: BTreeSet<i32> = BTreeSet::new();

        for raw in from_exprs {
            let (scope, checkpoint) = parse_token(raw.as_ref(), false)?;
            match scope {
                PartitionScope::All => default.from = checkpoint,
                PartitionScope::Partition(p) => {
                    overrides
                        .entry(p)
                        .or_insert(CheckpointPair {
                            from: checkpoint,
                            to: default.to,
                        })
                        .from = checkpoint;
                }
            }
        }

        for raw in to_exprs {
            let (scope, checkpoint) = parse_token(raw.as_ref(), true)?;
            match scope {
                PartitionScope::All => {
                    default.to = Some(checkpoint);
                    for (partition, pair) in overrides.iter_mut() {
                        if !explicit_to.contains(partition) {
                            pair.to = Some(checkpoint);
                        }
                    }
                }
                PartitionScope::Partition(p) => {
                    overrides
                        .entry(p)
                        .or_insert(CheckpointPair {
                            from: default.from,
                            to: None,
                        })
                        .to = Some(checkpoint);
                    explicit_to.insert(p);
                }
            }
        }

        default.validate("all partitions")?;
        for (partition, pair) in &overrides {
            pair.validate(&format!("partition {}", partition))?;
        }

        let checkpoints = Self {
            exclusive: exclusive && !overrides.is_empty(),
            default,
            overrides,
        };
        debug!(
            default = %checkpoints.default,
            overrides = checkpoints.overrides.len(),
            exclusive = checkpoints.exclusive,
            "Built partition checkpoints"
        );
        Ok(checkpoints)
    }

    /// Resolve the checkpoints for one partition.
    pub fn get(&self, partition: i32) -> Resolution {
        match self.overrides.get(&partition) {
            Some(pair) => Resolution::UseOverride(*pair),
            None if self.exclusive => Resolution::Excluded,
            None => Resolution::UseDefault(self.default),
        }
    }

    /// The pair for one partition, or `None` when it must not be consumed.
    pub fn pair_for(&self, partition: i32) -> Option<CheckpointPair> {
        self.get(partition).pair()
    }

    /// The pair used by partitions without an override.
    pub fn default_pair(&self) -> CheckpointPair {
        self.default
    }

    /// Partition overrides, ordered by partition.
    pub fn overrides(&self) -> &BTreeMap<i32, CheckpointPair> {
        &self.overrides
    }

    /// Whether partitions without an override are excluded.
    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    /// Whether any pair starts from the local offset store.
    pub fn uses_local(&self) -> bool {
        self.default.from == Checkpoint::Local
            || self.overrides.values().any(|p| p.from == Checkpoint::Local)
    }
}

/// Split an optional `partition#` prefix from a token and parse the rest.
fn parse_token(raw: &str, is_stop: bool) -> CheckpointResult<(PartitionScope, Checkpoint)> {
    let token = raw.trim();
    match token.split_once('#') {
        Some((prefix, expr)) => {
            let partition = prefix
                .trim()
                .parse::<i32>()
                .ok()
                .filter(|p| *p >= 0)
                .ok_or_else(|| CheckpointError::InvalidPartition {
                    input: prefix.to_string(),
                })?;
            let checkpoint = Checkpoint::parse(expr, is_stop)?;
            Ok((PartitionScope::Partition(partition), checkpoint))
        }
        None => Ok((PartitionScope::All, Checkpoint::parse(token, is_stop)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NONE: &[&str] = &[];

    #[test]
    fn test_defaults() {
        let cps = PartitionCheckpoints::build(NONE, NONE, false).unwrap();
        assert_eq!(cps.default_pair(), CheckpointPair::default());
        assert_eq!(cps.get(7), Resolution::UseDefault(CheckpointPair::default()));
        assert!(!cps.uses_local());
    }

    #[test]
    fn test_last_global_wins() {
        let cps = PartitionCheckpoints::build(&["newest", "oldest", "100"], NONE, false).unwrap();
        assert_eq!(cps.default_pair().from, Checkpoint::Explicit(100));
        assert_eq!(cps.default_pair().to, None);
        assert!(cps.overrides().is_empty());
    }

    #[test]
    fn test_partition_override() {
        let cps = PartitionCheckpoints::build(&["0#50"], &["0#100"], false).unwrap();
        let expected = CheckpointPair {
            from: Checkpoint::Explicit(50),
            to: Some(Checkpoint::Explicit(100)),
        };
        assert_eq!(cps.get(0), Resolution::UseOverride(expected));
        assert_eq!(cps.get(1), Resolution::UseDefault(CheckpointPair::default()));

        let cps = PartitionCheckpoints::build(&["0#50"], &["0#100"], true).unwrap();
        assert_eq!(cps.pair_for(0), Some(expected));
        assert_eq!(cps.get(1), Resolution::Excluded);
        assert_eq!(cps.pair_for(1), None);
    }

    #[test]
    fn test_exclusive_without_overrides_consumes_everything() {
        let cps = PartitionCheckpoints::build(&["oldest"], NONE, true).unwrap();
        assert!(!cps.is_exclusive());
        assert_eq!(cps.pair_for(3).map(|p| p.from), Some(Checkpoint::OLDEST));
    }

    #[test]
    fn test_global_to_propagates_to_overrides() {
        let cps =
            PartitionCheckpoints::build(&["oldest", "1#10", "2#20"], &["2#25", "500"], false)
                .unwrap();

        assert_eq!(cps.default_pair().to, Some(Checkpoint::Explicit(500)));
        assert_eq!(
            cps.pair_for(1),
            Some(CheckpointPair {
                from: Checkpoint::Explicit(10),
                to: Some(Checkpoint::Explicit(500)),
            })
        );
        assert_eq!(
            cps.pair_for(2),
            Some(CheckpointPair {
                from: Checkpoint::Explicit(20),
                to: Some(Checkpoint::Explicit(25)),
            })
        );
    }

    #[test]
    fn test_to_only_override_inherits_default_from() {
        let cps = PartitionCheckpoints::build(&["local"], &["3#90"], false).unwrap();
        assert_eq!(
            cps.pair_for(3),
            Some(CheckpointPair {
                from: Checkpoint::Local,
                to: Some(Checkpoint::Explicit(90)),
            })
        );
        assert!(cps.uses_local());
    }

    #[test]
    fn test_duplicate_override_last_wins() {
        let cps = PartitionCheckpoints::build(&["0#5", "0#7"], &["0#9", "0#8"], false).unwrap();
        assert_eq!(
            cps.pair_for(0),
            Some(CheckpointPair {
                from: Checkpoint::Explicit(7),
                to: Some(Checkpoint::Explicit(8)),
            })
        );
    }

    #[test]
    fn test_invalid_range_fails_whole_build() {
        let err = PartitionCheckpoints::build(&["0#50", "10"], &["0#40"], false).unwrap_err();
        assert!(matches!(err, CheckpointError::Validation { .. }));

        let err = PartitionCheckpoints::build(&["200"], &["100"], false).unwrap_err();
        assert!(err.to_string().contains("all partitions"));
    }

    #[test]
    fn test_invalid_tokens() {
        assert!(matches!(
            PartitionCheckpoints::build(&["x#5"], NONE, false),
            Err(CheckpointError::InvalidPartition { .. })
        ));
        assert!(matches!(
            PartitionCheckpoints::build(&["-1#5"], NONE, false),
            Err(CheckpointError::InvalidPartition { .. })
        ));
        assert!(matches!(
            PartitionCheckpoints::build(&["0#"], NONE, false),
            Err(CheckpointError::Parse { .. })
        ));
        assert!(matches!(
            PartitionCheckpoints::build(NONE, &["oldest"], false),
            Err(CheckpointError::NotAStopCondition { .. })
        ));
        assert!(matches!(
            PartitionCheckpoints::build(NONE, &["1#local"], false),
            Err(CheckpointError::NotAStopCondition { .. })
        ));
    }
}
