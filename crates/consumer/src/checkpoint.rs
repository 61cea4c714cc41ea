//! Checkpoint expressions.
//!
//! A checkpoint is a symbolic or absolute position in a partition's offset
//! space. The accepted grammar is:
//!
//! - keywords (case-insensitive): `oldest`, `beginning`, `earliest`, `start`,
//!   `newest`, `latest`, `end`, `local`, `stored`
//! - a base-10 offset `>= -2`, where `-2` and `-1` are the broker sentinels for
//!   the oldest and newest offset
//! - an absolute timestamp: RFC 3339, or one of `YYYY-MM-DD HH:MM[:SS[.f]]`
//!   (also with a `T` separator) and `YYYY-MM-DD`, interpreted as UTC

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use std::fmt;
use std::str::FromStr;

use crate::error::{CheckpointError, CheckpointResult};

/// Broker sentinel for the oldest available offset.
pub const OLDEST_SENTINEL: i64 = -2;

/// Broker sentinel for the newest offset.
pub const NEWEST_SENTINEL: i64 = -1;

const OLDEST_KEYWORDS: &[&str] = &["oldest", "beginning", "earliest", "start"];
const NEWEST_KEYWORDS: &[&str] = &["newest", "latest", "end"];
const LOCAL_KEYWORDS: &[&str] = &["local", "stored"];

const NAIVE_LAYOUTS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Positions resolved through the broker's partition metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Predefined {
    /// The oldest offset still retained by the partition
    Oldest,
    /// The end of the partition
    Newest,
}

impl fmt::Display for Predefined {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predefined::Oldest => write!(f, "oldest"),
            Predefined::Newest => write!(f, "newest"),
        }
    }
}

/// A start or stop position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Checkpoint {
    Predefined(Predefined),
    Explicit(i64),
    Timestamp(DateTime<Utc>),
    /// The offset recorded in the local offset store
    Local,
}

impl Checkpoint {
    pub const OLDEST: Checkpoint = Checkpoint::Predefined(Predefined::Oldest);
    pub const NEWEST: Checkpoint = Checkpoint::Predefined(Predefined::Newest);

    /// Parse a checkpoint expression.
    ///
    /// With `is_stop` set, only positions that can end consumption are
    /// accepted: explicit offsets, timestamps and `newest`.
    pub fn parse(raw: &str, is_stop: bool) -> CheckpointResult<Self> {
        let input = raw.trim();
        if input.is_empty() {
            return Err(CheckpointError::parse(raw, "empty expression"));
        }

        let checkpoint = parse_unchecked(input)?;
        if is_stop && !checkpoint.is_valid_stop() {
            return Err(CheckpointError::NotAStopCondition {
                input: input.to_string(),
            });
        }
        Ok(checkpoint)
    }

    /// Whether this checkpoint may be used as a stop bound.
    pub fn is_valid_stop(&self) -> bool {
        matches!(
            self,
            Checkpoint::Explicit(_)
                | Checkpoint::Timestamp(_)
                | Checkpoint::Predefined(Predefined::Newest)
        )
    }
}

fn parse_unchecked(input: &str) -> CheckpointResult<Checkpoint> {
    let lowered = input.to_ascii_lowercase();
    if OLDEST_KEYWORDS.contains(&lowered.as_str()) {
        return Ok(Checkpoint::OLDEST);
    }
    if NEWEST_KEYWORDS.contains(&lowered.as_str()) {
        return Ok(Checkpoint::NEWEST);
    }
    if LOCAL_KEYWORDS.contains(&lowered.as_str()) {
        return Ok(Checkpoint::Local);
    }

    if let Ok(offset) = input.parse::<i64>() {
        return match offset {
            OLDEST_SENTINEL => Ok(Checkpoint::OLDEST),
            NEWEST_SENTINEL => Ok(Checkpoint::NEWEST),
            o if o < OLDEST_SENTINEL => Err(CheckpointError::parse(
                input,
                format!("offset must be greater than or equal to {}", OLDEST_SENTINEL),
            )),
            o => Ok(Checkpoint::Explicit(o)),
        };
    }

    parse_timestamp(input).map(Checkpoint::Timestamp).ok_or_else(|| {
        CheckpointError::parse(input, "expected a keyword, an offset or a timestamp")
    })
}

fn parse_timestamp(input: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(input) {
        return Some(ts.with_timezone(&Utc));
    }

    for layout in NAIVE_LAYOUTS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(input, layout) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

impl FromStr for Checkpoint {
    type Err = CheckpointError;

    /// Parses a start checkpoint.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Checkpoint::parse(s, false)
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Checkpoint::Predefined(p) => write!(f, "{}", p),
            Checkpoint::Explicit(offset) => write!(f, "{}", offset),
            Checkpoint::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
            Checkpoint::Local => write!(f, "local"),
        }
    }
}

/// A start position with an optional stop position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointPair {
    pub from: Checkpoint,
    pub to: Option<Checkpoint>,
}

impl CheckpointPair {
    /// Create a validated pair.
    pub fn new(from: Checkpoint, to: Option<Checkpoint>) -> CheckpointResult<Self> {
        let pair = Self { from, to };
        pair.validate("checkpoint pair")?;
        Ok(pair)
    }

    /// Check the pair's invariants, naming `scope` in the error.
    pub(crate) fn validate(&self, scope: &str) -> CheckpointResult<()> {
        let Some(to) = self.to else {
            return Ok(());
        };

        if !to.is_valid_stop() {
            return Err(CheckpointError::validation(
                scope,
                format!("'{}' is not an acceptable stop condition", to),
            ));
        }

        match (self.from, to) {
            (Checkpoint::Explicit(from), Checkpoint::Explicit(to)) if from > to => {
                Err(CheckpointError::validation(
                    scope,
                    format!("start offset {} is after stop offset {}", from, to),
                ))
            }
            (Checkpoint::Timestamp(from), Checkpoint::Timestamp(to)) if from > to => {
                Err(CheckpointError::validation(
                    scope,
                    format!(
                        "start time {} is after stop time {}",
                        from.to_rfc3339(),
                        to.to_rfc3339()
                    ),
                ))
            }
            _ => Ok(()),
        }
    }
}

impl Default for CheckpointPair {
    fn default() -> Self {
        Self {
            from: Checkpoint::NEWEST,
            to: None,
        }
    }
}

impl fmt::Display for CheckpointPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to {
            Some(to) => write!(f, "{} -> {}", self.from, to),
            None => write!(f, "{} -> (unbounded)", self.from),
        }
    }
}
