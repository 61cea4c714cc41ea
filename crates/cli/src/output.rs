//! Output formatting
//!
//! Consumed events and offset listings go to stdout in either a plain,
//! human-oriented layout or as JSON. Everything else goes to stderr.

use crate::CliResult;
use chrono::{DateTime, SecondsFormat, Utc};
use clap::ValueEnum;
use colored::Colorize;
use consumer::store::PartitionOffsetRecord;
use kreplay_types::{Event, RemoteOffset};
use serde::Serialize;

/// Output format for stdout
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// `topic/partition@offset` followed by key and value
    #[default]
    Plain,
    /// One JSON object per line
    Json,
}

/// A stored offset, optionally with its lag against the broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OffsetRow {
    pub environment: String,
    pub topic: String,
    pub partition: i32,
    /// Next offset to read
    pub offset: i64,
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteOffset>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lag: Option<i64>,
}

impl From<PartitionOffsetRecord> for OffsetRow {
    fn from(record: PartitionOffsetRecord) -> Self {
        Self {
            environment: record.environment,
            topic: record.topic,
            partition: record.partition,
            offset: record.offset,
            updated_at: record.updated_at,
            remote: None,
            lag: None,
        }
    }
}

/// Formats command output
pub trait Formatter: Send + Sync {
    /// One consumed event, without a trailing newline
    fn format_event(&self, event: &Event) -> CliResult<String>;

    /// A listing of stored offsets
    fn format_offsets(&self, rows: &[OffsetRow]) -> CliResult<String>;
}

/// Get a formatter for the given format
pub fn get_formatter(format: OutputFormat) -> Box<dyn Formatter> {
    match format {
        OutputFormat::Plain => Box::new(PlainFormatter),
        OutputFormat::Json => Box::new(JsonFormatter),
    }
}

pub struct PlainFormatter;

impl Formatter for PlainFormatter {
    fn format_event(&self, event: &Event) -> CliResult<String> {
        Ok(format!(
            "{}@{}\t{}\t{}",
            event.topic_partition(),
            event.offset,
            event.key_lossy().unwrap_or_default(),
            event.value_lossy().unwrap_or_default()
        ))
    }

    fn format_offsets(&self, rows: &[OffsetRow]) -> CliResult<String> {
        if rows.is_empty() {
            return Ok("No stored offsets".dimmed().to_string());
        }

        let with_lag = rows.iter().any(|r| r.remote.is_some());
        let mut header = vec!["ENVIRONMENT", "TOPIC", "PARTITION", "OFFSET", "UPDATED"];
        if with_lag {
            header.extend(["REMOTE", "LAG"]);
        }

        let cells: Vec<Vec<String>> = rows
            .iter()
            .map(|row| {
                let mut line = vec![
                    row.environment.clone(),
                    row.topic.clone(),
                    row.partition.to_string(),
                    row.offset.to_string(),
                    row.updated_at
                        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
                        .unwrap_or_else(|| "-".to_string()),
                ];
                if with_lag {
                    line.push(remote_cell(row.remote.as_ref()));
                    line.push(row.lag.map_or_else(|| "-".to_string(), |l| l.to_string()));
                }
                line
            })
            .collect();

        let widths: Vec<usize> = header
            .iter()
            .enumerate()
            .map(|(i, h)| {
                cells
                    .iter()
                    .map(|line| line[i].len())
                    .chain(std::iter::once(h.len()))
                    .max()
                    .unwrap_or(0)
            })
            .collect();

        let mut out = String::new();
        let header_line = header
            .iter()
            .zip(&widths)
            .map(|(h, w)| format!("{:<width$}", h, width = w))
            .collect::<Vec<_>>()
            .join("  ");
        out.push_str(&header_line.trim_end().bold().to_string());

        for line in cells {
            out.push('\n');
            let text = line
                .iter()
                .zip(&widths)
                .map(|(c, w)| format!("{:<width$}", c, width = w))
                .collect::<Vec<_>>()
                .join("  ");
            out.push_str(text.trim_end());
        }

        Ok(out)
    }
}

fn remote_cell(remote: Option<&RemoteOffset>) -> String {
    match remote {
        Some(RemoteOffset::Known(offset)) => offset.to_string(),
        Some(RemoteOffset::NotFound) => "not found".to_string(),
        Some(RemoteOffset::Unknown(_)) => "unknown".to_string(),
        None => "-".to_string(),
    }
}

pub struct JsonFormatter;

#[derive(Serialize)]
struct JsonEvent<'a> {
    topic: &'a str,
    partition: i32,
    offset: i64,
    timestamp: Option<String>,
    key: Option<String>,
    value: Option<String>,
}

impl Formatter for JsonFormatter {
    fn format_event(&self, event: &Event) -> CliResult<String> {
        let json = JsonEvent {
            topic: &event.topic,
            partition: event.partition,
            offset: event.offset,
            timestamp: event
                .timestamp
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true)),
            key: event.key_lossy(),
            value: event.value_lossy(),
        };
        Ok(serde_json::to_string(&json)?)
    }

    fn format_offsets(&self, rows: &[OffsetRow]) -> CliResult<String> {
        Ok(serde_json::to_string_pretty(rows)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event() -> Event {
        Event::new("orders", 2, 42)
            .with_key(b"user-1".to_vec())
            .with_value(b"{\"total\":10}".to_vec())
            .with_timestamp(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap())
    }

    fn row(lag: Option<i64>) -> OffsetRow {
        OffsetRow {
            environment: "dev".to_string(),
            topic: "orders".to_string(),
            partition: 0,
            offset: 17,
            updated_at: None,
            remote: lag.map(|l| RemoteOffset::Known(17 + l)),
            lag,
        }
    }

    #[test]
    fn test_plain_event() {
        let line = PlainFormatter.format_event(&event()).unwrap();
        assert_eq!(line, "orders/2@42\tuser-1\t{\"total\":10}");

        let bare = PlainFormatter
            .format_event(&Event::new("orders", 0, 1))
            .unwrap();
        assert_eq!(bare, "orders/0@1\t\t");
    }

    #[test]
    fn test_json_event() {
        let line = JsonFormatter.format_event(&event()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["topic"], "orders");
        assert_eq!(value["partition"], 2);
        assert_eq!(value["offset"], 42);
        assert_eq!(value["key"], "user-1");
        assert_eq!(value["timestamp"], "2024-03-01T12:00:00.000Z");
        assert!(!line.contains('\n'));
    }

    #[test]
    fn test_plain_offsets() {
        colored::control::set_override(false);

        let table = PlainFormatter.format_offsets(&[row(None)]).unwrap();
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("ENVIRONMENT"));
        assert!(!lines[0].contains("LAG"));
        assert!(lines[1].contains("orders"));

        let table = PlainFormatter.format_offsets(&[row(Some(3))]).unwrap();
        assert!(table.lines().next().unwrap().ends_with("LAG"));
        assert!(table.lines().nth(1).unwrap().ends_with('3'));

        assert_eq!(
            PlainFormatter.format_offsets(&[]).unwrap(),
            "No stored offsets"
        );
    }

    #[test]
    fn test_json_offsets() {
        let json = JsonFormatter.format_offsets(&[row(None), row(Some(2))]).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(value[0].get("lag").is_none());
        assert_eq!(value[1]["lag"], 2);
        assert_eq!(value[1]["remote"]["state"], "known");
        assert_eq!(value[1]["remote"]["value"], 19);
    }
}
