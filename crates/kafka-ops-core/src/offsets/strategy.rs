//! Offset reset strategies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::types::TopicPartition;
use crate::{Error, Result};

/// How the proposed offset of every planned partition is chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OffsetResetStrategy {
    /// Low watermark at build time
    ToEarliest,
    /// High watermark at build time
    ToLatest,
    /// First offset whose record timestamp is at or after the instant
    ToTimestamp(DateTime<Utc>),
    /// Caller supplied offsets, checked against bounds by the validator
    ToExplicit(BTreeMap<TopicPartition, i64>),
    /// Move the committed offset forward (positive) or back (negative)
    ShiftBy(i64),
}

/// Which watermark a plan was resolved against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WatermarkAnchor {
    Low,
    High,
}

impl OffsetResetStrategy {
    /// Stable label used in rendered plans.
    pub fn label(&self) -> String {
        match self {
            OffsetResetStrategy::ToEarliest => "to-earliest".to_string(),
            OffsetResetStrategy::ToLatest => "to-latest".to_string(),
            OffsetResetStrategy::ToTimestamp(ts) => {
                format!("to-timestamp({})", ts.to_rfc3339())
            }
            OffsetResetStrategy::ToExplicit(_) => "to-explicit".to_string(),
            OffsetResetStrategy::ShiftBy(n) => format!("shift-by({})", n),
        }
    }

    /// Watermark the proposed offsets are copied from, if any. Plans with an
    /// anchor are checked for drift before they are applied.
    pub fn anchor(&self) -> Option<WatermarkAnchor> {
        match self {
            OffsetResetStrategy::ToEarliest => Some(WatermarkAnchor::Low),
            OffsetResetStrategy::ToLatest => Some(WatermarkAnchor::High),
            _ => None,
        }
    }

    /// Reset to the instant `duration` before `now`.
    pub fn by_duration(now: DateTime<Utc>, duration: chrono::Duration) -> Self {
        OffsetResetStrategy::ToTimestamp(now - duration)
    }

    /// Build an explicit strategy from `topic:partition=offset` entries.
    pub fn parse_explicit<S: AsRef<str>>(entries: &[S]) -> Result<Self> {
        let mut offsets = BTreeMap::new();
        for entry in entries {
            let entry = entry.as_ref();
            let (tp, offset) = entry.rsplit_once('=').ok_or_else(|| {
                Error::Config(format!(
                    "Expected 'topic:partition=offset', got '{}'",
                    entry
                ))
            })?;
            let tp: TopicPartition = tp.parse()?;
            let offset: i64 = offset
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("Invalid offset in '{}'", entry)))?;
            if offsets.insert(tp.clone(), offset).is_some() {
                return Err(Error::Config(format!("{} given more than once", tp)));
            }
        }
        if offsets.is_empty() {
            return Err(Error::Config(
                "An explicit reset needs at least one offset".to_string(),
            ));
        }
        Ok(OffsetResetStrategy::ToExplicit(offsets))
    }
}

impl fmt::Display for OffsetResetStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Parse a duration such as `30s`, `15m`, `6h`, `2d` or `1w`.
pub fn parse_duration(input: &str) -> Result<chrono::Duration> {
    let input = input.trim();
    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (amount, unit) = input.split_at(split);
    let amount: i64 = amount
        .parse()
        .map_err(|_| Error::Config(format!("Invalid duration '{}'", input)))?;
    let duration = match unit {
        "ms" => chrono::Duration::milliseconds(amount),
        "s" | "" => chrono::Duration::seconds(amount),
        "m" => chrono::Duration::minutes(amount),
        "h" => chrono::Duration::hours(amount),
        "d" => chrono::Duration::days(amount),
        "w" => chrono::Duration::weeks(amount),
        other => {
            return Err(Error::Config(format!(
                "Unknown duration unit '{}' in '{}'",
                other, input
            )))
        }
    };
    Ok(duration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_labels_and_anchors() {
        assert_eq!(OffsetResetStrategy::ToEarliest.label(), "to-earliest");
        assert_eq!(OffsetResetStrategy::ShiftBy(-3).label(), "shift-by(-3)");
        assert_eq!(
            OffsetResetStrategy::ToEarliest.anchor(),
            Some(WatermarkAnchor::Low)
        );
        assert_eq!(
            OffsetResetStrategy::ToLatest.anchor(),
            Some(WatermarkAnchor::High)
        );
        assert_eq!(OffsetResetStrategy::ShiftBy(1).anchor(), None);

        let ts = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(
            OffsetResetStrategy::ToTimestamp(ts).label(),
            "to-timestamp(2024-01-02T03:04:05+00:00)"
        );
    }

    #[test]
    fn test_parse_explicit() {
        let strategy =
            OffsetResetStrategy::parse_explicit(&["orders:0=10", "orders:1=20"]).unwrap();
        let OffsetResetStrategy::ToExplicit(offsets) = strategy else {
            panic!("expected explicit strategy");
        };
        assert_eq!(offsets[&TopicPartition::new("orders", 1)], 20);

        assert!(OffsetResetStrategy::parse_explicit(&["orders:0"]).is_err());
        assert!(OffsetResetStrategy::parse_explicit(&["orders:0=x"]).is_err());
        assert!(OffsetResetStrategy::parse_explicit(&["a:0=1", "a:0=2"]).is_err());
        assert!(OffsetResetStrategy::parse_explicit::<&str>(&[]).is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("90s").unwrap(), chrono::Duration::seconds(90));
        assert_eq!(parse_duration("2h").unwrap(), chrono::Duration::hours(2));
        assert_eq!(parse_duration("1w").unwrap(), chrono::Duration::weeks(1));
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("5y").is_err());
    }

    #[test]
    fn test_by_duration() {
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let strategy = OffsetResetStrategy::by_duration(now, chrono::Duration::days(1));
        assert_eq!(
            strategy,
            OffsetResetStrategy::ToTimestamp(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
        );
    }
}
