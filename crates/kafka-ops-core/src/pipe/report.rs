//! Message pipe reports.

use serde::{Deserialize, Serialize};

use crate::Error;

/// Offsets a partition worker copies. `end` is exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetRange {
    pub start: i64,
    pub end: i64,
}

impl OffsetRange {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> i64 {
        (self.end - self.start).max(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What stopped a partition worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    SchemaDecode,
    SchemaEncode,
    Broker,
    Other,
}

/// Failure of one partition worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipeFailure {
    pub kind: FailureKind,

    /// Source offset of the record that failed, when one did
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,

    pub message: String,
}

impl From<&Error> for PipeFailure {
    fn from(err: &Error) -> Self {
        let (kind, offset) = match err {
            Error::SchemaDecodeFailure { offset, .. } => (FailureKind::SchemaDecode, Some(*offset)),
            Error::SchemaEncodeFailure { offset, .. } => (FailureKind::SchemaEncode, Some(*offset)),
            Error::BrokerUnavailable(_)
            | Error::Kafka(_)
            | Error::PartitionNotFound(_)
            | Error::TopicNotFound(_)
            | Error::Io(_) => (FailureKind::Broker, None),
            _ => (FailureKind::Other, None),
        };
        Self {
            kind,
            offset,
            message: err.to_string(),
        }
    }
}

/// How a partition worker finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum PartitionStatus {
    Completed,
    Failed(PipeFailure),
    Cancelled,
}

/// Result of copying one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionPipeReport {
    /// Source and destination partition index
    pub partition: i32,

    /// Source range the worker was asked to copy
    pub range: OffsetRange,

    /// First source offset not yet copied; resume from here
    pub next_offset: i64,

    /// Records written to the destination
    pub records_copied: u64,

    /// Records dropped after a codec failure
    pub records_skipped: u64,

    pub status: PartitionStatus,
}

impl PartitionPipeReport {
    pub fn new(partition: i32, range: OffsetRange) -> Self {
        Self {
            partition,
            range,
            next_offset: range.start,
            records_copied: 0,
            records_skipped: 0,
            status: PartitionStatus::Completed,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == PartitionStatus::Completed
    }

    pub fn failure(&self) -> Option<&PipeFailure> {
        match &self.status {
            PartitionStatus::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

/// Result of a pipe run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipeReport {
    pub source_topic: String,
    pub destination_topic: String,

    /// One entry per source partition, sorted by partition
    pub partitions: Vec<PartitionPipeReport>,

    pub total_copied: u64,
    pub total_skipped: u64,

    /// Duration in milliseconds
    pub duration_ms: u64,
}

impl PipeReport {
    pub fn partition(&self, partition: i32) -> Option<&PartitionPipeReport> {
        self.partitions.iter().find(|p| p.partition == partition)
    }

    /// Partitions that did not finish; resume these from `next_offset`.
    pub fn failed_partitions(&self) -> Vec<&PartitionPipeReport> {
        self.partitions.iter().filter(|p| !p.is_completed()).collect()
    }

    pub fn is_complete(&self) -> bool {
        self.partitions.iter().all(PartitionPipeReport::is_completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TopicPartition;

    #[test]
    fn test_failure_from_error() {
        let err = Error::SchemaDecodeFailure {
            topic: "src".to_string(),
            partition: 0,
            offset: 42,
            message: "bad magic".to_string(),
        };
        let failure = PipeFailure::from(&err);
        assert_eq!(failure.kind, FailureKind::SchemaDecode);
        assert_eq!(failure.offset, Some(42));
        assert!(failure.message.contains("src[0]@42"));

        let failure = PipeFailure::from(&Error::PartitionNotFound(TopicPartition::new("dst", 3)));
        assert_eq!(failure.kind, FailureKind::Broker);
        assert_eq!(failure.offset, None);
    }

    #[test]
    fn test_report_status_serializes_tagged() {
        let mut report = PartitionPipeReport::new(1, OffsetRange::new(0, 10));
        report.status = PartitionStatus::Cancelled;
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"]["state"], "cancelled");
    }
}
