//! Cluster access seams.
//!
//! The offset engine and the message pipe only talk to a cluster through the
//! traits in this module. [`KafkaCluster`] implements them over the wire
//! protocol; [`memory::InMemoryCluster`] implements them in process for tests
//! and dry runs.

mod kafka;
pub mod memory;

use async_trait::async_trait;

use crate::types::{ConsumerGroupOffset, GroupDescription, PipeRecord, TopicPartition, Watermark};
use crate::Result;

pub use self::kafka::KafkaCluster;

/// Read-only view of topics, partitions and consumer groups.
#[async_trait]
pub trait ClusterMetadata: Send + Sync {
    /// All partitions of `topic`, sorted. Fails with `TopicNotFound`.
    async fn list_partitions(&self, topic: &str) -> Result<Vec<TopicPartition>>;

    /// Current low/high watermark. Fails with `PartitionNotFound`.
    async fn watermarks(&self, tp: &TopicPartition) -> Result<Watermark>;

    /// Committed offsets of every partition the group has committed to.
    async fn committed_offsets(&self, group_id: &str) -> Result<Vec<ConsumerGroupOffset>>;

    /// State and members of a group. Unknown groups describe as empty.
    async fn describe_group(&self, group_id: &str) -> Result<GroupDescription>;

    /// Earliest offset whose timestamp is at or after `timestamp_ms`, or
    /// `None` if every record is older.
    async fn offset_for_timestamp(
        &self,
        tp: &TopicPartition,
        timestamp_ms: i64,
    ) -> Result<Option<i64>>;

    /// Ids of all consumer groups on the cluster, sorted.
    async fn list_groups(&self) -> Result<Vec<String>>;
}

/// Commits consumer group offsets.
#[async_trait]
pub trait OffsetCommitter: Send + Sync {
    /// Send one batched commit for `group_id` and return the coordinator's
    /// error code for every partition (0 on success). A transport error means
    /// the outcome is unknown.
    async fn commit_offsets(
        &self,
        group_id: &str,
        offsets: &[(TopicPartition, i64)],
    ) -> Result<Vec<(TopicPartition, i16)>>;

    /// Remove the group's committed offsets for `partitions` and return the
    /// coordinator's error code for every partition. Only accepted while
    /// the group has no members consuming the topic.
    async fn delete_offsets(
        &self,
        group_id: &str,
        partitions: &[TopicPartition],
    ) -> Result<Vec<(TopicPartition, i16)>>;
}

/// One fetch worth of records from a single partition.
#[derive(Debug, Clone, Default)]
pub struct FetchedBatch {
    /// Records at or after the requested offset, in offset order
    pub records: Vec<PipeRecord>,
    /// Offset to fetch next. Can be past the last record when the fetch
    /// also covered transaction markers or aborted records; `None` when it
    /// covered nothing.
    pub next_offset: Option<i64>,
    pub high_watermark: i64,
    pub log_start_offset: i64,
}

/// Reads records from a partition.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn fetch(&self, tp: &TopicPartition, offset: i64, max_bytes: i32)
        -> Result<FetchedBatch>;
}

/// Writes records to a partition.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Write `records` as one acknowledged batch. Returns the base offset.
    async fn produce(
        &self,
        tp: &TopicPartition,
        records: &[PipeRecord],
        preserve_timestamps: bool,
    ) -> Result<i64>;
}
