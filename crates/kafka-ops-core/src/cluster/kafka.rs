//! Cluster access over the Kafka wire protocol.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{ClusterMetadata, FetchedBatch, OffsetCommitter, RecordSink, RecordSource};
use crate::config::KafkaConfig;
use crate::error::{codes, KafkaError};
use crate::kafka::{self, PartitionLeaderRouter};
use crate::retry::RetryPolicy;
use crate::types::{
    ConsumerGroupOffset, GroupDescription, GroupState, PipeRecord, TopicPartition, Watermark,
};
use crate::{Error, Result};

/// Connection handle to one Kafka cluster.
///
/// Cheap to clone; clones share the leader router and its connection pool.
/// Metadata reads get the configured read retry budget and surface
/// connectivity loss as `BrokerUnavailable`. Commits are never retried
/// here; the applier owns that decision.
#[derive(Clone)]
pub struct KafkaCluster {
    router: Arc<PartitionLeaderRouter>,
    reads: RetryPolicy,
}

impl KafkaCluster {
    /// Connect to the bootstrap servers and load cluster metadata.
    pub async fn connect(config: &KafkaConfig, reads: RetryPolicy) -> Result<Self> {
        let router = reads
            .run("connect", || PartitionLeaderRouter::new(config.clone()))
            .await
            .map_err(unavailable)?;
        Ok(Self {
            router: Arc::new(router),
            reads,
        })
    }

    async fn read<T, F, Fut>(&self, what: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.reads.run(what, op).await.map_err(unavailable)
    }
}

/// Turn connectivity failures into `BrokerUnavailable` and missing
/// partitions into `PartitionNotFound`.
fn unavailable(err: Error) -> Error {
    match err {
        Error::Kafka(KafkaError::PartitionNotAvailable { topic, partition }) => {
            Error::PartitionNotFound(TopicPartition::new(topic, partition))
        }
        Error::Kafka(KafkaError::TopicNotExists(topic)) => Error::TopicNotFound(topic),
        Error::Kafka(e) if e.is_connectivity() => Error::BrokerUnavailable(e.to_string()),
        Error::Io(e) => Error::BrokerUnavailable(e.to_string()),
        other => other,
    }
}

#[async_trait]
impl ClusterMetadata for KafkaCluster {
    async fn list_partitions(&self, topic: &str) -> Result<Vec<TopicPartition>> {
        self.read("list partitions", || self.router.topic_partitions(topic))
            .await
    }

    async fn watermarks(&self, tp: &TopicPartition) -> Result<Watermark> {
        let (low, high) = self
            .read("list offsets", || {
                self.router.get_offsets(&tp.topic, tp.partition)
            })
            .await?;
        Ok(Watermark::new(low, high))
    }

    async fn committed_offsets(&self, group_id: &str) -> Result<Vec<ConsumerGroupOffset>> {
        let committed = self
            .read("offset fetch", || {
                self.router.with_coordinator(group_id, |client| async move {
                    kafka::fetch_offsets(&client, group_id).await
                })
            })
            .await?;

        let mut offsets = Vec::with_capacity(committed.len());
        for c in committed {
            if c.error_code != 0 {
                return Err(KafkaError::BrokerError {
                    code: c.error_code,
                    message: format!(
                        "OffsetFetch for {}:{} in group {} failed",
                        c.topic, c.partition, group_id
                    ),
                }
                .into());
            }
            offsets.push(ConsumerGroupOffset {
                group_id: group_id.to_string(),
                topic_partition: TopicPartition::new(c.topic, c.partition),
                offset: c.offset,
                metadata: c.metadata,
            });
        }
        offsets.sort_by(|a, b| a.topic_partition.cmp(&b.topic_partition));
        Ok(offsets)
    }

    async fn describe_group(&self, group_id: &str) -> Result<GroupDescription> {
        let descriptions = self
            .read("describe group", || {
                self.router.with_coordinator(group_id, |client| async move {
                    kafka::describe_groups(&client, &[group_id.to_string()]).await
                })
            })
            .await?;

        let Some(description) = descriptions.into_iter().find(|d| d.group_id == group_id) else {
            return Ok(GroupDescription::empty(group_id));
        };

        match description.error_code {
            codes::NONE => {}
            codes::GROUP_ID_NOT_FOUND => return Ok(GroupDescription::empty(group_id)),
            code => {
                return Err(KafkaError::BrokerError {
                    code,
                    message: format!("DescribeGroups for {} failed", group_id),
                }
                .into())
            }
        }

        Ok(GroupDescription {
            group_id: description.group_id,
            state: GroupState::parse(&description.state),
            protocol_type: description.protocol_type,
            members: description.members,
        })
    }

    async fn offset_for_timestamp(
        &self,
        tp: &TopicPartition,
        timestamp_ms: i64,
    ) -> Result<Option<i64>> {
        self.read("offset for timestamp", || {
            self.router
                .offset_for_timestamp(&tp.topic, tp.partition, timestamp_ms)
        })
        .await
    }

    async fn list_groups(&self) -> Result<Vec<String>> {
        let groups = self
            .read("list groups", || self.router.list_groups())
            .await?;
        Ok(groups.into_iter().map(|g| g.group_id).collect())
    }
}

#[async_trait]
impl OffsetCommitter for KafkaCluster {
    async fn commit_offsets(
        &self,
        group_id: &str,
        offsets: &[(TopicPartition, i64)],
    ) -> Result<Vec<(TopicPartition, i16)>> {
        let results = self
            .router
            .with_coordinator(group_id, |client| async move {
                kafka::commit_offsets(&client, group_id, offsets).await
            })
            .await
            .map_err(unavailable)?;

        let coordinator_moved = !results.is_empty()
            && results.iter().all(|(_, code)| {
                *code == codes::NOT_COORDINATOR || *code == codes::COORDINATOR_NOT_AVAILABLE
            });
        if coordinator_moved {
            warn!(
                "Coordinator rejected commit for group {}; forgetting it",
                group_id
            );
            self.router.invalidate_coordinator(group_id).await;
        }

        debug!(
            "Commit for group {} returned {} partition results",
            group_id,
            results.len()
        );
        Ok(results)
    }

    async fn delete_offsets(
        &self,
        group_id: &str,
        partitions: &[TopicPartition],
    ) -> Result<Vec<(TopicPartition, i16)>> {
        self.router
            .with_coordinator(group_id, |client| async move {
                kafka::delete_offsets(&client, group_id, partitions).await
            })
            .await
            .map_err(unavailable)
    }
}

#[async_trait]
impl RecordSource for KafkaCluster {
    async fn fetch(
        &self,
        tp: &TopicPartition,
        offset: i64,
        max_bytes: i32,
    ) -> Result<FetchedBatch> {
        let response = self
            .read("fetch", || {
                self.router.fetch(&tp.topic, tp.partition, offset, max_bytes)
            })
            .await?;
        Ok(FetchedBatch {
            records: response.records,
            next_offset: response.next_offset,
            high_watermark: response.high_watermark,
            log_start_offset: response.log_start_offset,
        })
    }
}

#[async_trait]
impl RecordSink for KafkaCluster {
    async fn produce(
        &self,
        tp: &TopicPartition,
        records: &[PipeRecord],
        preserve_timestamps: bool,
    ) -> Result<i64> {
        let response = self
            .router
            .produce(&tp.topic, tp.partition, records, preserve_timestamps)
            .await
            .map_err(unavailable)?;
        Ok(response.base_offset)
    }
}
