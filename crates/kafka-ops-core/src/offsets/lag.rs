//! Consumer group lag.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::plan::fetch_watermarks;
use crate::cluster::ClusterMetadata;
use crate::types::{GroupMember, GroupState, TopicPartition};
use crate::Result;

/// Lag of one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionLag {
    pub topic: String,
    pub partition: i32,
    pub low: i64,
    pub high: i64,
    /// Committed offset (-1 if none)
    pub committed: i64,
    /// Records between the committed offset and the high watermark
    pub lag: i64,
    /// Member currently assigned the partition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_id: Option<String>,
}

/// Description of a group with per-partition lag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupLagReport {
    pub group_id: String,
    pub state: GroupState,
    pub members: Vec<GroupMember>,
    pub partitions: Vec<PartitionLag>,
    pub total_lag: i64,
}

/// Describe `group_id` with the lag of every partition it has committed to
/// or is assigned.
pub async fn describe_group_lag<M: ClusterMetadata + ?Sized>(
    metadata: &M,
    group_id: &str,
) -> Result<GroupLagReport> {
    let group = metadata.describe_group(group_id).await?;
    let committed = metadata.committed_offsets(group_id).await?;

    let partitions: BTreeSet<TopicPartition> = committed
        .iter()
        .map(|o| o.topic_partition.clone())
        .chain(group.assigned_partitions())
        .collect();
    let watermarks = fetch_watermarks(metadata, &partitions).await?;

    let mut lags = Vec::with_capacity(partitions.len());
    for tp in partitions {
        let Some(watermark) = watermarks.get(&tp).copied() else {
            continue;
        };
        let offset = committed
            .iter()
            .find(|o| o.topic_partition == tp)
            .map(|o| o.offset)
            .unwrap_or(-1);
        let lag = if offset >= 0 {
            (watermark.high - offset).max(0)
        } else {
            watermark.len()
        };
        let member_id = group
            .members
            .iter()
            .find(|m| m.assignment.contains(&tp))
            .map(|m| m.member_id.clone());
        lags.push(PartitionLag {
            topic: tp.topic,
            partition: tp.partition,
            low: watermark.low,
            high: watermark.high,
            committed: offset,
            lag,
            member_id,
        });
    }

    Ok(GroupLagReport {
        group_id: group.group_id,
        state: group.state,
        members: group.members,
        total_lag: lags.iter().map(|l| l.lag).sum(),
        partitions: lags,
    })
}
