//! Offset plan generation.
//!
//! A plan pairs every targeted partition of a consumer group with its
//! current committed offset and the offset the chosen strategy proposes.
//! Proposed offsets are resolved once, against the watermarks read while
//! the plan is built; bounds are enforced later by the validator.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

use super::strategy::{OffsetResetStrategy, WatermarkAnchor};
use crate::cluster::ClusterMetadata;
use crate::types::{TopicPartition, Watermark};
use crate::{Error, Result};

/// Which partitions of a group a plan covers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PlanTarget {
    /// Every partition the group has committed to or is assigned
    #[default]
    Group,
    /// All partitions of the named topics
    Topics(Vec<String>),
    /// Exactly these partitions
    Partitions(Vec<TopicPartition>),
}

/// One partition of an offset plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedOffset {
    /// Topic name
    pub topic: String,

    /// Partition ID
    pub partition: i32,

    /// Committed offset when the plan was built (-1 if none)
    pub current_offset: i64,

    /// Offset to commit
    pub proposed_offset: i64,

    /// Watermarks read while building the plan
    pub build_watermark: Watermark,
}

impl PlannedOffset {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    /// Signed distance the committed offset moves.
    pub fn delta(&self) -> Option<i64> {
        (self.current_offset >= 0).then(|| self.proposed_offset - self.current_offset)
    }
}

/// Offset plan for one consumer group, sorted by topic then partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetPlan {
    /// Consumer group ID
    pub group_id: String,

    /// Strategy used to generate the plan
    pub strategy: String,

    /// Watermark the proposed offsets were copied from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor: Option<WatermarkAnchor>,

    /// Partition plans
    pub partitions: Vec<PlannedOffset>,
}

impl OffsetPlan {
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn get(&self, tp: &TopicPartition) -> Option<&PlannedOffset> {
        self.partitions
            .iter()
            .find(|p| p.topic == tp.topic && p.partition == tp.partition)
    }

    /// Partitions paired with their proposed offsets, in plan order.
    pub fn proposed_offsets(&self) -> Vec<(TopicPartition, i64)> {
        self.partitions
            .iter()
            .map(|p| (p.topic_partition(), p.proposed_offset))
            .collect()
    }
}

/// Builds offset plans from live cluster state.
pub struct OffsetPlanBuilder<'a, M: ClusterMetadata + ?Sized> {
    metadata: &'a M,
}

impl<'a, M: ClusterMetadata + ?Sized> OffsetPlanBuilder<'a, M> {
    pub fn new(metadata: &'a M) -> Self {
        Self { metadata }
    }

    /// Build the plan for `group_id`.
    ///
    /// Fails with `UnknownGroup` when the group has no committed offsets and
    /// nothing was named, and with `Config` when a live group is asked to
    /// move a topic none of its members consume.
    pub async fn build(
        &self,
        group_id: &str,
        target: &PlanTarget,
        strategy: &OffsetResetStrategy,
    ) -> Result<OffsetPlan> {
        let group = self.metadata.describe_group(group_id).await?;
        let committed: BTreeMap<TopicPartition, i64> = self
            .metadata
            .committed_offsets(group_id)
            .await?
            .into_iter()
            .filter(|o| o.has_offset())
            .map(|o| (o.topic_partition, o.offset))
            .collect();

        debug!(
            "Group {} is {} with {} members and {} committed partitions",
            group_id,
            group.state,
            group.members.len(),
            committed.len()
        );

        let assigned = group.assigned_partitions();
        let (targets, named_topics) = self
            .resolve_targets(group_id, target, strategy, &committed, &assigned)
            .await?;

        if group.is_active() && !named_topics.is_empty() {
            let subscribed = group.subscribed_topics();
            if let Some(topic) = named_topics.iter().find(|t| !subscribed.contains(*t)) {
                return Err(Error::Config(format!(
                    "Group '{}' has live members and does not consume topic '{}'",
                    group_id, topic
                )));
            }
        }

        let watermarks = fetch_watermarks(self.metadata, &targets).await?;
        let timestamp_offsets = match strategy {
            OffsetResetStrategy::ToTimestamp(ts) => {
                let ts = ts.timestamp_millis();
                let lookups = targets
                    .iter()
                    .map(|tp| self.metadata.offset_for_timestamp(tp, ts));
                let found = join_all(lookups)
                    .await
                    .into_iter()
                    .collect::<Result<Vec<_>>>()?;
                targets.iter().cloned().zip(found).collect()
            }
            _ => BTreeMap::new(),
        };

        let mut partitions = Vec::with_capacity(targets.len());
        for tp in &targets {
            let watermark = watermarks[tp];
            let current = committed.get(tp).copied().unwrap_or(-1);
            let proposed = match strategy {
                OffsetResetStrategy::ToEarliest => watermark.low,
                OffsetResetStrategy::ToLatest => watermark.high,
                OffsetResetStrategy::ToTimestamp(_) => timestamp_offsets
                    .get(tp)
                    .copied()
                    .flatten()
                    .unwrap_or(watermark.high),
                OffsetResetStrategy::ToExplicit(offsets) => {
                    *offsets.get(tp).ok_or_else(|| {
                        Error::Config(format!("No explicit offset given for {}", tp))
                    })?
                }
                OffsetResetStrategy::ShiftBy(n) => shift(current, *n, watermark),
            };
            partitions.push(PlannedOffset {
                topic: tp.topic.clone(),
                partition: tp.partition,
                current_offset: current,
                proposed_offset: proposed,
                build_watermark: watermark,
            });
        }

        info!(
            "Built {} plan for group {} covering {} partitions",
            strategy.label(),
            group_id,
            partitions.len()
        );

        Ok(OffsetPlan {
            group_id: group_id.to_string(),
            strategy: strategy.label(),
            anchor: strategy.anchor(),
            partitions,
        })
    }

    /// Partitions to plan, plus the topics the caller named explicitly.
    async fn resolve_targets(
        &self,
        group_id: &str,
        target: &PlanTarget,
        strategy: &OffsetResetStrategy,
        committed: &BTreeMap<TopicPartition, i64>,
        assigned: &BTreeSet<TopicPartition>,
    ) -> Result<(BTreeSet<TopicPartition>, BTreeSet<String>)> {
        match (target, strategy) {
            (PlanTarget::Group, OffsetResetStrategy::ToExplicit(offsets)) => {
                let targets: BTreeSet<_> = offsets.keys().cloned().collect();
                let named = targets.iter().map(|tp| tp.topic.clone()).collect();
                Ok((targets, named))
            }
            (PlanTarget::Group, _) => {
                if committed.is_empty() {
                    return Err(Error::UnknownGroup {
                        group: group_id.to_string(),
                    });
                }
                let targets = committed
                    .keys()
                    .cloned()
                    .chain(assigned.iter().cloned())
                    .collect();
                Ok((targets, BTreeSet::new()))
            }
            (PlanTarget::Topics(topics), _) => {
                if topics.is_empty() {
                    return Err(Error::Config("No topics given".to_string()));
                }
                let mut targets = BTreeSet::new();
                for topic in topics {
                    targets.extend(self.metadata.list_partitions(topic).await?);
                }
                Ok((targets, topics.iter().cloned().collect()))
            }
            (PlanTarget::Partitions(tps), _) => {
                if tps.is_empty() {
                    return Err(Error::Config("No partitions given".to_string()));
                }
                let targets: BTreeSet<_> = tps.iter().cloned().collect();
                let named = targets.iter().map(|tp| tp.topic.clone()).collect();
                Ok((targets, named))
            }
        }
    }
}

/// Build the plan for `group_id` against `metadata`.
pub async fn build_plan<M: ClusterMetadata + ?Sized>(
    metadata: &M,
    group_id: &str,
    target: &PlanTarget,
    strategy: &OffsetResetStrategy,
) -> Result<OffsetPlan> {
    OffsetPlanBuilder::new(metadata)
        .build(group_id, target, strategy)
        .await
}

/// Read the watermarks of every partition concurrently. Returns only once
/// every read has finished; any failure fails the whole set.
pub(crate) async fn fetch_watermarks<'a, M, I>(
    metadata: &M,
    partitions: I,
) -> Result<BTreeMap<TopicPartition, Watermark>>
where
    M: ClusterMetadata + ?Sized,
    I: IntoIterator<Item = &'a TopicPartition>,
{
    let partitions: Vec<&TopicPartition> = partitions.into_iter().collect();
    let reads = partitions.iter().map(|tp| metadata.watermarks(tp));
    let results = join_all(reads).await;

    let mut watermarks = BTreeMap::new();
    for (tp, result) in partitions.into_iter().zip(results) {
        watermarks.insert(tp.clone(), result?);
    }
    Ok(watermarks)
}

/// `current + n`, or relative to the watermark on the side the shift moves
/// away from when nothing is committed.
fn shift(current: i64, n: i64, watermark: Watermark) -> i64 {
    let base = if current >= 0 {
        current
    } else if n >= 0 {
        watermark.low
    } else {
        watermark.high
    };
    base.saturating_add(n)
}
