//! Plan validation against live partition bounds.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use super::plan::{fetch_watermarks, OffsetPlan};
use crate::cluster::ClusterMetadata;
use crate::types::{TopicPartition, Watermark};
use crate::{Error, Result};

/// Which bound a clamped offset was moved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClampBound {
    Low,
    High,
}

/// Non-fatal findings attached to a validated plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum PlanWarning {
    /// The proposed offset was outside the live bounds and was moved to the
    /// nearest one
    ValidationClamped {
        topic_partition: TopicPartition,
        requested: i64,
        applied: i64,
        bound: ClampBound,
        watermark: Watermark,
    },
    /// Watermarks moved between building and applying an earliest/latest
    /// plan. The plan is applied as built.
    WatermarkDrift {
        topic_partition: TopicPartition,
        planned: Watermark,
        current: Watermark,
    },
}

impl PlanWarning {
    pub fn topic_partition(&self) -> &TopicPartition {
        match self {
            PlanWarning::ValidationClamped {
                topic_partition, ..
            }
            | PlanWarning::WatermarkDrift {
                topic_partition, ..
            } => topic_partition,
        }
    }

    pub fn is_clamp(&self) -> bool {
        matches!(self, PlanWarning::ValidationClamped { .. })
    }
}

/// A plan whose every proposed offset lies within the live bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatedPlan {
    /// Plan with clamped offsets
    pub plan: OffsetPlan,

    /// Clamps applied during validation
    pub warnings: Vec<PlanWarning>,

    /// Watermarks the plan was validated against
    #[serde(skip)]
    pub watermarks: BTreeMap<TopicPartition, Watermark>,
}

impl ValidatedPlan {
    pub fn group_id(&self) -> &str {
        &self.plan.group_id
    }

    pub fn has_clamps(&self) -> bool {
        self.warnings.iter().any(PlanWarning::is_clamp)
    }
}

/// Clamp `plan` to `watermarks`. Pure; validating the result again against
/// the same watermarks returns the same plan with no warnings.
pub fn validate_against(
    plan: &OffsetPlan,
    watermarks: &BTreeMap<TopicPartition, Watermark>,
) -> Result<ValidatedPlan> {
    let mut validated = plan.clone();
    let mut warnings = Vec::new();
    let mut used = BTreeMap::new();

    for entry in &mut validated.partitions {
        let tp = entry.topic_partition();
        let watermark = *watermarks
            .get(&tp)
            .ok_or_else(|| Error::PartitionNotFound(tp.clone()))?;

        let requested = entry.proposed_offset;
        let (applied, bound) = if requested < watermark.low {
            (watermark.low, Some(ClampBound::Low))
        } else if requested > watermark.high {
            (watermark.high, Some(ClampBound::High))
        } else {
            (requested, None)
        };

        if let Some(bound) = bound {
            warn!(
                "Clamped {} from {} to {} (watermarks {}..{})",
                tp, requested, applied, watermark.low, watermark.high
            );
            entry.proposed_offset = applied;
            warnings.push(PlanWarning::ValidationClamped {
                topic_partition: tp.clone(),
                requested,
                applied,
                bound,
                watermark,
            });
        }
        used.insert(tp, watermark);
    }

    Ok(ValidatedPlan {
        plan: validated,
        warnings,
        watermarks: used,
    })
}

/// Validates plans against freshly read watermarks.
pub struct OffsetPlanValidator<'a, M: ClusterMetadata + ?Sized> {
    metadata: &'a M,
}

impl<'a, M: ClusterMetadata + ?Sized> OffsetPlanValidator<'a, M> {
    pub fn new(metadata: &'a M) -> Self {
        Self { metadata }
    }

    /// Read the watermarks of every planned partition, then clamp. No
    /// partition is checked until every read has completed.
    pub async fn validate(&self, plan: &OffsetPlan) -> Result<ValidatedPlan> {
        let partitions: Vec<TopicPartition> =
            plan.partitions.iter().map(|p| p.topic_partition()).collect();
        let watermarks = fetch_watermarks(self.metadata, &partitions).await?;
        let validated = validate_against(plan, &watermarks)?;
        debug!(
            "Validated plan for group {}: {} partitions, {} clamped",
            plan.group_id,
            plan.partitions.len(),
            validated.warnings.len()
        );
        Ok(validated)
    }
}

/// Validate `plan` against the current watermarks of `metadata`.
pub async fn validate_plan<M: ClusterMetadata + ?Sized>(
    metadata: &M,
    plan: &OffsetPlan,
) -> Result<ValidatedPlan> {
    OffsetPlanValidator::new(metadata).validate(plan).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offsets::plan::PlannedOffset;

    fn plan(entries: &[(&str, i32, i64)]) -> OffsetPlan {
        OffsetPlan {
            group_id: "g".to_string(),
            strategy: "to-explicit".to_string(),
            anchor: None,
            partitions: entries
                .iter()
                .map(|(topic, partition, proposed)| PlannedOffset {
                    topic: topic.to_string(),
                    partition: *partition,
                    current_offset: -1,
                    proposed_offset: *proposed,
                    build_watermark: Watermark::new(0, 0),
                })
                .collect(),
        }
    }

    fn bounds(entries: &[(&str, i32, i64, i64)]) -> BTreeMap<TopicPartition, Watermark> {
        entries
            .iter()
            .map(|(t, p, low, high)| (TopicPartition::new(*t, *p), Watermark::new(*low, *high)))
            .collect()
    }

    #[test]
    fn test_clamps_to_nearest_bound() {
        let plan = plan(&[("t", 0, 500), ("t", 1, 2), ("t", 2, 50)]);
        let wm = bounds(&[("t", 0, 0, 100), ("t", 1, 10, 100), ("t", 2, 10, 100)]);

        let validated = validate_against(&plan, &wm).unwrap();
        let proposed: Vec<_> = validated
            .plan
            .partitions
            .iter()
            .map(|p| p.proposed_offset)
            .collect();
        assert_eq!(proposed, vec![100, 10, 50]);
        assert_eq!(validated.warnings.len(), 2);
        assert!(matches!(
            validated.warnings[0],
            PlanWarning::ValidationClamped {
                requested: 500,
                applied: 100,
                bound: ClampBound::High,
                ..
            }
        ));
        assert!(matches!(
            validated.warnings[1],
            PlanWarning::ValidationClamped {
                requested: 2,
                applied: 10,
                bound: ClampBound::Low,
                ..
            }
        ));
    }

    #[test]
    fn test_validation_is_idempotent() {
        let plan = plan(&[("t", 0, -5), ("t", 1, 7)]);
        let wm = bounds(&[("t", 0, 3, 9), ("t", 1, 3, 9)]);

        let once = validate_against(&plan, &wm).unwrap();
        let twice = validate_against(&once.plan, &wm).unwrap();
        assert_eq!(once.plan, twice.plan);
        assert!(twice.warnings.is_empty());
    }

    #[test]
    fn test_missing_watermark_is_partition_not_found() {
        let plan = plan(&[("t", 0, 1), ("t", 3, 1)]);
        let wm = bounds(&[("t", 0, 0, 10)]);
        let err = validate_against(&plan, &wm).unwrap_err();
        assert!(matches!(err, Error::PartitionNotFound(tp) if tp == TopicPartition::new("t", 3)));
    }
}
