//! Offset reset tests.
//!
//! Covers:
//! - Earliest/latest plans tracking the build-time watermarks
//! - Validation clamping and idempotence
//! - All-or-nothing behavior when the group is busy, a partition is
//!   rejected, or the cluster becomes unreachable
//! - End-to-end plan, validate and apply runs

use std::collections::BTreeMap;
use std::sync::Arc;

use kafka_ops_core::cluster::memory::{CommitFault, InMemoryCluster};
use kafka_ops_core::error::codes;
use kafka_ops_core::offsets::validate::validate_against;
use kafka_ops_core::offsets::ClampBound;
use kafka_ops_core::{
    apply_plan, build_plan, validate_plan, ClusterMetadata, Error, OffsetResetStrategy,
    PlanTarget, PlanWarning, RetryPolicy, Shutdown, Watermark,
};

use super::helpers::{active_group, cluster_with_topic, tp};

fn fast_commits() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay_ms: 0,
        max_delay_ms: 0,
    }
}

// ============================================================================
// Earliest / Latest
// ============================================================================

#[tokio::test]
async fn earliest_and_latest_plans_match_watermarks() {
    let cluster = cluster_with_topic("orders", 3, 50);
    cluster.truncate_before(&tp("orders", 1), 20);
    cluster.truncate_before(&tp("orders", 2), 49);
    for p in 0..3 {
        cluster.set_committed("billing", &tp("orders", p), 49);
    }

    let earliest = build_plan(
        cluster.as_ref(),
        "billing",
        &PlanTarget::Group,
        &OffsetResetStrategy::ToEarliest,
    )
    .await
    .unwrap();
    let latest = build_plan(
        cluster.as_ref(),
        "billing",
        &PlanTarget::Group,
        &OffsetResetStrategy::ToLatest,
    )
    .await
    .unwrap();

    assert_eq!(earliest.partition_count(), 3);
    for entry in &earliest.partitions {
        let watermark = cluster.watermarks(&entry.topic_partition()).await.unwrap();
        assert_eq!(entry.proposed_offset, watermark.low);
        assert_eq!(entry.build_watermark, watermark);
    }
    for entry in &latest.partitions {
        assert_eq!(entry.proposed_offset, 50);
    }
    assert_eq!(earliest.get(&tp("orders", 1)).unwrap().proposed_offset, 20);
    assert_eq!(earliest.get(&tp("orders", 2)).unwrap().proposed_offset, 49);
}

#[tokio::test]
async fn named_topic_plans_every_partition_for_new_group() {
    let cluster = cluster_with_topic("orders", 4, 10);

    let plan = build_plan(
        cluster.as_ref(),
        "fresh",
        &PlanTarget::Topics(vec!["orders".to_string()]),
        &OffsetResetStrategy::ToLatest,
    )
    .await
    .unwrap();

    assert_eq!(plan.partition_count(), 4);
    assert!(plan.partitions.iter().all(|p| p.current_offset == -1));
    assert!(plan.partitions.iter().all(|p| p.proposed_offset == 10));
}

// ============================================================================
// Validation
// ============================================================================

#[tokio::test]
async fn validation_clamps_to_nearest_bound() {
    let cluster = cluster_with_topic("orders", 2, 100);
    cluster.truncate_before(&tp("orders", 1), 30);

    let strategy = OffsetResetStrategy::parse_explicit(&["orders:0=500", "orders:1=5"]).unwrap();
    let plan = build_plan(cluster.as_ref(), "g", &PlanTarget::Group, &strategy)
        .await
        .unwrap();
    let validated = validate_plan(cluster.as_ref(), &plan).await.unwrap();

    assert_eq!(validated.plan.get(&tp("orders", 0)).unwrap().proposed_offset, 100);
    assert_eq!(validated.plan.get(&tp("orders", 1)).unwrap().proposed_offset, 30);
    assert_eq!(validated.warnings.len(), 2);
    assert!(validated.warnings.contains(&PlanWarning::ValidationClamped {
        topic_partition: tp("orders", 0),
        requested: 500,
        applied: 100,
        bound: ClampBound::High,
        watermark: Watermark::new(0, 100),
    }));
    assert!(validated.warnings.contains(&PlanWarning::ValidationClamped {
        topic_partition: tp("orders", 1),
        requested: 5,
        applied: 30,
        bound: ClampBound::Low,
        watermark: Watermark::new(30, 100),
    }));
}

#[tokio::test]
async fn validation_is_idempotent() {
    let cluster = cluster_with_topic("orders", 3, 40);
    let strategy = OffsetResetStrategy::parse_explicit(&[
        "orders:0=-7",
        "orders:1=12",
        "orders:2=9000",
    ])
    .unwrap();
    let plan = build_plan(cluster.as_ref(), "g", &PlanTarget::Group, &strategy)
        .await
        .unwrap();

    let first = validate_plan(cluster.as_ref(), &plan).await.unwrap();
    let second = validate_against(&first.plan, &first.watermarks).unwrap();

    assert_eq!(second.plan, first.plan);
    assert!(second.warnings.is_empty());
    assert_eq!(first.plan.get(&tp("orders", 1)).unwrap().proposed_offset, 12);
}

#[tokio::test]
async fn unknown_group_without_targets_is_rejected() {
    let cluster = cluster_with_topic("orders", 1, 10);

    let err = build_plan(
        cluster.as_ref(),
        "ghost",
        &PlanTarget::Group,
        &OffsetResetStrategy::ToEarliest,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, Error::UnknownGroup { ref group } if group == "ghost"));
}

// ============================================================================
// Atomicity
// ============================================================================

#[tokio::test]
async fn busy_group_leaves_offsets_untouched() {
    let cluster = cluster_with_topic("orders", 2, 100);
    cluster.set_committed("billing", &tp("orders", 0), 60);
    cluster.set_committed("billing", &tp("orders", 1), 70);

    let plan = build_plan(
        cluster.as_ref(),
        "billing",
        &PlanTarget::Group,
        &OffsetResetStrategy::ToEarliest,
    )
    .await
    .unwrap();
    let validated = validate_plan(cluster.as_ref(), &plan).await.unwrap();

    // A consumer joins between planning and applying.
    cluster.set_group(active_group(
        "billing",
        vec![tp("orders", 0), tp("orders", 1)],
    ));
    let before = cluster.committed_offsets("billing").await.unwrap();

    let err = apply_plan(
        Arc::clone(&cluster),
        &validated,
        fast_commits(),
        Shutdown::new(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, Error::ConcurrentRebalance { .. }));
    assert_eq!(cluster.committed_offsets("billing").await.unwrap(), before);
    assert_eq!(cluster.commit_calls(), 0);
}

#[tokio::test]
async fn generation_conflict_is_not_retried_and_commits_nothing() {
    let cluster = cluster_with_topic("orders", 2, 100);
    cluster.set_committed("billing", &tp("orders", 0), 60);
    cluster.set_committed("billing", &tp("orders", 1), 70);

    let plan = build_plan(
        cluster.as_ref(),
        "billing",
        &PlanTarget::Group,
        &OffsetResetStrategy::ShiftBy(-10),
    )
    .await
    .unwrap();
    let validated = validate_plan(cluster.as_ref(), &plan).await.unwrap();
    cluster.fail_next_commit(CommitFault::ErrorCode(codes::ILLEGAL_GENERATION));

    let err = apply_plan(
        Arc::clone(&cluster),
        &validated,
        fast_commits(),
        Shutdown::new(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, Error::ConcurrentRebalance { .. }));
    assert_eq!(cluster.commit_calls(), 1);
    assert_eq!(cluster.committed("billing", &tp("orders", 0)), Some(60));
    assert_eq!(cluster.committed("billing", &tp("orders", 1)), Some(70));
}

#[tokio::test]
async fn rejected_partition_leaves_group_unchanged() {
    let cluster = cluster_with_topic("orders", 3, 20);
    cluster.set_committed("billing", &tp("orders", 0), 5);
    cluster.set_committed("billing", &tp("orders", 1), 6);
    let before = cluster.committed_offsets("billing").await.unwrap();

    let plan = build_plan(
        cluster.as_ref(),
        "billing",
        &PlanTarget::Topics(vec!["orders".to_string()]),
        &OffsetResetStrategy::ToLatest,
    )
    .await
    .unwrap();
    let validated = validate_plan(cluster.as_ref(), &plan).await.unwrap();
    cluster.reject_partition_on_next_commit(&tp("orders", 1), 12);

    let err = apply_plan(
        Arc::clone(&cluster),
        &validated,
        fast_commits(),
        Shutdown::new(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, Error::CommitRejected { ref group, .. } if group == "billing"));
    assert_eq!(cluster.committed_offsets("billing").await.unwrap(), before);
    assert_eq!(cluster.committed("billing", &tp("orders", 2)), None);
}

#[tokio::test]
async fn unreachable_cluster_aborts_before_any_commit() {
    let cluster = cluster_with_topic("orders", 2, 30);
    cluster.set_committed("billing", &tp("orders", 0), 10);

    let plan = build_plan(
        cluster.as_ref(),
        "billing",
        &PlanTarget::Topics(vec!["orders".to_string()]),
        &OffsetResetStrategy::ToEarliest,
    )
    .await
    .unwrap();
    let validated = validate_plan(cluster.as_ref(), &plan).await.unwrap();

    cluster.set_unavailable(true);

    let err = validate_plan(cluster.as_ref(), &plan).await.unwrap_err();
    assert!(matches!(err, Error::BrokerUnavailable(_)));

    let err = apply_plan(
        Arc::clone(&cluster),
        &validated,
        fast_commits(),
        Shutdown::new(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::BrokerUnavailable(_)));
    assert_eq!(cluster.commit_calls(), 0);

    cluster.set_unavailable(false);
    assert_eq!(cluster.committed("billing", &tp("orders", 0)), Some(10));
    assert_eq!(cluster.committed("billing", &tp("orders", 1)), None);
}

// ============================================================================
// End-to-end
// ============================================================================

#[tokio::test]
async fn reset_to_earliest_end_to_end() {
    let cluster = cluster_with_topic("topicX", 1, 100);
    cluster.set_committed("g1", &tp("topicX", 0), 5);

    let plan = build_plan(
        cluster.as_ref(),
        "g1",
        &PlanTarget::Group,
        &OffsetResetStrategy::ToEarliest,
    )
    .await
    .unwrap();
    assert_eq!(plan.get(&tp("topicX", 0)).unwrap().current_offset, 5);
    assert_eq!(plan.get(&tp("topicX", 0)).unwrap().proposed_offset, 0);

    let validated = validate_plan(cluster.as_ref(), &plan).await.unwrap();
    assert!(validated.warnings.is_empty());

    let report = apply_plan(
        Arc::clone(&cluster),
        &validated,
        fast_commits(),
        Shutdown::new(),
    )
    .await
    .unwrap();

    assert_eq!(report.attempts, 1);
    assert_eq!(report.partitions[0].previous_offset, 5);
    assert_eq!(report.partitions[0].committed_offset, 0);

    let committed = cluster.committed_offsets("g1").await.unwrap();
    assert_eq!(committed.len(), 1);
    assert_eq!(committed[0].offset, 0);
}

#[tokio::test]
async fn explicit_offset_past_high_watermark_is_applied_clamped() {
    let cluster = cluster_with_topic("topicX", 1, 100);
    cluster.set_committed("g1", &tp("topicX", 0), 5);

    let strategy = OffsetResetStrategy::ToExplicit(BTreeMap::from([(tp("topicX", 0), 500)]));
    let plan = build_plan(cluster.as_ref(), "g1", &PlanTarget::Group, &strategy)
        .await
        .unwrap();
    assert_eq!(plan.get(&tp("topicX", 0)).unwrap().proposed_offset, 500);

    let validated = validate_plan(cluster.as_ref(), &plan).await.unwrap();
    assert!(validated.has_clamps());
    assert_eq!(validated.warnings.len(), 1);
    assert_eq!(validated.warnings[0].topic_partition(), &tp("topicX", 0));

    let report = apply_plan(
        Arc::clone(&cluster),
        &validated,
        fast_commits(),
        Shutdown::new(),
    )
    .await
    .unwrap();

    assert_eq!(report.partitions[0].committed_offset, 100);
    assert_eq!(cluster.committed("g1", &tp("topicX", 0)), Some(100));
}

#[tokio::test]
async fn retriable_rejection_then_success() {
    let cluster = cluster_with_topic("orders", 2, 10);
    cluster.set_committed("billing", &tp("orders", 0), 3);
    cluster.set_committed("billing", &tp("orders", 1), 4);

    let plan = build_plan(
        cluster.as_ref(),
        "billing",
        &PlanTarget::Group,
        &OffsetResetStrategy::ToLatest,
    )
    .await
    .unwrap();
    let validated = validate_plan(cluster.as_ref(), &plan).await.unwrap();
    cluster.fail_next_commit(CommitFault::ErrorCode(codes::COORDINATOR_NOT_AVAILABLE));

    let report = apply_plan(
        Arc::clone(&cluster),
        &validated,
        fast_commits(),
        Shutdown::new(),
    )
    .await
    .unwrap();

    assert_eq!(report.attempts, 2);
    assert_eq!(cluster.committed("billing", &tp("orders", 0)), Some(10));
    assert_eq!(cluster.committed("billing", &tp("orders", 1)), Some(10));
}
