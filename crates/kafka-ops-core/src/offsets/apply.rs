//! Offset plan execution.
//!
//! A validated plan is committed as one batched OffsetCommit for its group.
//! The coordinator's generation check is the only guard against a consumer
//! rejoining between plan and apply; this module never locks client side.
//!
//! Outcomes:
//! - every partition accepted: success
//! - group conflict codes (rebalance, stale generation, unknown member):
//!   `ConcurrentRebalance`, never retried
//! - every partition rejected with a retriable code, or a transient transport
//!   error: the whole batch is retried within the commit budget
//! - anything else: partitions that did commit are restored to their
//!   pre-apply offsets, or have their new offset deleted when they had none,
//!   and `CommitRejected` is returned. `PartialCommit` means that rollback
//!   itself failed and the group holds a mix of old and new offsets.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use super::plan::fetch_watermarks;
use super::validate::{PlanWarning, ValidatedPlan};
use crate::cluster::{ClusterMetadata, OffsetCommitter};
use crate::error::{codes, KafkaError, RollbackOutcome};
use crate::retry::RetryPolicy;
use crate::shutdown::Shutdown;
use crate::types::TopicPartition;
use crate::{Error, Result};

/// Committed offset of one partition after apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedOffset {
    /// Topic name
    pub topic: String,

    /// Partition ID
    pub partition: i32,

    /// Offset committed before apply (-1 if none)
    pub previous_offset: i64,

    /// Offset committed by apply
    pub committed_offset: i64,
}

/// Result of applying an offset plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyReport {
    /// Consumer group ID
    pub group_id: String,

    /// Strategy the plan was built with
    pub strategy: String,

    /// Partitions committed
    pub partitions: Vec<AppliedOffset>,

    /// Commit requests sent, including retries
    pub attempts: u32,

    /// Clamp and drift warnings
    pub warnings: Vec<PlanWarning>,

    /// Execution timestamp
    pub executed_at: i64,

    /// Duration in milliseconds
    pub duration_ms: u64,
}

enum CommitOutcome {
    Committed,
    Conflict(i16),
    Retriable(i16),
    Partial,
}

/// Applies validated plans to a cluster.
pub struct OffsetApplier<C: ?Sized> {
    cluster: Arc<C>,
    retry: RetryPolicy,
    shutdown: Shutdown,
}

impl<C> OffsetApplier<C>
where
    C: ClusterMetadata + OffsetCommitter + ?Sized,
{
    pub fn new(cluster: Arc<C>) -> Self {
        Self {
            cluster,
            retry: RetryPolicy::commits(),
            shutdown: Shutdown::new(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Commit `plan` for its group.
    pub async fn apply(&self, plan: &ValidatedPlan) -> Result<ApplyReport> {
        let start = Instant::now();
        let group_id = plan.group_id();

        if self.shutdown.is_triggered() {
            return Err(Error::Cancelled {
                outcome_unknown: false,
            });
        }

        let group = self.cluster.describe_group(group_id).await?;
        if group.is_active() {
            return Err(Error::ConcurrentRebalance {
                group: group_id.to_string(),
                reason: format!(
                    "group is {} with {} active members",
                    group.state,
                    group.members.len()
                ),
            });
        }

        let snapshot: BTreeMap<TopicPartition, i64> = self
            .cluster
            .committed_offsets(group_id)
            .await?
            .into_iter()
            .map(|o| (o.topic_partition, o.offset))
            .collect();

        let mut warnings = plan.warnings.clone();
        if plan.plan.anchor.is_some() {
            warnings.extend(self.check_drift(plan).await?);
        }

        let offsets = plan.plan.proposed_offsets();
        let attempts = if offsets.is_empty() {
            0
        } else {
            self.commit(group_id, &offsets, &snapshot).await?
        };

        let partitions = plan
            .plan
            .partitions
            .iter()
            .map(|p| AppliedOffset {
                topic: p.topic.clone(),
                partition: p.partition,
                previous_offset: snapshot.get(&p.topic_partition()).copied().unwrap_or(-1),
                committed_offset: p.proposed_offset,
            })
            .collect::<Vec<_>>();

        info!(
            "Committed {} offsets for group {} in {} attempt(s)",
            partitions.len(),
            group_id,
            attempts
        );

        Ok(ApplyReport {
            group_id: group_id.to_string(),
            strategy: plan.plan.strategy.clone(),
            partitions,
            attempts,
            warnings,
            executed_at: chrono::Utc::now().timestamp_millis(),
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    /// Compare the watermarks an earliest/latest plan was built from with
    /// the current ones. The plan itself is not re-resolved.
    async fn check_drift(&self, plan: &ValidatedPlan) -> Result<Vec<PlanWarning>> {
        let partitions: Vec<TopicPartition> = plan
            .plan
            .partitions
            .iter()
            .map(|p| p.topic_partition())
            .collect();
        let current = fetch_watermarks(&*self.cluster, &partitions).await?;

        let mut drift = Vec::new();
        for entry in &plan.plan.partitions {
            let tp = entry.topic_partition();
            let Some(now) = current.get(&tp).copied() else {
                continue;
            };
            if now != entry.build_watermark {
                warn!(
                    "Watermarks of {} moved since the plan was built: {}..{} -> {}..{}",
                    tp,
                    entry.build_watermark.low,
                    entry.build_watermark.high,
                    now.low,
                    now.high
                );
                drift.push(PlanWarning::WatermarkDrift {
                    topic_partition: tp,
                    planned: entry.build_watermark,
                    current: now,
                });
            }
        }
        Ok(drift)
    }

    /// Send the batched commit until it settles. Returns the number of
    /// requests sent.
    async fn commit(
        &self,
        group_id: &str,
        offsets: &[(TopicPartition, i64)],
        snapshot: &BTreeMap<TopicPartition, i64>,
    ) -> Result<u32> {
        let mut attempt = 0u32;
        let mut outcome_unknown = false;

        loop {
            attempt += 1;
            if self.shutdown.is_triggered() {
                return Err(Error::Cancelled { outcome_unknown });
            }

            debug!(
                "Committing {} offsets for group {} (attempt {})",
                offsets.len(),
                group_id,
                attempt
            );
            let result = tokio::select! {
                biased;
                _ = self.shutdown.wait() => {
                    warn!("Commit for group {} cancelled while in flight", group_id);
                    return Err(Error::Cancelled { outcome_unknown: true });
                }
                result = self.cluster.commit_offsets(group_id, offsets) => result,
            };

            let results = match result {
                Ok(results) => complete_results(offsets, results),
                Err(e) if e.is_transient() && self.retry.allows_retry(attempt) => {
                    outcome_unknown = true;
                    warn!(
                        "Commit for group {} failed (attempt {}/{}): {}",
                        group_id, attempt, self.retry.max_attempts, e
                    );
                    self.backoff(attempt, outcome_unknown).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let (committed, rejected): (Vec<_>, Vec<_>) =
                results.into_iter().partition(|(_, code)| *code == codes::NONE);
            let committed: Vec<TopicPartition> =
                committed.into_iter().map(|(tp, _)| tp).collect();

            match classify(&committed, &rejected) {
                CommitOutcome::Committed => return Ok(attempt),
                CommitOutcome::Retriable(code) if self.retry.allows_retry(attempt) => {
                    warn!(
                        "Coordinator rejected commit for group {} with retriable code {} (attempt {}/{})",
                        group_id, code, attempt, self.retry.max_attempts
                    );
                    self.backoff(attempt, outcome_unknown).await?;
                }
                CommitOutcome::Retriable(code) => {
                    return Err(KafkaError::BrokerError {
                        code,
                        message: format!(
                            "OffsetCommit for group {} still failing after {} attempts",
                            group_id, attempt
                        ),
                    }
                    .into());
                }
                CommitOutcome::Conflict(code) => {
                    let reason = format!("coordinator rejected commit with error code {}", code);
                    if committed.is_empty() {
                        return Err(Error::ConcurrentRebalance {
                            group: group_id.to_string(),
                            reason,
                        });
                    }
                    let rollback = self.rollback(group_id, &committed, snapshot).await;
                    if rollback.is_complete() {
                        return Err(Error::ConcurrentRebalance {
                            group: group_id.to_string(),
                            reason,
                        });
                    }
                    return Err(Error::PartialCommit {
                        group: group_id.to_string(),
                        committed,
                        rejected,
                        rollback,
                    });
                }
                CommitOutcome::Partial => {
                    error!(
                        "Commit for group {} partially failed: {} committed, {} rejected",
                        group_id,
                        committed.len(),
                        rejected.len()
                    );
                    let rollback = self.rollback(group_id, &committed, snapshot).await;
                    if rollback.is_complete() {
                        return Err(Error::CommitRejected {
                            group: group_id.to_string(),
                            rejected,
                        });
                    }
                    return Err(Error::PartialCommit {
                        group: group_id.to_string(),
                        committed,
                        rejected,
                        rollback,
                    });
                }
            }
        }
    }

    async fn backoff(&self, attempt: u32, outcome_unknown: bool) -> Result<()> {
        let delay = self.retry.delay_for(attempt);
        tokio::select! {
            _ = self.shutdown.wait() => Err(Error::Cancelled { outcome_unknown }),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Put `committed` partitions back the way the snapshot had them:
    /// restore the old offset, or delete the new one where there was none.
    async fn rollback(
        &self,
        group_id: &str,
        committed: &[TopicPartition],
        snapshot: &BTreeMap<TopicPartition, i64>,
    ) -> RollbackOutcome {
        let mut outcome = RollbackOutcome::default();
        let mut restore = Vec::new();
        let mut delete = Vec::new();
        for tp in committed {
            match snapshot.get(tp) {
                Some(offset) if *offset >= 0 => restore.push((tp.clone(), *offset)),
                _ => delete.push(tp.clone()),
            }
        }

        warn!(
            "Rolling back group {}: restoring {} partitions, deleting {}",
            group_id,
            restore.len(),
            delete.len()
        );

        if !restore.is_empty() {
            let result = self
                .retry
                .run("rollback commit", || {
                    self.cluster.commit_offsets(group_id, &restore)
                })
                .await
                .map(|results| complete_results(&restore, results));
            let (restored, failed) = settle(group_id, &restore, result);
            outcome.restored = restored;
            outcome.failed.extend(failed);
        }

        if !delete.is_empty() {
            let requested: Vec<(TopicPartition, i64)> =
                delete.iter().map(|tp| (tp.clone(), -1)).collect();
            let result = self
                .retry
                .run("rollback delete", || {
                    self.cluster.delete_offsets(group_id, &delete)
                })
                .await
                .map(|results| complete_results(&requested, results));
            let (deleted, failed) = settle(group_id, &requested, result);
            outcome.deleted = deleted;
            outcome.failed.extend(failed);
        }

        outcome
    }
}

/// Split a rollback request's results into settled and failed partitions.
fn settle(
    group_id: &str,
    requested: &[(TopicPartition, i64)],
    result: Result<Vec<(TopicPartition, i16)>>,
) -> (Vec<TopicPartition>, Vec<(TopicPartition, String)>) {
    match result {
        Ok(results) => {
            let mut settled = Vec::new();
            let mut failed = Vec::new();
            for (tp, code) in results {
                if code == codes::NONE {
                    settled.push(tp);
                } else {
                    failed.push((tp, format!("error code {}", code)));
                }
            }
            (settled, failed)
        }
        Err(e) => {
            error!("Rollback for group {} failed: {}", group_id, e);
            let failed = requested
                .iter()
                .map(|(tp, _)| (tp.clone(), e.to_string()))
                .collect();
            (Vec::new(), failed)
        }
    }
}

/// One result per requested partition; partitions the coordinator left out
/// count as rejected.
fn complete_results(
    requested: &[(TopicPartition, i64)],
    results: Vec<(TopicPartition, i16)>,
) -> Vec<(TopicPartition, i16)> {
    let by_partition: BTreeMap<TopicPartition, i16> = results.into_iter().collect();
    requested
        .iter()
        .map(|(tp, _)| {
            let code = by_partition
                .get(tp)
                .copied()
                .unwrap_or(codes::UNKNOWN_SERVER_ERROR);
            (tp.clone(), code)
        })
        .collect()
}

fn classify(committed: &[TopicPartition], rejected: &[(TopicPartition, i16)]) -> CommitOutcome {
    if rejected.is_empty() {
        return CommitOutcome::Committed;
    }
    if let Some((_, code)) = rejected.iter().find(|(_, c)| codes::is_group_conflict(*c)) {
        return CommitOutcome::Conflict(*code);
    }
    if committed.is_empty() && rejected.iter().all(|(_, c)| codes::is_retriable(*c)) {
        return CommitOutcome::Retriable(rejected[0].1);
    }
    CommitOutcome::Partial
}

/// Apply `plan` to `cluster` with the given commit budget.
pub async fn apply_plan<C>(
    cluster: Arc<C>,
    plan: &ValidatedPlan,
    retry: RetryPolicy,
    shutdown: Shutdown,
) -> Result<ApplyReport>
where
    C: ClusterMetadata + OffsetCommitter + ?Sized,
{
    OffsetApplier::new(cluster)
        .with_retry(retry)
        .with_shutdown(shutdown)
        .apply(plan)
        .await
}
