//! CLI commands for consumer group offset resets.
//!
//! `plan` builds and validates a plan and prints it. `apply` does the same,
//! then commits it. Both render the plan identically, so the output of a
//! `plan` run can be reviewed before running `apply` with the same flags.

use anyhow::{bail, Context as _, Result};
use chrono::{DateTime, Utc};
use clap::{ArgGroup, Args};
use kafka_ops_core::offsets::{
    apply_plan, build_plan, parse_duration, render_plan, validate_plan, ApplyReport,
    OffsetResetStrategy, PlanFormat, PlanTarget, PlanWarning, ValidatedPlan,
};
use kafka_ops_core::{Error, Shutdown, TopicPartition};
use std::sync::Arc;
use tracing::{info, warn};

use super::context::{connect, SessionArgs};

/// Arguments shared by `offsets plan` and `offsets apply`.
#[derive(Args, Debug, Clone)]
#[command(group(
    ArgGroup::new("strategy")
        .required(true)
        .args(["to_earliest", "to_latest", "to_datetime", "by_duration", "to_offset", "shift_by"])
))]
pub struct ResetArgs {
    /// Consumer group ID
    #[arg(short, long)]
    pub group: String,

    /// Reset every partition of these topics (repeatable)
    #[arg(short, long)]
    pub topic: Vec<String>,

    /// Reset only these partitions, as topic:partition (repeatable)
    #[arg(short, long)]
    pub partition: Vec<String>,

    /// Reset to the low watermark
    #[arg(long)]
    pub to_earliest: bool,

    /// Reset to the high watermark
    #[arg(long)]
    pub to_latest: bool,

    /// Reset to the first record at or after this RFC 3339 instant
    #[arg(long)]
    pub to_datetime: Option<String>,

    /// Reset to the first record within this duration of now (e.g. 6h, 2d)
    #[arg(long)]
    pub by_duration: Option<String>,

    /// Reset to explicit offsets, as topic:partition=offset (repeatable)
    #[arg(long)]
    pub to_offset: Vec<String>,

    /// Move the committed offsets by this many records
    #[arg(long, allow_hyphen_values = true)]
    pub shift_by: Option<i64>,

    /// Output format (text, json, yaml, csv, script)
    #[arg(short, long, default_value = "text")]
    pub format: String,
}

impl ResetArgs {
    fn strategy(&self) -> Result<OffsetResetStrategy> {
        if self.to_earliest {
            return Ok(OffsetResetStrategy::ToEarliest);
        }
        if self.to_latest {
            return Ok(OffsetResetStrategy::ToLatest);
        }
        if let Some(ts) = &self.to_datetime {
            let instant = DateTime::parse_from_rfc3339(ts)
                .with_context(|| format!("Invalid datetime '{}'", ts))?
                .with_timezone(&Utc);
            return Ok(OffsetResetStrategy::ToTimestamp(instant));
        }
        if let Some(duration) = &self.by_duration {
            let duration = parse_duration(duration)?;
            return Ok(OffsetResetStrategy::by_duration(Utc::now(), duration));
        }
        if !self.to_offset.is_empty() {
            return Ok(OffsetResetStrategy::parse_explicit(&self.to_offset)?);
        }
        if let Some(n) = self.shift_by {
            return Ok(OffsetResetStrategy::ShiftBy(n));
        }
        bail!("No reset strategy given")
    }

    fn target(&self) -> Result<PlanTarget> {
        if !self.partition.is_empty() {
            let partitions = self
                .partition
                .iter()
                .map(|p| p.parse::<TopicPartition>())
                .collect::<kafka_ops_core::Result<Vec<_>>>()?;
            return Ok(PlanTarget::Partitions(partitions));
        }
        if !self.topic.is_empty() {
            return Ok(PlanTarget::Topics(self.topic.clone()));
        }
        Ok(PlanTarget::Group)
    }
}

async fn validated_plan(
    cluster: &kafka_ops_core::KafkaCluster,
    args: &ResetArgs,
) -> Result<ValidatedPlan> {
    let strategy = args.strategy()?;
    let target = args.target()?;
    let plan = build_plan(cluster, &args.group, &target, &strategy).await?;
    Ok(validate_plan(cluster, &plan).await?)
}

/// Build and validate a plan, then print it
pub async fn plan(session: &SessionArgs, args: &ResetArgs) -> Result<()> {
    let format: PlanFormat = args.format.parse()?;
    let config = session.config()?;
    let context = session.resolve(&config, None)?;
    let cluster = connect(&config, &context).await?;

    let validated = validated_plan(&cluster, args).await?;
    print!(
        "{}",
        render_plan(&validated, format, &context.kafka.bootstrap_servers)?
    );
    info!("Dry run: no offsets were committed");
    Ok(())
}

/// Build, validate and commit a plan
pub async fn apply(
    session: &SessionArgs,
    args: &ResetArgs,
    allow_clamped: bool,
    shutdown: Shutdown,
) -> Result<()> {
    let format: PlanFormat = args.format.parse()?;
    let config = session.config()?;
    let context = session.resolve(&config, None)?;
    let cluster = Arc::new(connect(&config, &context).await?);

    let validated = validated_plan(&cluster, args).await?;
    print!(
        "{}",
        render_plan(&validated, format, &context.kafka.bootstrap_servers)?
    );

    if validated.has_clamps() && !allow_clamped {
        bail!(
            "{} offsets were clamped to partition bounds; rerun with --allow-clamped to apply",
            validated.warnings.iter().filter(|w| w.is_clamp()).count()
        );
    }

    match apply_plan(cluster, &validated, config.retry.commits, shutdown).await {
        Ok(report) => {
            print_report(&report);
            Ok(())
        }
        Err(Error::Cancelled {
            outcome_unknown: true,
        }) => {
            bail!(
                "Cancelled while the commit was in flight; check the committed offsets of '{}' before retrying",
                args.group
            )
        }
        Err(Error::PartialCommit {
            group,
            committed,
            rejected,
            rollback,
        }) => {
            eprintln!("Partial commit for group {}", group);
            for (tp, code) in &rejected {
                eprintln!("  rejected {} (error code {})", tp, code);
            }
            for tp in &rollback.restored {
                eprintln!("  restored {}", tp);
            }
            for tp in &rollback.deleted {
                eprintln!("  removed new offset of {}", tp);
            }
            for (tp, reason) in &rollback.failed {
                eprintln!("  failed to roll back {}: {}", tp, reason);
            }
            bail!(
                "{} of {} partitions rejected",
                rejected.len(),
                committed.len() + rejected.len()
            )
        }
        Err(e) => Err(e.into()),
    }
}

fn print_report(report: &ApplyReport) {
    println!();
    println!("✓ Offset reset completed successfully");
    println!("  Group: {}", report.group_id);
    println!("  Partitions reset: {}", report.partitions.len());
    println!("  Commit attempts: {}", report.attempts);
    for warning in &report.warnings {
        if let PlanWarning::WatermarkDrift {
            topic_partition,
            planned,
            current,
        } = warning
        {
            warn!(
                "{} moved from {}..{} to {}..{} after planning",
                topic_partition, planned.low, planned.high, current.low, current.high
            );
        }
    }
}
