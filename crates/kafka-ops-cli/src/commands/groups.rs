//! CLI commands for inspecting consumer groups.

use anyhow::Result;
use kafka_ops_core::offsets::{describe_group_lag, GroupLagReport};
use kafka_ops_core::ClusterMetadata;

use super::context::{connect, SessionArgs};
use super::OutputFormat;

/// List consumer groups
pub async fn list(session: &SessionArgs, format: OutputFormat) -> Result<()> {
    let config = session.config()?;
    let context = session.resolve(&config, None)?;
    let cluster = connect(&config, &context).await?;

    let groups = cluster.list_groups().await?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&groups)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(&groups)?),
        OutputFormat::Text => {
            if groups.is_empty() {
                println!("No consumer groups found");
            }
            for group in groups {
                println!("{}", group);
            }
        }
    }
    Ok(())
}

/// Describe a group with per-partition lag
pub async fn describe(session: &SessionArgs, group: &str, format: OutputFormat) -> Result<()> {
    let config = session.config()?;
    let context = session.resolve(&config, None)?;
    let cluster = connect(&config, &context).await?;

    let report = describe_group_lag(&cluster, group).await?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(&report)?),
        OutputFormat::Text => print_text(&report),
    }
    Ok(())
}

fn print_text(report: &GroupLagReport) {
    println!("Group:   {}", report.group_id);
    println!("State:   {}", report.state);
    println!("Members: {}", report.members.len());
    for member in &report.members {
        println!(
            "  {} ({}{}) - {} partitions",
            member.member_id,
            member.client_id,
            member.client_host,
            member.assignment.len()
        );
    }
    println!();

    if report.partitions.is_empty() {
        println!("No committed offsets");
        return;
    }

    let width = report
        .partitions
        .iter()
        .map(|p| p.topic.len())
        .max()
        .unwrap_or(0)
        .max("TOPIC".len());
    println!(
        "{:<width$}  {:>9}  {:>12}  {:>12}  {:>12}  {:>10}  MEMBER",
        "TOPIC", "PARTITION", "LOW", "HIGH", "COMMITTED", "LAG"
    );
    for p in &report.partitions {
        let committed = if p.committed < 0 {
            "-".to_string()
        } else {
            p.committed.to_string()
        };
        println!(
            "{:<width$}  {:>9}  {:>12}  {:>12}  {:>12}  {:>10}  {}",
            p.topic,
            p.partition,
            p.low,
            p.high,
            committed,
            p.lag,
            p.member_id.as_deref().unwrap_or("-")
        );
    }
    println!();
    println!("Total lag: {}", report.total_lag);
}
