//! Plan rendering.
//!
//! Renders are pure functions of the validated plan, so a dry run and a real
//! run of the same plan produce identical output.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::str::FromStr;

use super::plan::PlannedOffset;
use super::validate::{PlanWarning, ValidatedPlan};
use crate::types::TopicPartition;
use crate::{Error, Result};

/// Output format for offset plans.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PlanFormat {
    #[default]
    Text,
    Json,
    Yaml,
    Csv,
    /// `kafka-consumer-groups.sh` commands for manual execution
    Script,
}

impl FromStr for PlanFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "text" | "table" => Ok(PlanFormat::Text),
            "json" => Ok(PlanFormat::Json),
            "yaml" | "yml" => Ok(PlanFormat::Yaml),
            "csv" => Ok(PlanFormat::Csv),
            "script" | "shell" | "sh" => Ok(PlanFormat::Script),
            other => Err(Error::Config(format!("Unknown plan format '{}'", other))),
        }
    }
}

/// Render `plan` in `format`. `bootstrap_servers` only appears in scripts.
pub fn render_plan(
    plan: &ValidatedPlan,
    format: PlanFormat,
    bootstrap_servers: &[String],
) -> Result<String> {
    match format {
        PlanFormat::Text => Ok(render_text(plan)),
        PlanFormat::Json => Ok(serde_json::to_string_pretty(plan)?),
        PlanFormat::Yaml => Ok(serde_yaml::to_string(plan)?),
        PlanFormat::Csv => Ok(render_csv(plan)),
        PlanFormat::Script => Ok(render_script(plan, bootstrap_servers)),
    }
}

fn clamps(plan: &ValidatedPlan) -> BTreeMap<TopicPartition, i64> {
    plan.warnings
        .iter()
        .filter_map(|w| match w {
            PlanWarning::ValidationClamped {
                topic_partition,
                requested,
                ..
            } => Some((topic_partition.clone(), *requested)),
            _ => None,
        })
        .collect()
}

fn render_text(plan: &ValidatedPlan) -> String {
    let clamped = clamps(plan);
    let mut out = String::new();
    let _ = writeln!(out, "Group:    {}", plan.plan.group_id);
    let _ = writeln!(out, "Strategy: {}", plan.plan.strategy);
    let _ = writeln!(out);

    let topic_width = plan
        .plan
        .partitions
        .iter()
        .map(|p| p.topic.len())
        .max()
        .unwrap_or(0)
        .max("TOPIC".len());
    let _ = writeln!(
        out,
        "{:<tw$}  {:>9}  {:>12}  {:>12}  {:>12}  {:>12}  NOTE",
        "TOPIC",
        "PARTITION",
        "CURRENT",
        "PROPOSED",
        "LOW",
        "HIGH",
        tw = topic_width
    );
    for p in &plan.plan.partitions {
        let note = match clamped.get(&p.topic_partition()) {
            Some(requested) => format!("clamped from {}", requested),
            None => String::new(),
        };
        let watermark = plan
            .watermarks
            .get(&p.topic_partition())
            .copied()
            .unwrap_or(p.build_watermark);
        let line = format!(
            "{:<tw$}  {:>9}  {:>12}  {:>12}  {:>12}  {:>12}  {}",
            p.topic,
            p.partition,
            current(p),
            p.proposed_offset,
            watermark.low,
            watermark.high,
            note,
            tw = topic_width
        );
        let _ = writeln!(out, "{}", line.trim_end());
    }

    let drift = plan
        .warnings
        .iter()
        .filter(|w| matches!(w, PlanWarning::WatermarkDrift { .. }))
        .count();
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "{} partitions, {} clamped, {} drifted",
        plan.plan.partitions.len(),
        clamped.len(),
        drift
    );
    out
}

fn current(p: &PlannedOffset) -> String {
    if p.current_offset < 0 {
        "-".to_string()
    } else {
        p.current_offset.to_string()
    }
}

fn render_csv(plan: &ValidatedPlan) -> String {
    let clamped = clamps(plan);
    let mut csv = String::new();
    csv.push_str("group_id,topic,partition,current_offset,proposed_offset,clamped_from\n");

    for p in &plan.plan.partitions {
        let clamped_from = clamped
            .get(&p.topic_partition())
            .map(|r| r.to_string())
            .unwrap_or_default();
        csv.push_str(&format!(
            "{},{},{},{},{},{}\n",
            plan.plan.group_id,
            p.topic,
            p.partition,
            p.current_offset,
            p.proposed_offset,
            clamped_from
        ));
    }

    csv
}

fn render_script(plan: &ValidatedPlan, bootstrap_servers: &[String]) -> String {
    let mut script = String::new();

    script.push_str("#!/bin/bash\n");
    script.push_str("# Offset Reset Script\n");
    script.push_str(&format!("# Group: {}\n", plan.plan.group_id));
    script.push_str(&format!("# Strategy: {}\n", plan.plan.strategy));
    script.push_str("#\n");
    script.push_str("# WARNING: This script will reset consumer group offsets.\n");
    script.push_str("# Stop every consumer in the group before running it.\n");
    script.push_str("#\n");
    script.push_str("set -e\n");

    let bootstrap = if bootstrap_servers.is_empty() {
        "localhost:9092".to_string()
    } else {
        bootstrap_servers.join(",")
    };

    let mut by_topic: BTreeMap<&str, Vec<&PlannedOffset>> = BTreeMap::new();
    for p in &plan.plan.partitions {
        by_topic.entry(&p.topic).or_default().push(p);
    }

    for (topic, partitions) in by_topic {
        script.push_str(&format!("\n# Topic: {}\n", topic));
        for p in partitions {
            script.push_str(&format!(
                "# Partition {}: {} -> {}\n",
                p.partition,
                current(p),
                p.proposed_offset
            ));
            script.push_str(&format!(
                "kafka-consumer-groups.sh --bootstrap-server {} \\\n",
                bootstrap
            ));
            script.push_str(&format!("  --group {} \\\n", plan.plan.group_id));
            script.push_str(&format!("  --topic {}:{} \\\n", p.topic, p.partition));
            script.push_str(&format!(
                "  --reset-offsets --to-offset {} --execute\n",
                p.proposed_offset
            ));
        }
    }

    script.push_str("\necho \"Offset reset complete!\"\n");
    script
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offsets::{validate_against, OffsetPlan};
    use crate::types::Watermark;

    fn validated() -> ValidatedPlan {
        let plan = OffsetPlan {
            group_id: "payments".to_string(),
            strategy: "to-explicit".to_string(),
            anchor: None,
            partitions: vec![
                PlannedOffset {
                    topic: "orders".to_string(),
                    partition: 0,
                    current_offset: 5,
                    proposed_offset: 500,
                    build_watermark: Watermark::new(0, 100),
                },
                PlannedOffset {
                    topic: "orders".to_string(),
                    partition: 1,
                    current_offset: -1,
                    proposed_offset: 3,
                    build_watermark: Watermark::new(0, 100),
                },
            ],
        };
        let watermarks = [
            (TopicPartition::new("orders", 0), Watermark::new(0, 100)),
            (TopicPartition::new("orders", 1), Watermark::new(0, 100)),
        ]
        .into_iter()
        .collect();
        validate_against(&plan, &watermarks).unwrap()
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("JSON".parse::<PlanFormat>().unwrap(), PlanFormat::Json);
        assert_eq!("yml".parse::<PlanFormat>().unwrap(), PlanFormat::Yaml);
        assert_eq!("sh".parse::<PlanFormat>().unwrap(), PlanFormat::Script);
        assert!("xml".parse::<PlanFormat>().is_err());
    }

    #[test]
    fn test_csv() {
        let csv = render_plan(&validated(), PlanFormat::Csv, &[]).unwrap();
        assert_eq!(
            csv,
            "group_id,topic,partition,current_offset,proposed_offset,clamped_from\n\
             payments,orders,0,5,100,500\n\
             payments,orders,1,-1,3,\n"
        );
    }

    #[test]
    fn test_script() {
        let script = render_plan(
            &validated(),
            PlanFormat::Script,
            &["kafka-1:9092".to_string(), "kafka-2:9092".to_string()],
        )
        .unwrap();
        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains("--bootstrap-server kafka-1:9092,kafka-2:9092"));
        assert!(script.contains("--topic orders:0"));
        assert!(script.contains("--reset-offsets --to-offset 100 --execute"));
    }

    #[test]
    fn test_text_marks_clamps() {
        let text = render_plan(&validated(), PlanFormat::Text, &[]).unwrap();
        assert!(text.contains("clamped from 500"));
        assert!(text.contains("2 partitions, 1 clamped, 0 drifted"));
    }

    #[test]
    fn test_render_is_repeatable() {
        let plan = validated();
        for format in [PlanFormat::Json, PlanFormat::Yaml, PlanFormat::Text] {
            let first = render_plan(&plan, format, &[]).unwrap();
            let second = render_plan(&plan.clone(), format, &[]).unwrap();
            assert_eq!(first, second);
        }
    }
}
