use anyhow::{bail, Context as _, Result};
use clap::Args;
use kafka_ops_core::pipe::{
    run_pipe, AvroCodec, OffsetRange, PartitionStatus, PipeConfig, PipeReport, RecordCodec,
};
use kafka_ops_core::schema_registry::{SchemaRegistry, SchemaRegistryClient};
use kafka_ops_core::{ClusterMetadata, ContextConfig, Shutdown};
use std::sync::Arc;
use tracing::info;

use super::context::{connect, SessionArgs};
use super::OutputFormat;

/// Arguments for `pipe`.
#[derive(Args, Debug, Clone)]
pub struct PipeArgs {
    /// Source topic
    pub source: String,

    /// Destination topic
    pub destination: String,

    /// Context of the source cluster (defaults to the current context)
    #[arg(long)]
    pub from_context: Option<String>,

    /// Context of the destination cluster (defaults to the source context)
    #[arg(long)]
    pub to_context: Option<String>,

    /// Copy only these source partitions (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub partitions: Vec<i32>,

    /// First source offset to copy in every partition
    #[arg(long)]
    pub start_offset: Option<i64>,

    /// Stop before this source offset in every partition
    #[arg(long)]
    pub end_offset: Option<i64>,

    /// Copy at most this many records per partition
    #[arg(short = 'n', long)]
    pub limit: Option<u64>,

    /// Take the --limit records from the end of each partition
    #[arg(long, requires = "limit")]
    pub last: bool,

    /// Decode values as schema-registry framed Avro
    #[arg(long)]
    pub avro: bool,

    /// Re-encode values with the latest schema of this subject
    #[arg(long, requires = "avro", conflicts_with = "target_schema_id")]
    pub target_schema_subject: Option<String>,

    /// Re-encode values with this registered schema
    #[arg(long, requires = "avro")]
    pub target_schema_id: Option<u32>,

    /// Also re-encode record keys
    #[arg(long, requires = "avro")]
    pub transcode_keys: bool,

    /// Skip records that fail to decode instead of stopping the partition
    #[arg(long)]
    pub skip_on_error: bool,

    /// Drop record headers
    #[arg(long)]
    pub no_headers: bool,

    /// Let the destination broker assign timestamps
    #[arg(long)]
    pub no_preserve_timestamps: bool,

    /// Partitions copied concurrently
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Output format (text, json, yaml)
    #[arg(short, long, default_value = "text")]
    pub format: OutputFormat,
}

/// Copy `args.source` to `args.destination`
pub async fn run(session: &SessionArgs, args: &PipeArgs, shutdown: Shutdown) -> Result<()> {
    let config = session.config()?;
    let source_context = session.resolve(&config, args.from_context.as_deref())?;
    let destination_context = match &args.to_context {
        Some(name) => session.resolve(&config, Some(name))?,
        None => source_context.clone(),
    };

    let source = Arc::new(connect(&config, &source_context).await?);
    let destination = if args.to_context.is_some() {
        Arc::new(connect(&config, &destination_context).await?)
    } else {
        Arc::clone(&source)
    };

    let mut options = config.pipe.clone();
    if args.limit.is_some() {
        options.record_limit = args.limit;
    }
    options.from_tail |= args.last;
    if let Some(n) = args.concurrency {
        options.max_concurrent_partitions = n;
    }
    options.skip_on_error |= args.skip_on_error;
    options.transcode_keys |= args.transcode_keys;
    if args.no_headers {
        options.keep_headers = false;
    }
    if args.no_preserve_timestamps {
        options.preserve_timestamps = false;
    }

    let mut pipe_config =
        PipeConfig::new(args.source.clone(), args.destination.clone()).with_options(options);
    if !args.partitions.is_empty() {
        pipe_config = pipe_config.with_partitions(args.partitions.clone());
    }

    if args.start_offset.is_some() || args.end_offset.is_some() {
        let start = args.start_offset.unwrap_or(0);
        let end = args.end_offset.unwrap_or(i64::MAX);
        if start > end {
            bail!("--start-offset {} is past --end-offset {}", start, end);
        }
        let partitions = if args.partitions.is_empty() {
            source
                .list_partitions(&args.source)
                .await?
                .into_iter()
                .map(|tp| tp.partition)
                .collect()
        } else {
            args.partitions.clone()
        };
        for partition in partitions {
            pipe_config = pipe_config.with_range(partition, OffsetRange::new(start, end));
        }
    }

    let codec = if args.avro {
        Some(avro_codec(&source_context, args).await?)
    } else {
        None
    };

    let report = run_pipe(source, destination, codec, &pipe_config, shutdown).await?;

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(&report)?),
        OutputFormat::Text => print_text(&report),
    }

    let unfinished = report.failed_partitions();
    if !unfinished.is_empty() {
        bail!(
            "{} of {} partitions did not finish",
            unfinished.len(),
            report.partitions.len()
        );
    }
    Ok(())
}

async fn avro_codec(context: &ContextConfig, args: &PipeArgs) -> Result<Arc<dyn RecordCodec>> {
    let registry_config = context
        .schema_registry
        .as_ref()
        .context("--avro needs a schema_registry in the source context")?;
    let registry: Arc<dyn SchemaRegistry> = Arc::new(SchemaRegistryClient::new(registry_config)?);
    info!("Using schema registry at {}", registry_config.url);

    let codec = if let Some(subject) = &args.target_schema_subject {
        AvroCodec::for_subject(registry, subject).await?
    } else if let Some(id) = args.target_schema_id {
        AvroCodec::for_schema_id(registry, id).await?
    } else {
        AvroCodec::new(registry)
    };
    Ok(Arc::new(codec))
}

fn print_text(report: &PipeReport) {
    println!(
        "Pipe {} -> {} ({}ms)",
        report.source_topic, report.destination_topic, report.duration_ms
    );
    println!(
        "{:>9}  {:>12}  {:>12}  {:>12}  {:>10}  {:>8}  STATUS",
        "PARTITION", "START", "END", "NEXT", "COPIED", "SKIPPED"
    );
    for p in &report.partitions {
        let status = match &p.status {
            PartitionStatus::Completed => "completed".to_string(),
            PartitionStatus::Cancelled => "cancelled".to_string(),
            PartitionStatus::Failed(failure) => format!("failed: {}", failure.message),
        };
        println!(
            "{:>9}  {:>12}  {:>12}  {:>12}  {:>10}  {:>8}  {}",
            p.partition,
            p.range.start,
            p.range.end,
            p.next_offset,
            p.records_copied,
            p.records_skipped,
            status
        );
    }
    println!();
    println!(
        "Copied {} records, skipped {}",
        report.total_copied, report.total_skipped
    );
}
