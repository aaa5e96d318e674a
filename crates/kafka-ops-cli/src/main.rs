use anyhow::Result;
use clap::{Parser, Subcommand};
use kafka_ops_core::Shutdown;
use std::path::PathBuf;
use tracing::warn;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;

use commands::offsets::ResetArgs;
use commands::OutputFormat;
use commands::pipe::PipeArgs;

#[derive(Parser)]
#[command(name = "kafka-ops")]
#[command(about = "Consumer group offset management and topic piping for Kafka", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path to the configuration file
    #[arg(
        short,
        long,
        global = true,
        env = "KAFKA_OPS_CONFIG",
        default_value = "kafka-ops.yaml"
    )]
    config: PathBuf,

    /// Context to use instead of the configured current context
    #[arg(long, global = true, env = "KAFKA_OPS_CONTEXT")]
    context: Option<String>,

    /// Bootstrap servers (comma-separated); overrides the context
    #[arg(long, global = true, value_delimiter = ',')]
    bootstrap_servers: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect consumer groups
    Groups {
        #[command(subcommand)]
        action: GroupsAction,
    },

    /// Plan and apply consumer group offset resets
    Offsets {
        #[command(subcommand)]
        action: OffsetsAction,
    },

    /// Copy records from one topic to another
    Pipe(PipeArgs),
}

#[derive(Subcommand)]
enum GroupsAction {
    /// List consumer groups
    List {
        /// Output format (text, json, yaml)
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Show group state, members and per-partition lag
    Describe {
        /// Consumer group ID
        group: String,

        /// Output format (text, json, yaml)
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },
}

#[derive(Subcommand)]
enum OffsetsAction {
    /// Build and validate an offset reset plan without applying it
    Plan(ResetArgs),

    /// Build, validate and commit an offset reset plan
    Apply {
        #[command(flatten)]
        reset: ResetArgs,

        /// Apply even if offsets had to be clamped to partition bounds
        #[arg(long)]
        allow_clamped: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    // Priority: RUST_LOG env var > verbose flag > default (info)
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match cli.verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let shutdown = Shutdown::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping");
            signal.trigger();
        }
    });

    let session = commands::context::SessionArgs {
        config_path: cli.config,
        context: cli.context,
        bootstrap_servers: cli.bootstrap_servers,
    };

    match cli.command {
        Commands::Groups { action } => match action {
            GroupsAction::List { format } => {
                commands::groups::list(&session, format).await?;
            }
            GroupsAction::Describe { group, format } => {
                commands::groups::describe(&session, &group, format).await?;
            }
        },
        Commands::Offsets { action } => match action {
            OffsetsAction::Plan(reset) => {
                commands::offsets::plan(&session, &reset).await?;
            }
            OffsetsAction::Apply {
                reset,
                allow_clamped,
            } => {
                commands::offsets::apply(&session, &reset, allow_clamped, shutdown).await?;
            }
        },
        Commands::Pipe(args) => {
            commands::pipe::run(&session, &args, shutdown).await?;
        }
    }

    Ok(())
}
