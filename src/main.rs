//! # Main — CLI Entry Point
//!
//! Parses the command line, loads the TOML config, and hands each subcommand
//! to its runner in [`cli`].
//!
//! ## Global Options
//!
//! - `--database-url` / `DATABASE_URL`: PostgreSQL connection.
//! - `--config` / `SUBBAND_CONFIG`: TOML config file (defaults apply when unset).
//!
//! ## Logging
//!
//! `LOG_FORMAT=json` switches to JSON lines for log shippers; otherwise
//! human-readable output goes to stderr. `RUST_LOG` filters both.

mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(
    name = "subband-dispatch",
    version,
    about = "Group subband files into observations and dispatch them through a PostgreSQL task queue"
)]
struct Cli {
    /// PostgreSQL connection URL (or set DATABASE_URL env var)
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    /// Path to the TOML config file (or set SUBBAND_CONFIG env var)
    #[arg(long, env = "SUBBAND_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or update the database schema
    Migrate,
    /// Record one subband file against its group
    Record {
        /// Path to a `<timestamp>_sbNN.hdf5` file
        path: PathBuf,
        /// Declination of the pointing, in degrees
        #[arg(long)]
        dec_deg: Option<f64>,
    },
    /// Register every subband file in a directory, optionally watching for more
    Ingest {
        /// Directory to scan (defaults to ingest.incoming_dir)
        dir: Option<PathBuf>,
        /// Keep polling for new files until interrupted
        #[arg(long)]
        watch: bool,
        /// Do not start the health/metrics server while watching
        #[arg(long)]
        no_server: bool,
    },
    /// Enqueue a task
    Spawn {
        /// Task name handed to the executor
        task_name: String,
        /// Queue (defaults to worker.queue_name)
        #[arg(long)]
        queue: Option<String>,
        /// Task parameters as a JSON object
        #[arg(long, default_value = "{}")]
        params: String,
        /// Higher priority is claimed first
        #[arg(long, default_value_t = 0)]
        priority: i32,
        /// Per-task heartbeat timeout in seconds
        #[arg(long)]
        timeout_sec: Option<i32>,
        /// Task that must complete first (repeatable)
        #[arg(long = "depends-on", value_name = "TASK_ID")]
        depends_on: Vec<uuid::Uuid>,
    },
    /// Claim and execute tasks until interrupted
    Worker {
        /// Override the generated `<host>-<suffix>` worker id
        #[arg(long)]
        worker_id: Option<String>,
        /// Do not start the health/metrics server
        #[arg(long)]
        no_server: bool,
    },
    /// Recover stale claims and prune old rows on an interval
    Reaper {
        /// Run a single pass and print what it did
        #[arg(long)]
        once: bool,
        /// Do not start the health/metrics server
        #[arg(long)]
        no_server: bool,
    },
    /// Inspect and manage tasks
    Tasks {
        #[command(subcommand)]
        action: TaskAction,
    },
    /// Inspect and manage subband groups
    Groups {
        #[command(subcommand)]
        action: GroupAction,
    },
    /// Print the effective configuration as TOML
    Config,
}

#[derive(Subcommand)]
enum TaskAction {
    /// List recent tasks
    List {
        #[arg(long)]
        queue: Option<String>,
        /// pending, claimed, completed, failed, or cancelled
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Show one task as JSON
    Get { task_id: uuid::Uuid },
    /// Cancel a task that has not reached a terminal status
    Cancel { task_id: uuid::Uuid },
    /// Delete terminal tasks older than the retention window
    Prune {
        /// Retention in days (defaults to reaper.retention_days)
        #[arg(long)]
        older_than_days: Option<u32>,
        #[arg(long)]
        queue: Option<String>,
        /// Terminal statuses to prune (defaults to all of them)
        #[arg(long = "status")]
        statuses: Vec<String>,
    },
    /// Per-status counts
    Stats {
        /// Single queue; all queues when omitted
        #[arg(long)]
        queue: Option<String>,
    },
}

#[derive(Subcommand)]
enum GroupAction {
    /// List groups, oldest first
    List {
        /// collecting, pending, normalizing, converting, completed, or failed
        #[arg(long)]
        state: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Show one group and its subband files
    Show { group_id: String },
    /// Counts per state
    Stats,
    /// Merge fragmented groups that fall within the clustering tolerance
    Consolidate {
        /// Tolerance in seconds (defaults to ingest.cluster_tolerance_s)
        #[arg(long)]
        tolerance_s: Option<f64>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let config = subband_dispatch::config::load(cli.config.as_deref())?;

    if let Commands::Config = &cli.command {
        return cli::run_config(&config);
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(cli::run(&cli, config))
}
