//! # CLI Execution Functions
//!
//! Runners for each subcommand. Long-running commands (`worker`, `reaper`,
//! `ingest --watch`) share one shutdown channel flipped by SIGINT/SIGTERM and
//! serve `/healthz`, `/readyz`, `/metrics` beside their main loop.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use subband_dispatch::config::PipelineConfig;
use subband_dispatch::db::{Database, GroupState, TaskStatus};
use subband_dispatch::executor::CommandExecutor;
use subband_dispatch::group_id::parse_subband_filename;
use subband_dispatch::ingest::{IngestResult, SubbandIngestor};
use subband_dispatch::reaper::Reaper;
use subband_dispatch::server;
use subband_dispatch::telemetry::Telemetry;
use subband_dispatch::worker::{Worker, WorkerOptions};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::{Cli, Commands, GroupAction, TaskAction};

pub fn run_config(config: &PipelineConfig) -> Result<()> {
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

pub async fn run(cli: &Cli, config: PipelineConfig) -> Result<()> {
    let database_url = cli.database_url.as_deref().ok_or_else(|| {
        anyhow::anyhow!("DATABASE_URL is required (set via --database-url or env)")
    })?;
    let db = Database::connect(database_url).await?;

    match &cli.command {
        Commands::Migrate => {
            db.migrate().await?;
            println!("schema up to date");
            Ok(())
        }
        Commands::Record { path, dec_deg } => run_record(db, &config, path, *dec_deg).await,
        Commands::Ingest {
            dir,
            watch,
            no_server,
        } => {
            let dir = dir.clone().unwrap_or_else(|| config.ingest.incoming_dir.clone());
            run_ingest(db, &config, &dir, *watch, *no_server).await
        }
        Commands::Spawn {
            task_name,
            queue,
            params,
            priority,
            timeout_sec,
            depends_on,
        } => {
            let params: serde_json::Value =
                serde_json::from_str(params).context("--params must be valid JSON")?;
            if !params.is_object() {
                anyhow::bail!("--params must be a JSON object");
            }
            let queue = queue.as_deref().unwrap_or(&config.worker.queue_name);
            let task_id = db
                .spawn_task_with_deps(queue, task_name, &params, *priority, *timeout_sec, depends_on)
                .await?;
            println!("{}", task_id);
            Ok(())
        }
        Commands::Worker {
            worker_id,
            no_server,
        } => run_worker(db, &config, worker_id.as_deref(), *no_server).await,
        Commands::Reaper { once, no_server } => run_reaper(db, &config, *once, *no_server).await,
        Commands::Tasks { action } => run_tasks(&db, &config, action).await,
        Commands::Groups { action } => run_groups(&db, &config, action).await,
        Commands::Config => run_config(&config),
    }
}

// ── Long-running commands ───────────────────────────────────────

fn shutdown_channel() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        server::shutdown_signal().await;
        let _ = tx.send(true);
    });
    rx
}

fn spawn_server(
    config: &PipelineConfig,
    telemetry: &Arc<Telemetry>,
    shutdown: &watch::Receiver<bool>,
    disabled: bool,
) -> Result<Option<JoinHandle<Result<()>>>> {
    if disabled {
        return Ok(None);
    }
    let addr: SocketAddr = config
        .server
        .listen
        .parse()
        .with_context(|| format!("invalid server.listen {}", config.server.listen))?;
    Ok(Some(tokio::spawn(server::serve(
        addr,
        Arc::clone(telemetry),
        shutdown.clone(),
    ))))
}

async fn join_server(handle: Option<JoinHandle<Result<()>>>) {
    if let Some(handle) = handle {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "health server failed"),
            Err(e) => warn!(error = %e, "health server task ended abnormally"),
        }
    }
}

async fn run_worker(
    db: Database,
    config: &PipelineConfig,
    worker_id: Option<&str>,
    no_server: bool,
) -> Result<()> {
    let program = config
        .executor
        .program
        .clone()
        .ok_or_else(|| anyhow::anyhow!("executor.program is not configured"))?;
    let executor = CommandExecutor::new(
        program,
        config.executor.args.clone(),
        config.executor.timeout_s.map(Duration::from_secs),
    );

    let telemetry = Telemetry::from_config(&config.health, &["worker"]);
    let shutdown = shutdown_channel();
    let server = spawn_server(config, &telemetry, &shutdown, no_server)?;

    let mut worker = Worker::new(
        Arc::new(db),
        Arc::new(executor),
        Arc::clone(&telemetry),
        WorkerOptions::from_config(config),
    );
    if let Some(id) = worker_id {
        worker = worker.with_worker_id(id);
    }
    let summary = worker.run(shutdown).await;
    join_server(server).await;
    println!("{}", serde_json::to_string(&serde_json::json!({
        "worker_id": worker.worker_id(),
        "completed": summary.completed,
        "failed": summary.failed,
        "released": summary.released,
        "claim_lost": summary.claim_lost,
        "unresolved": summary.unresolved,
    }))?);
    Ok(())
}

async fn run_reaper(db: Database, config: &PipelineConfig, once: bool, no_server: bool) -> Result<()> {
    if once {
        let reaper = Reaper::new(db, Arc::new(Telemetry::new()), config);
        let report = reaper.tick().await?;
        println!(
            "requeued {}, failed {}, failed {} blocked, spawned {} completion task(s), pruned {} task(s) and {} group(s)",
            report.requeued,
            report.failed,
            report.blocked,
            report.respawned,
            report.pruned_tasks,
            report.pruned_groups
        );
        return Ok(());
    }

    let telemetry = Telemetry::from_config(&config.health, &[]);
    let shutdown = shutdown_channel();
    let server = spawn_server(config, &telemetry, &shutdown, no_server)?;
    Reaper::new(db, Arc::clone(&telemetry), config)
        .run(shutdown)
        .await;
    join_server(server).await;
    Ok(())
}

async fn run_record(
    db: Database,
    config: &PipelineConfig,
    path: &Path,
    dec_deg: Option<f64>,
) -> Result<()> {
    let (timestamp, index) = parse_subband_filename(path)
        .ok_or_else(|| anyhow::anyhow!("{} is not named <timestamp>_sbNN.hdf5", path.display()))?;
    let path = tokio::fs::canonicalize(path)
        .await
        .with_context(|| format!("resolving {}", path.display()))?;
    let ingestor = SubbandIngestor::new(db, Arc::new(Telemetry::new()), config);
    let result = ingestor
        .ingest(&timestamp, i32::try_from(index)?, &path.to_string_lossy(), dec_deg)
        .await?;
    match result {
        IngestResult::Recorded(outcome) => {
            println!(
                "{} sb{:02} -> {} ({}/{}, {})",
                path.display(),
                index,
                outcome.group_id,
                outcome.subband_count,
                outcome.expected_subbands,
                outcome.state
            );
            if outcome.became_complete {
                println!("group {} complete", outcome.group_id);
            }
        }
        IngestResult::AlreadyRecorded { group_id } => {
            println!("{} already recorded in {}", path.display(), group_id);
        }
        IngestResult::Ignored => {}
    }
    Ok(())
}

async fn run_ingest(
    db: Database,
    config: &PipelineConfig,
    dir: &Path,
    watch: bool,
    no_server: bool,
) -> Result<()> {
    let dir = tokio::fs::canonicalize(dir)
        .await
        .with_context(|| format!("resolving {}", dir.display()))?;

    if !watch {
        let ingestor = SubbandIngestor::new(db, Arc::new(Telemetry::new()), config);
        let summary = ingestor.bootstrap_directory(&dir).await?;
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    let telemetry = Telemetry::from_config(&config.health, &["watcher"]);
    let shutdown = shutdown_channel();
    let server = spawn_server(config, &telemetry, &shutdown, no_server)?;
    let ingestor = SubbandIngestor::new(db, Arc::clone(&telemetry), config);
    let summary = ingestor.watch_directory(&dir, shutdown).await;
    join_server(server).await;
    info!(
        recorded = summary.recorded,
        completed = summary.completed_groups.len(),
        "ingest finished"
    );
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

// ── Inspection commands ─────────────────────────────────────────

async fn run_tasks(db: &Database, config: &PipelineConfig, action: &TaskAction) -> Result<()> {
    match action {
        TaskAction::List {
            queue,
            status,
            limit,
        } => {
            let status = status.as_deref().map(str::parse::<TaskStatus>).transpose()?;
            let tasks = db.list_tasks(queue.as_deref(), status, *limit).await?;
            for t in &tasks {
                println!(
                    "{}  {:<10} {:<9} {:<20} attempt {} {}",
                    t.task_id,
                    t.queue_name,
                    t.status,
                    t.task_name,
                    t.attempt,
                    t.worker_id.as_deref().unwrap_or("-")
                );
            }
            println!("{} task(s)", tasks.len());
        }
        TaskAction::Get { task_id } => match db.get_task(*task_id).await? {
            Some(task) => println!("{}", serde_json::to_string_pretty(&task)?),
            None => anyhow::bail!("task {} not found", task_id),
        },
        TaskAction::Cancel { task_id } => {
            if db.cancel_task(*task_id).await? {
                println!("cancelled {}", task_id);
            } else {
                anyhow::bail!("task {} not found or already finished", task_id);
            }
        }
        TaskAction::Prune {
            older_than_days,
            queue,
            statuses,
        } => {
            let days = older_than_days.unwrap_or(config.reaper.retention_days);
            let statuses = statuses
                .iter()
                .map(|s| s.parse::<TaskStatus>())
                .collect::<Result<Vec<_>>>()?;
            let deleted = db
                .prune_tasks(
                    Duration::from_secs(u64::from(days) * 86_400),
                    queue.as_deref(),
                    &statuses,
                )
                .await?;
            println!("pruned {} task(s)", deleted);
        }
        TaskAction::Stats { queue } => {
            let stats = match queue {
                Some(q) => vec![db.get_queue_stats(q).await?],
                None => db.get_all_queue_stats().await?,
            };
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }
    Ok(())
}

async fn run_groups(db: &Database, config: &PipelineConfig, action: &GroupAction) -> Result<()> {
    match action {
        GroupAction::List { state, limit } => {
            let state = state.as_deref().map(str::parse::<GroupState>).transpose()?;
            let groups = db.list_groups(state, *limit).await?;
            for g in &groups {
                println!(
                    "{}  {:<11} {:>2}/{:<2} {}",
                    g.group_id,
                    g.state,
                    g.subband_count,
                    g.expected_subbands,
                    g.error.as_deref().unwrap_or("")
                );
            }
            println!("{} group(s)", groups.len());
        }
        GroupAction::Show { group_id } => {
            let Some(group) = db.get_group(group_id).await? else {
                anyhow::bail!("group {} not found", group_id);
            };
            let files = db.get_group_files(group_id).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "group": group,
                    "files": files,
                }))?
            );
        }
        GroupAction::Stats => {
            let stats = db.get_ingestion_stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        GroupAction::Consolidate { tolerance_s } => {
            let tolerance = tolerance_s.unwrap_or(config.ingest.cluster_tolerance_s);
            let merged = db.consolidate_fragmented_groups(tolerance).await?;
            println!("merged {} group(s)", merged);
        }
    }
    Ok(())
}
