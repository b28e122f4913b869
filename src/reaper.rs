//! # Reaper — Stale-Claim Recovery and Retention
//!
//! A single periodic loop that keeps the queue self-healing:
//!
//! 1. `reclaim_stale_tasks`: claims whose heartbeat went silent longer than
//!    their timeout are requeued, or failed once `max_attempts` is used up
//! 2. `fail_blocked_tasks`: pending tasks whose dependency failed or was
//!    cancelled are failed too
//! 3. complete groups that never got their completion task get one
//! 4. `prune_tasks` / `prune_groups`: terminal rows past `retention_days`
//! 5. refresh the queue-depth, group-count, and disk-free gauges that the
//!    `/metrics` endpoint and the backlog probe read
//!
//! Every step runs even when an earlier one fails; each failure counts as a
//! store error and the tick reports the first one.

use crate::config::PipelineConfig;
use crate::db::Database;
use crate::events::TaskEvent;
use crate::health::disk_free_gb;
use crate::ingest::CompletionTask;
use crate::telemetry::Telemetry;
use crate::worker::sleep_or_shutdown;
use anyhow::Result;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReaperReport {
    pub requeued: u64,
    pub failed: u64,
    /// Pending tasks failed because a dependency did not complete.
    pub blocked: u64,
    /// Completion tasks spawned for groups that were missing one.
    pub respawned: u64,
    pub pruned_tasks: u64,
    pub pruned_groups: u64,
}

pub struct Reaper {
    db: Database,
    telemetry: Arc<Telemetry>,
    interval: Duration,
    default_timeout_sec: i32,
    max_attempts: i32,
    retention: Duration,
    prune_groups: bool,
    disk_paths: Vec<PathBuf>,
    completion: Option<CompletionTask>,
}

/// Groups handled per completion sweep.
const SWEEP_BATCH: i64 = 100;

impl Reaper {
    pub fn new(db: Database, telemetry: Arc<Telemetry>, config: &PipelineConfig) -> Self {
        Reaper {
            db,
            telemetry,
            interval: Duration::from_secs(config.reaper.interval_s.max(1)),
            default_timeout_sec: config.worker.task_timeout_sec,
            max_attempts: config.reaper.max_attempts,
            retention: config.reaper.retention(),
            prune_groups: config.reaper.prune_groups,
            disk_paths: config.health.disk_paths.clone(),
            completion: CompletionTask::from_config(config),
        }
    }

    /// One full pass.
    pub async fn tick(&self) -> Result<ReaperReport> {
        let mut report = ReaperReport::default();
        let mut first_error: Option<anyhow::Error> = None;
        let mut note = |step: &str, e: anyhow::Error| {
            warn!(step, error = %e, "reaper step failed");
            self.telemetry.metrics.increment_store_errors();
            self.telemetry
                .metrics
                .record_error(&format!("reaper {}: {}", step, e));
            first_error.get_or_insert(e);
        };

        match self
            .db
            .reclaim_stale_tasks(self.default_timeout_sec, self.max_attempts)
            .await
        {
            Ok(summary) => {
                report.requeued = summary.requeued.len() as u64;
                report.failed = summary.failed.len() as u64;
                if !summary.is_empty() {
                    self.telemetry.events.emit(TaskEvent::TasksReclaimed {
                        requeued: report.requeued,
                        failed: report.failed,
                    });
                    for _ in &summary.failed {
                        self.telemetry.metrics.increment_failed();
                    }
                }
            }
            Err(e) => note("reclaim", e),
        }

        match self.db.fail_blocked_tasks().await {
            Ok(ids) => {
                report.blocked = ids.len() as u64;
                for _ in &ids {
                    self.telemetry.metrics.increment_failed();
                }
            }
            Err(e) => note("fail_blocked", e),
        }

        if let Some(completion) = &self.completion {
            match self.sweep_completions(completion).await {
                Ok(n) => report.respawned = n,
                Err(e) => note("completions", e),
            }
        }

        match self.db.prune_tasks(self.retention, None, &[]).await {
            Ok(n) => report.pruned_tasks = n,
            Err(e) => note("prune_tasks", e),
        }

        if self.prune_groups {
            match self.db.prune_groups(self.retention).await {
                Ok(n) => report.pruned_groups = n,
                Err(e) => note("prune_groups", e),
            }
        }

        if let Err(e) = self.refresh_gauges().await {
            note("gauges", e);
        }

        if report != ReaperReport::default() {
            info!(
                requeued = report.requeued,
                failed = report.failed,
                blocked = report.blocked,
                respawned = report.respawned,
                pruned_tasks = report.pruned_tasks,
                pruned_groups = report.pruned_groups,
                "reaper pass"
            );
        } else {
            debug!("reaper pass, nothing to do");
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    async fn sweep_completions(&self, completion: &CompletionTask) -> Result<u64> {
        let groups = self
            .db
            .pending_groups_without_task(&completion.queue_name, &completion.task_name, SWEEP_BATCH)
            .await?;
        let mut spawned = 0;
        for group_id in groups {
            if completion.ensure(&self.db, &group_id).await?.is_some() {
                spawned += 1;
            }
        }
        Ok(spawned)
    }

    /// Publish queue depth (summed over queues), group counts, and free disk.
    pub async fn refresh_gauges(&self) -> Result<()> {
        let metrics = &self.telemetry.metrics;

        let mut depth: BTreeMap<&'static str, i64> = BTreeMap::new();
        for stats in self.db.get_all_queue_stats().await? {
            for (status, count) in stats.by_status() {
                *depth.entry(status.as_str()).or_default() += count;
            }
        }
        for status in crate::db::TaskStatus::ALL {
            metrics.set_queue_depth(status.as_str(), depth.get(status.as_str()).copied().unwrap_or(0));
        }

        let groups = self.db.get_ingestion_stats().await?;
        for (state, count) in groups.by_state() {
            metrics.set_group_count(state.as_str(), count);
        }

        for path in &self.disk_paths {
            if let Some(free) = disk_free_gb(path) {
                metrics.set_disk_free(&path.display().to_string(), free);
            }
        }
        Ok(())
    }

    /// Tick every `interval_s` until shutdown. Failed ticks are logged and the
    /// loop carries on.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_s = self.interval.as_secs(), "reaper started");
        loop {
            if let Err(e) = self.tick().await {
                warn!(error = %e, "reaper pass incomplete");
            }
            if sleep_or_shutdown(&mut shutdown, self.interval).await {
                break;
            }
        }
        info!("reaper stopped");
    }
}
