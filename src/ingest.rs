//! # Ingest — Subband Discovery and Group Completion
//!
//! Turns subband files into group bookkeeping:
//!
//! ```text
//! <dir>/2025-10-02T00:12:03_sb07.hdf5
//!     └─ parse_subband_filename ─▶ ("2025-10-02T00:12:03", 7)
//!         └─ find_or_create_group(±tolerance) ─▶ "2025-10-02T00:12:00"
//!             └─ record_subband ─▶ became_complete?
//!                 └─ spawn_group_task_once(queue, "convert-group", group_id)
//! ```
//!
//! The completion task is keyed by group id, so re-ingesting a path of a
//! complete group retries a spawn that failed or never ran, without ever
//! creating a second task. The reaper sweeps for any group still left behind.
//!
//! Two ways in: [`SubbandIngestor::bootstrap_directory`] registers whatever is
//! already on disk (sorted, so the earliest timestamp seeds each group), and
//! [`SubbandIngestor::watch_directory`] polls for new arrivals until shutdown.

use crate::config::PipelineConfig;
use crate::db::{Database, GroupState, RecordOutcome};
use crate::events::TaskEvent;
use crate::group_id::parse_subband_filename;
use crate::telemetry::Telemetry;
use crate::worker::sleep_or_shutdown;
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What happened to one file.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestResult {
    Recorded(RecordOutcome),
    /// The path is already known to the store.
    AlreadyRecorded { group_id: String },
    /// Not a subband file by name.
    Ignored,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub recorded: u64,
    pub duplicates: u64,
    pub ignored: u64,
    pub errors: u64,
    pub completed_groups: Vec<String>,
}

impl IngestSummary {
    fn add(&mut self, result: &IngestResult) {
        match result {
            IngestResult::Recorded(outcome) => {
                if outcome.inserted {
                    self.recorded += 1;
                } else {
                    self.duplicates += 1;
                }
                if outcome.became_complete {
                    self.completed_groups.push(outcome.group_id.clone());
                }
            }
            IngestResult::AlreadyRecorded { .. } => self.duplicates += 1,
            IngestResult::Ignored => self.ignored += 1,
        }
    }
}

/// The task spawned once per complete group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionTask {
    pub queue_name: String,
    pub task_name: String,
    pub priority: i32,
}

impl CompletionTask {
    /// `None` when `spawn_on_complete` is off.
    pub fn from_config(config: &PipelineConfig) -> Option<Self> {
        let ingest = &config.ingest;
        ingest.spawn_on_complete.then(|| CompletionTask {
            queue_name: config.worker.queue_name.clone(),
            task_name: ingest.completion_task.clone(),
            priority: ingest.completion_priority,
        })
    }

    /// Spawn the task for `group_id` unless it already has one.
    pub async fn ensure(&self, db: &Database, group_id: &str) -> Result<Option<Uuid>> {
        let task_id = db
            .spawn_group_task_once(&self.queue_name, &self.task_name, group_id, self.priority)
            .await
            .with_context(|| format!("spawning {} for {}", self.task_name, group_id))?;
        if let Some(task_id) = task_id {
            info!(%task_id, queue = %self.queue_name, task = %self.task_name, group_id, "spawned completion task");
        }
        Ok(task_id)
    }
}

pub struct SubbandIngestor {
    db: Database,
    telemetry: Arc<Telemetry>,
    expected_subbands: i32,
    tolerance_s: f64,
    scan_interval: Duration,
    completion: Option<CompletionTask>,
}

impl SubbandIngestor {
    pub fn new(db: Database, telemetry: Arc<Telemetry>, config: &PipelineConfig) -> Self {
        let ingest = &config.ingest;
        SubbandIngestor {
            db,
            telemetry,
            expected_subbands: ingest.expected_subbands,
            tolerance_s: ingest.cluster_tolerance_s,
            scan_interval: Duration::from_secs(ingest.scan_interval_s.max(1)),
            completion: CompletionTask::from_config(config),
        }
    }

    /// Cluster one subband into its group and record it.
    pub async fn ingest(
        &self,
        timestamp: &str,
        subband_index: i32,
        file_path: &str,
        dec_deg: Option<f64>,
    ) -> Result<IngestResult> {
        if let Some(existing) = self.db.get_subband_by_path(file_path).await? {
            debug!(path = file_path, group_id = %existing.group_id, "already recorded");
            if let Some(completion) = &self.completion {
                let group = self.db.get_group(&existing.group_id).await?;
                if group.is_some_and(|g| g.state == GroupState::Pending.as_str()) {
                    completion.ensure(&self.db, &existing.group_id).await?;
                }
            }
            return Ok(IngestResult::AlreadyRecorded {
                group_id: existing.group_id,
            });
        }

        let group_id = self
            .db
            .find_or_create_group(timestamp, self.tolerance_s, self.expected_subbands)
            .await?;
        let outcome = self
            .db
            .record_subband(&group_id, subband_index, file_path, dec_deg)
            .await?;

        if outcome.became_complete {
            info!(
                group_id = %outcome.group_id,
                subbands = outcome.subband_count,
                "group complete"
            );
            self.telemetry.events.emit(TaskEvent::GroupCompleted {
                group_id: outcome.group_id.clone(),
                subband_count: outcome.subband_count,
            });
            if let Some(completion) = &self.completion {
                completion.ensure(&self.db, &outcome.group_id).await?;
            }
        }
        Ok(IngestResult::Recorded(outcome))
    }

    /// Ingest a file named `<timestamp>_sb<NN>.hdf5`.
    pub async fn ingest_path(&self, path: &Path) -> Result<IngestResult> {
        let Some((timestamp, index)) = parse_subband_filename(path) else {
            return Ok(IngestResult::Ignored);
        };
        let index = i32::try_from(index).context("subband index out of range")?;
        self.ingest(&timestamp, index, &path.to_string_lossy(), None)
            .await
    }

    /// Register every subband file already in `dir`, oldest name first.
    /// Per-file failures are logged and counted; the scan carries on.
    pub async fn bootstrap_directory(&self, dir: &Path) -> Result<IngestSummary> {
        let files = list_subband_files(dir).await?;
        info!(dir = %dir.display(), files = files.len(), "bootstrapping");
        let mut summary = IngestSummary::default();
        for path in files {
            match self.ingest_path(&path).await {
                Ok(result) => summary.add(&result),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "ingest failed");
                    self.telemetry.metrics.increment_store_errors();
                    self.telemetry
                        .metrics
                        .record_error(&format!("ingest {}: {}", path.display(), e));
                    summary.errors += 1;
                }
            }
        }
        info!(
            recorded = summary.recorded,
            duplicates = summary.duplicates,
            completed = summary.completed_groups.len(),
            errors = summary.errors,
            "bootstrap done"
        );
        Ok(summary)
    }

    /// Poll `dir` every `scan_interval_s` until shutdown. A file that fails to
    /// ingest is retried on the next scan, and a file that disappears and
    /// comes back is looked at again.
    pub async fn watch_directory(&self, dir: &Path, mut shutdown: watch::Receiver<bool>) -> IngestSummary {
        let metrics = &self.telemetry.metrics;
        let mut seen: HashSet<PathBuf> = HashSet::new();
        let mut summary = IngestSummary::default();
        info!(dir = %dir.display(), interval_s = self.scan_interval.as_secs(), "watching");
        metrics.set_watcher_status("running");

        loop {
            match list_subband_files(dir).await {
                Ok(files) => {
                    let mut healthy = true;
                    for path in unseen_paths(&mut seen, files) {
                        match self.ingest_path(&path).await {
                            Ok(result) => {
                                summary.add(&result);
                                seen.insert(path);
                            }
                            Err(e) => {
                                warn!(path = %path.display(), error = %e, "ingest failed, will retry");
                                metrics.increment_store_errors();
                                metrics.record_error(&format!("ingest {}: {}", path.display(), e));
                                summary.errors += 1;
                                healthy = false;
                            }
                        }
                    }
                    metrics.set_watcher_status(if healthy { "running" } else { "error" });
                }
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "scan failed");
                    metrics.record_error(&format!("scan {}: {}", dir.display(), e));
                    metrics.set_watcher_status("error");
                }
            }
            if sleep_or_shutdown(&mut shutdown, self.scan_interval).await {
                break;
            }
        }

        metrics.set_watcher_status("stopped");
        info!(recorded = summary.recorded, "watcher stopped");
        summary
    }
}

/// Forget paths missing from `listed`, then return the listed paths not yet
/// seen, in listing order.
fn unseen_paths(seen: &mut HashSet<PathBuf>, listed: Vec<PathBuf>) -> Vec<PathBuf> {
    let current: HashSet<&PathBuf> = listed.iter().collect();
    seen.retain(|p| current.contains(p));
    listed.into_iter().filter(|p| !seen.contains(p)).collect()
}

/// Subband files directly inside `dir`, sorted by name.
pub async fn list_subband_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("reading {}", dir.display()))?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_file() && parse_subband_filename(&path).is_some() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(inserted: bool, became_complete: bool) -> RecordOutcome {
        RecordOutcome {
            group_id: "2025-10-02T00:12:00".into(),
            inserted,
            subband_count: 16,
            expected_subbands: 16,
            state: GroupState::Pending,
            became_complete,
        }
    }

    #[test]
    fn summary_tallies_results() {
        let mut summary = IngestSummary::default();
        summary.add(&IngestResult::Recorded(outcome(true, false)));
        summary.add(&IngestResult::Recorded(outcome(true, true)));
        summary.add(&IngestResult::Recorded(outcome(false, false)));
        summary.add(&IngestResult::AlreadyRecorded {
            group_id: "2025-10-02T00:12:00".into(),
        });
        summary.add(&IngestResult::Ignored);
        assert_eq!(summary.recorded, 2);
        assert_eq!(summary.duplicates, 2);
        assert_eq!(summary.ignored, 1);
        assert_eq!(summary.completed_groups, vec!["2025-10-02T00:12:00".to_string()]);
    }

    #[test]
    fn unseen_paths_forget_files_that_disappear() {
        let a = PathBuf::from("/in/2025-10-02T00:12:00_sb00.hdf5");
        let b = PathBuf::from("/in/2025-10-02T00:12:00_sb01.hdf5");
        let mut seen = HashSet::new();

        let fresh = unseen_paths(&mut seen, vec![a.clone(), b.clone()]);
        assert_eq!(fresh, vec![a.clone(), b.clone()]);
        seen.extend(fresh);

        assert!(unseen_paths(&mut seen, vec![a.clone(), b.clone()]).is_empty());

        // b is moved away, then copied back in
        assert!(unseen_paths(&mut seen, vec![a.clone()]).is_empty());
        assert!(!seen.contains(&b));
        assert_eq!(unseen_paths(&mut seen, vec![a, b.clone()]), vec![b]);
    }

    #[test]
    fn completion_task_follows_config() {
        let mut config = PipelineConfig::default();
        let task = CompletionTask::from_config(&config).unwrap();
        assert_eq!(task.queue_name, config.worker.queue_name);
        assert_eq!(task.task_name, "convert-group");

        config.ingest.spawn_on_complete = false;
        assert!(CompletionTask::from_config(&config).is_none());
    }

    #[tokio::test]
    async fn lists_only_subband_files_in_order() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "2025-10-02T00:12:05_sb03.hdf5",
            "2025-10-02T00:12:00_sb00.hdf5",
            "notes.txt",
            "2025-10-02T00:12:00_sb01.fits",
        ] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        std::fs::create_dir(dir.path().join("2025-10-02T00:13:00_sb00.hdf5")).unwrap();

        let files = list_subband_files(dir.path()).await.unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec!["2025-10-02T00:12:00_sb00.hdf5", "2025-10-02T00:12:05_sb03.hdf5"]
        );
    }

    #[tokio::test]
    async fn missing_directory_is_an_error() {
        let err = list_subband_files(Path::new("/nonexistent/incoming"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/incoming"));
    }
}
