//! # Worker — Claim, Heartbeat, Execute, Resolve
//!
//! One worker drains one queue. Each claimed task runs with a heartbeat loop
//! beside it, so a long conversion never looks stale to the reaper.
//!
//! ## Data Flow
//!
//! ```text
//! poll loop ──claim_task──▶ TaskRow
//!     │                       │
//!     │         spawn ────────┼──▶ heartbeat loop (every heartbeat_interval)
//!     │                       │        └─ rejected ⇒ claim lost, stop retrying
//!     │                       ▼
//!     │                 executor (retried in-line per RetryPolicy)
//!     │                       │
//!     │         stop heartbeat, then resolve:
//!     │           success  ⇒ complete_task
//!     │           failure  ⇒ fail_task
//!     │           shutdown ⇒ release_task
//!     ▼
//! idle sleep (poll_interval) when the queue is empty
//! ```
//!
//! ## Shutdown
//!
//! A `watch` channel carries the shutdown flag. The in-flight executor call is
//! never interrupted; a pending retry backoff is, and the task goes back to
//! `pending` through `release_task` so another worker can pick it up at once.
//!
//! ## Store Seam
//!
//! [`TaskStore`] is the narrow slice of [`Database`] the worker needs. Store
//! calls made while resolving are retried with the worker's policy; a store
//! error that outlives the policy leaves the claim for the reaper.

use crate::config::PipelineConfig;
use crate::db::{Database, TaskRow};
use crate::error::PipelineError;
use crate::events::TaskEvent;
use crate::executor::{kind_for_task, ExecutionOutcome, Executor};
use crate::health::panic_message;
use crate::retry::RetryPolicy;
use crate::telemetry::Telemetry;
use anyhow::Result;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Queue operations the worker depends on.
pub trait TaskStore: Send + Sync + 'static {
    fn claim_task(
        &self,
        queue_name: &str,
        worker_id: &str,
    ) -> impl Future<Output = Result<Option<TaskRow>>> + Send;

    fn heartbeat_task(&self, task_id: Uuid, worker_id: &str) -> impl Future<Output = Result<bool>> + Send;

    fn complete_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        result: &Value,
    ) -> impl Future<Output = Result<bool>> + Send;

    fn fail_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        error: &str,
    ) -> impl Future<Output = Result<bool>> + Send;

    fn release_task(&self, task_id: Uuid, worker_id: &str) -> impl Future<Output = Result<bool>> + Send;
}

impl TaskStore for Database {
    fn claim_task(
        &self,
        queue_name: &str,
        worker_id: &str,
    ) -> impl Future<Output = Result<Option<TaskRow>>> + Send {
        Database::claim_task(self, queue_name, worker_id)
    }

    fn heartbeat_task(&self, task_id: Uuid, worker_id: &str) -> impl Future<Output = Result<bool>> + Send {
        Database::heartbeat_task(self, task_id, worker_id)
    }

    fn complete_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        result: &Value,
    ) -> impl Future<Output = Result<bool>> + Send {
        Database::complete_task(self, task_id, worker_id, result)
    }

    fn fail_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        error: &str,
    ) -> impl Future<Output = Result<bool>> + Send {
        Database::fail_task(self, task_id, worker_id, error)
    }

    fn release_task(&self, task_id: Uuid, worker_id: &str) -> impl Future<Output = Result<bool>> + Send {
        Database::release_task(self, task_id, worker_id)
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("HOST"))
        .or_else(|_| sysinfo::System::host_name().ok_or(std::env::VarError::NotPresent))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// `<hostname>-<8 hex chars>`, unique per process start.
pub fn generate_worker_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", hostname(), &suffix[..8])
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub queue_name: String,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub retry: RetryPolicy,
}

impl WorkerOptions {
    pub fn from_config(config: &PipelineConfig) -> Self {
        WorkerOptions {
            queue_name: config.worker.queue_name.clone(),
            poll_interval: config.worker.poll_interval(),
            heartbeat_interval: config.worker.heartbeat_interval(),
            retry: config.retry.policy(),
        }
    }
}

/// How a claimed task left the worker.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskResolution {
    Completed,
    Failed { error: String },
    Released,
    /// The resolving transition matched no row: the claim was reclaimed,
    /// cancelled, or resolved by someone else.
    ClaimLost,
    /// The store stayed unreachable; the reaper will recover the claim.
    Unresolved { error: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub completed: u64,
    pub failed: u64,
    pub released: u64,
    pub claim_lost: u64,
    pub unresolved: u64,
}

impl WorkerSummary {
    fn record(&mut self, resolution: &TaskResolution) {
        match resolution {
            TaskResolution::Completed => self.completed += 1,
            TaskResolution::Failed { .. } => self.failed += 1,
            TaskResolution::Released => self.released += 1,
            TaskResolution::ClaimLost => self.claim_lost += 1,
            TaskResolution::Unresolved { .. } => self.unresolved += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.completed + self.failed + self.released + self.claim_lost + self.unresolved
    }
}

enum Backoff {
    Elapsed,
    ClaimLost,
    Shutdown,
}

/// Sleep for `duration` unless shutdown arrives first. Returns `true` on
/// shutdown, including when the sender side has gone away.
pub async fn sleep_or_shutdown(shutdown: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => *shutdown.borrow(),
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

/// Heartbeat period for one claim: the configured interval, shortened to a
/// third of the task's own timeout so a short-timeout task is never reclaimed
/// while it runs.
pub fn heartbeat_cadence(configured: Duration, timeout_sec: Option<i32>) -> Duration {
    match timeout_sec {
        Some(t) if t > 0 => configured.min(Duration::from_secs_f64(f64::from(t) / 3.0)),
        _ => configured,
    }
}

async fn heartbeat_loop<S: TaskStore>(
    store: Arc<S>,
    telemetry: Arc<Telemetry>,
    task_id: Uuid,
    worker_id: String,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
    lost: watch::Sender<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // claim_task already stamped last_heartbeat
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.changed() => return,
        }
        match store.heartbeat_task(task_id, &worker_id).await {
            Ok(true) => debug!(%task_id, "heartbeat"),
            Ok(false) => {
                warn!(%task_id, "heartbeat rejected, claim lost");
                let _ = lost.send(true);
                telemetry.events.emit(TaskEvent::HeartbeatRejected {
                    task_id: task_id.to_string(),
                    worker_id,
                });
                return;
            }
            Err(e) => {
                warn!(%task_id, error = %e, "heartbeat failed");
                telemetry.metrics.increment_store_errors();
            }
        }
    }
}

pub struct Worker<S, E> {
    store: Arc<S>,
    executor: Arc<E>,
    telemetry: Arc<Telemetry>,
    options: WorkerOptions,
    worker_id: String,
}

impl<S: TaskStore, E: Executor> Worker<S, E> {
    pub fn new(store: Arc<S>, executor: Arc<E>, telemetry: Arc<Telemetry>, options: WorkerOptions) -> Self {
        Worker {
            store,
            executor,
            telemetry,
            options,
            worker_id: generate_worker_id(),
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Poll until shutdown. Claim errors are logged and retried after the
    /// poll interval; they never end the loop.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> WorkerSummary {
        let metrics = &self.telemetry.metrics;
        let mut summary = WorkerSummary::default();
        info!(
            worker_id = %self.worker_id,
            queue = %self.options.queue_name,
            "worker started"
        );
        metrics.set_worker_status("idle");

        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.run_once(&mut shutdown).await {
                Ok(Some(resolution)) => {
                    summary.record(&resolution);
                    metrics.set_worker_status("running");
                    continue;
                }
                Ok(None) => metrics.set_worker_status("idle"),
                Err(e) => {
                    error!(error = %e, "claim failed");
                    metrics.increment_store_errors();
                    metrics.record_error(&format!("claim failed: {}", e));
                    metrics.set_worker_status("error");
                }
            }
            if sleep_or_shutdown(&mut shutdown, self.options.poll_interval).await {
                break;
            }
        }

        metrics.set_worker_status("stopped");
        info!(
            worker_id = %self.worker_id,
            completed = summary.completed,
            failed = summary.failed,
            released = summary.released,
            "worker stopped"
        );
        summary
    }

    /// Claim and process at most one task. `Ok(None)` when the queue is empty.
    pub async fn run_once(&self, shutdown: &mut watch::Receiver<bool>) -> Result<Option<TaskResolution>> {
        let Some(task) = self
            .store
            .claim_task(&self.options.queue_name, &self.worker_id)
            .await?
        else {
            return Ok(None);
        };
        let span = info_span!(
            "task",
            task_id = %task.task_id,
            task = %task.task_name,
            attempt = task.attempt
        );
        Ok(Some(self.process(task, shutdown).instrument(span).await))
    }

    async fn process(&self, task: TaskRow, shutdown: &mut watch::Receiver<bool>) -> TaskResolution {
        let telemetry = &self.telemetry;
        info!("claimed");
        telemetry.metrics.set_worker_status("running");
        telemetry.events.emit(TaskEvent::TaskClaimed {
            task_id: task.task_id.to_string(),
            queue_name: task.queue_name.clone(),
            task_name: task.task_name.clone(),
            worker_id: self.worker_id.clone(),
            attempt: task.attempt,
        });

        let started = Instant::now();
        let (stop_tx, stop_rx) = watch::channel(false);
        let (lost_tx, mut lost_rx) = watch::channel(false);
        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::clone(&self.store),
            Arc::clone(&self.telemetry),
            task.task_id,
            self.worker_id.clone(),
            heartbeat_cadence(self.options.heartbeat_interval, task.timeout_sec),
            stop_rx,
            lost_tx,
        ));

        let outcome = self.execute_with_retry(&task, &mut lost_rx, shutdown).await;

        let _ = stop_tx.send(true);
        if let Err(e) = heartbeat.await {
            warn!(error = %e, "heartbeat task ended abnormally");
        }

        let elapsed = started.elapsed().as_secs_f64();
        let resolution = self.resolve(&task, outcome).await;
        match &resolution {
            TaskResolution::Completed => {
                info!(elapsed_secs = elapsed, "completed");
                telemetry.metrics.increment_processed();
                telemetry.metrics.record_processing_time(elapsed);
                telemetry.events.emit(TaskEvent::TaskCompleted {
                    task_id: task.task_id.to_string(),
                    task_name: task.task_name.clone(),
                    worker_id: self.worker_id.clone(),
                    elapsed_secs: elapsed,
                });
            }
            TaskResolution::Failed { error } => {
                warn!(%error, "failed");
                telemetry.metrics.increment_failed();
                telemetry.metrics.record_processing_time(elapsed);
                telemetry.metrics.record_error(error);
                telemetry.events.emit(TaskEvent::TaskFailed {
                    task_id: task.task_id.to_string(),
                    task_name: task.task_name.clone(),
                    worker_id: self.worker_id.clone(),
                    error: error.clone(),
                });
            }
            TaskResolution::Released => {
                info!("released for another worker");
                telemetry.events.emit(TaskEvent::TaskReleased {
                    task_id: task.task_id.to_string(),
                    worker_id: self.worker_id.clone(),
                });
            }
            TaskResolution::ClaimLost => warn!("claim lost before resolution, result dropped"),
            TaskResolution::Unresolved { error } => {
                error!(%error, "could not record task outcome");
                telemetry.metrics.record_error(error);
            }
        }
        resolution
    }

    /// Run the executor in its own task so a panic becomes a failure of this
    /// task instead of the worker.
    async fn execute_once(&self, task: &TaskRow) -> Result<ExecutionOutcome, PipelineError> {
        let executor = Arc::clone(&self.executor);
        let task_name = task.task_name.clone();
        let params = task.params.clone();
        let handle = tokio::spawn(async move { executor.execute(&task_name, &params).await });
        match handle.await {
            Ok(result) => result,
            Err(join) if join.is_panic() => {
                let message = panic_message(&join.into_panic());
                Err(PipelineError::new(
                    kind_for_task(&task.task_name),
                    format!("executor panicked: {}", message),
                )
                .with_retryable(false)
                .with_stage(task.task_name.as_str()))
            }
            Err(join) => Err(PipelineError::new(
                kind_for_task(&task.task_name),
                format!("executor task aborted: {}", join),
            )
            .with_stage(task.task_name.as_str())),
        }
    }

    async fn execute_with_retry(
        &self,
        task: &TaskRow,
        lost: &mut watch::Receiver<bool>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<ExecutionOutcome, PipelineError> {
        let mut state = self.options.retry.start();
        loop {
            let err = match self.execute_once(task).await {
                Ok(outcome) => {
                    state.success();
                    return Ok(outcome);
                }
                Err(err) => err,
            };
            let attempt = state.attempt() + 1;
            let Some(delay) = state.record_failure(err.clone()) else {
                return Err(err);
            };
            if *lost.borrow() {
                return Err(err);
            }

            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "executor failed, retrying"
            );
            self.telemetry.metrics.increment_retried();
            self.telemetry.events.emit(TaskEvent::TaskRetrying {
                task_id: task.task_id.to_string(),
                attempt,
                delay_secs: delay.as_secs_f64(),
                error: err.to_string(),
            });

            match backoff(delay, lost, shutdown).await {
                Backoff::Elapsed => {}
                Backoff::ClaimLost => return Err(err),
                Backoff::Shutdown => return Err(PipelineError::shutdown()),
            }
        }
    }

    async fn resolve(
        &self,
        task: &TaskRow,
        outcome: Result<ExecutionOutcome, PipelineError>,
    ) -> TaskResolution {
        let task_id = task.task_id;
        let worker_id = self.worker_id.as_str();
        let store = &self.store;

        let (applied, resolution) = match outcome {
            Ok(ExecutionOutcome::Success(result)) => (
                self.store_call("complete_task", || store.complete_task(task_id, worker_id, &result))
                    .await,
                TaskResolution::Completed,
            ),
            Ok(ExecutionOutcome::Failure(errors)) => {
                let error = errors.join("; ");
                (
                    self.store_call("fail_task", || store.fail_task(task_id, worker_id, &error))
                        .await,
                    TaskResolution::Failed { error },
                )
            }
            Err(e) if e.is_shutdown() => (
                self.store_call("release_task", || store.release_task(task_id, worker_id))
                    .await,
                TaskResolution::Released,
            ),
            Err(e) => {
                let error = e.to_string();
                (
                    self.store_call("fail_task", || store.fail_task(task_id, worker_id, &error))
                        .await,
                    TaskResolution::Failed { error },
                )
            }
        };

        match applied {
            Ok(true) => resolution,
            Ok(false) => TaskResolution::ClaimLost,
            Err(e) => {
                self.telemetry.metrics.increment_store_errors();
                TaskResolution::Unresolved { error: e.to_string() }
            }
        }
    }

    async fn store_call<F, Fut>(&self, op_name: &str, mut op: F) -> Result<bool, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        self.options
            .retry
            .retry_async(op_name, |_| {
                let fut = op();
                async move { fut.await.map_err(|e| PipelineError::classify(&e)) }
            })
            .await
    }
}

async fn backoff(
    delay: Duration,
    lost: &mut watch::Receiver<bool>,
    shutdown: &mut watch::Receiver<bool>,
) -> Backoff {
    if *shutdown.borrow() {
        return Backoff::Shutdown;
    }
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    // closes once the heartbeat loop has ended
    let mut lost_open = true;
    loop {
        tokio::select! {
            _ = &mut sleep => return Backoff::Elapsed,
            changed = lost.changed(), if lost_open => match changed {
                Ok(()) if *lost.borrow() => return Backoff::ClaimLost,
                Ok(()) => {}
                Err(_) => lost_open = false,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Backoff::Shutdown;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_id_has_host_and_suffix() {
        let id = generate_worker_id();
        let (host, suffix) = id.rsplit_once('-').unwrap();
        assert!(!host.is_empty());
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, generate_worker_id());
    }

    #[test]
    fn summary_counts_each_resolution() {
        let mut summary = WorkerSummary::default();
        summary.record(&TaskResolution::Completed);
        summary.record(&TaskResolution::Failed { error: "x".into() });
        summary.record(&TaskResolution::Released);
        summary.record(&TaskResolution::ClaimLost);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.total(), 4);
    }

    #[test]
    fn short_task_timeouts_tighten_the_heartbeat() {
        let configured = Duration::from_secs(10);
        assert_eq!(heartbeat_cadence(configured, None), configured);
        assert_eq!(heartbeat_cadence(configured, Some(3600)), configured);
        assert_eq!(heartbeat_cadence(configured, Some(6)), Duration::from_secs(2));
        assert_eq!(heartbeat_cadence(configured, Some(0)), configured);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_or_shutdown_wakes_on_signal() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { sleep_or_shutdown(&mut rx, Duration::from_secs(3600)).await });
        tokio::task::yield_now().await;
        tx.send(true).unwrap();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_or_shutdown_elapses_without_signal() {
        let (_tx, mut rx) = watch::channel(false);
        assert!(!sleep_or_shutdown(&mut rx, Duration::from_millis(10)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_sender_counts_as_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        assert!(sleep_or_shutdown(&mut rx, Duration::from_secs(3600)).await);
    }
}
