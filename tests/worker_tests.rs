//! Worker behavior against an in-memory task store.
//!
//! No database needed: `MemoryStore` implements the same ownership-guarded
//! transitions as the PostgreSQL queue, and scripted executors stand in for
//! the external reduction program.

use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use subband_dispatch::db::{TaskRow, TaskStatus};
use subband_dispatch::error::{ErrorKind, PipelineError};
use subband_dispatch::executor::{ExecutionOutcome, Executor};
use subband_dispatch::retry::RetryPolicy;
use subband_dispatch::telemetry::Telemetry;
use subband_dispatch::worker::{TaskResolution, TaskStore, Worker, WorkerOptions};
use tokio::sync::watch;
use uuid::Uuid;

const QUEUE: &str = "conversion";

// --- In-memory store ---

#[derive(Default)]
struct MemoryStore {
    tasks: Mutex<Vec<TaskRow>>,
    /// Upcoming resolve calls (complete/fail/release) that fail transiently.
    failing_writes: AtomicU32,
    heartbeats: AtomicU32,
}

impl MemoryStore {
    fn push(&self, task_name: &str, priority: i32) -> Uuid {
        self.push_with_timeout(task_name, priority, None)
    }

    fn push_with_timeout(&self, task_name: &str, priority: i32, timeout_sec: Option<i32>) -> Uuid {
        let task_id = Uuid::new_v4();
        self.tasks.lock().unwrap().push(TaskRow {
            task_id,
            queue_name: QUEUE.to_string(),
            task_name: task_name.to_string(),
            params: json!({"group_id": "2025-10-02T00:12:00"}),
            priority,
            status: "pending".to_string(),
            created_at: chrono::Utc::now(),
            claimed_at: None,
            completed_at: None,
            result: None,
            error: None,
            attempt: 0,
            worker_id: None,
            last_heartbeat: None,
            timeout_sec,
            depends_on: Vec::new(),
        });
        task_id
    }

    fn get(&self, task_id: Uuid) -> TaskRow {
        self.tasks
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.task_id == task_id)
            .cloned()
            .unwrap()
    }

    /// Reassign a claim, as a reaper pass plus another worker would.
    fn steal(&self, task_id: Uuid) {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks.iter_mut().find(|t| t.task_id == task_id).unwrap();
        task.worker_id = Some("someone-else".to_string());
    }

    fn all_terminal(&self) -> bool {
        self.tasks
            .lock()
            .unwrap()
            .iter()
            .all(|t| t.status().unwrap().is_terminal())
    }

    fn transient_failure(&self) -> Option<anyhow::Error> {
        self.failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .ok()
            .map(|_| PipelineError::queue("connection reset").into())
    }

    /// Apply `f` to the task if `worker_id` still holds its claim.
    fn with_claim(&self, task_id: Uuid, worker_id: &str, f: impl FnOnce(&mut TaskRow)) -> bool {
        let mut tasks = self.tasks.lock().unwrap();
        match tasks.iter_mut().find(|t| {
            t.task_id == task_id && t.status == "claimed" && t.worker_id.as_deref() == Some(worker_id)
        }) {
            Some(task) => {
                f(task);
                true
            }
            None => false,
        }
    }

    fn resolve(
        &self,
        task_id: Uuid,
        worker_id: &str,
        status: TaskStatus,
        f: impl FnOnce(&mut TaskRow),
    ) -> anyhow::Result<bool> {
        if let Some(e) = self.transient_failure() {
            return Err(e);
        }
        Ok(self.with_claim(task_id, worker_id, |task| {
            task.status = status.as_str().to_string();
            task.worker_id = None;
            task.claimed_at = None;
            if status.is_terminal() {
                task.completed_at = Some(chrono::Utc::now());
            }
            f(task);
        }))
    }
}

impl TaskStore for MemoryStore {
    fn claim_task(
        &self,
        queue_name: &str,
        worker_id: &str,
    ) -> impl Future<Output = anyhow::Result<Option<TaskRow>>> + Send {
        let mut tasks = self.tasks.lock().unwrap();
        let best = tasks
            .iter_mut()
            .filter(|t| t.queue_name == queue_name && t.status == "pending")
            .min_by_key(|t| (-t.priority, t.created_at));
        let claimed = best.map(|task| {
            task.status = "claimed".to_string();
            task.worker_id = Some(worker_id.to_string());
            task.claimed_at = Some(chrono::Utc::now());
            task.last_heartbeat = task.claimed_at;
            task.attempt += 1;
            task.clone()
        });
        async move { Ok(claimed) }
    }

    fn heartbeat_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
    ) -> impl Future<Output = anyhow::Result<bool>> + Send {
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
        let ok = self.with_claim(task_id, worker_id, |t| {
            t.last_heartbeat = Some(chrono::Utc::now())
        });
        async move { Ok(ok) }
    }

    fn complete_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        result: &Value,
    ) -> impl Future<Output = anyhow::Result<bool>> + Send {
        let result = result.clone();
        let r = self.resolve(task_id, worker_id, TaskStatus::Completed, |t| {
            t.result = Some(result)
        });
        async move { r }
    }

    fn fail_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        error: &str,
    ) -> impl Future<Output = anyhow::Result<bool>> + Send {
        let error = error.to_string();
        let r = self.resolve(task_id, worker_id, TaskStatus::Failed, |t| t.error = Some(error));
        async move { r }
    }

    fn release_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
    ) -> impl Future<Output = anyhow::Result<bool>> + Send {
        let r = self.resolve(task_id, worker_id, TaskStatus::Pending, |t| {
            t.last_heartbeat = None
        });
        async move { r }
    }
}

// --- Scripted executor ---

type Script = Box<dyn Fn(u32) -> Result<ExecutionOutcome, PipelineError> + Send + Sync>;

struct ScriptedExecutor {
    calls: AtomicU32,
    script: Script,
}

impl ScriptedExecutor {
    fn new(script: impl Fn(u32) -> Result<ExecutionOutcome, PipelineError> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(ScriptedExecutor {
            calls: AtomicU32::new(0),
            script: Box::new(script),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Executor for ScriptedExecutor {
    fn execute(
        &self,
        _task_name: &str,
        _params: &Value,
    ) -> impl Future<Output = Result<ExecutionOutcome, PipelineError>> + Send {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let result = (self.script)(call);
        async move { result }
    }
}

fn success() -> Result<ExecutionOutcome, PipelineError> {
    Ok(ExecutionOutcome::Success(json!({"ms_path": "/stage/g.ms"})))
}

fn transient() -> Result<ExecutionOutcome, PipelineError> {
    Err(PipelineError::conversion("scratch busy", true))
}

fn options(max_attempts: u32, initial_delay: Duration) -> WorkerOptions {
    WorkerOptions {
        queue_name: QUEUE.to_string(),
        poll_interval: Duration::from_millis(50),
        heartbeat_interval: Duration::from_secs(3600),
        retry: RetryPolicy {
            max_attempts,
            initial_delay,
            max_delay: Duration::from_secs(600),
            exponential_base: 2.0,
            jitter_factor: 0.0,
            ..RetryPolicy::default()
        },
    }
}

fn worker(
    store: &Arc<MemoryStore>,
    executor: &Arc<ScriptedExecutor>,
    options: WorkerOptions,
) -> (Worker<MemoryStore, ScriptedExecutor>, Arc<Telemetry>) {
    let telemetry = Arc::new(Telemetry::new());
    let worker = Worker::new(
        Arc::clone(store),
        Arc::clone(executor),
        Arc::clone(&telemetry),
        options,
    )
    .with_worker_id("test-worker");
    (worker, telemetry)
}

fn event_kinds(telemetry: &Telemetry) -> Vec<String> {
    let mut kinds: Vec<String> = telemetry
        .events
        .recent_events(100)
        .into_iter()
        .map(|e| e.kind)
        .collect();
    kinds.reverse();
    kinds
}

// --- Tests ---

#[tokio::test(start_paused = true)]
async fn success_completes_the_task() {
    let store = Arc::new(MemoryStore::default());
    let id = store.push("convert-group", 0);
    let executor = ScriptedExecutor::new(|_| success());
    let (worker, telemetry) = worker(&store, &executor, options(3, Duration::from_millis(10)));
    let (_tx, mut rx) = watch::channel(false);

    let resolution = worker.run_once(&mut rx).await.unwrap();
    assert_eq!(resolution, Some(TaskResolution::Completed));

    let task = store.get(id);
    assert_eq!(task.status, "completed");
    assert_eq!(task.result, Some(json!({"ms_path": "/stage/g.ms"})));
    assert!(task.worker_id.is_none());

    let snap = telemetry.metrics.snapshot();
    assert_eq!(snap.groups_processed, 1);
    assert_eq!(snap.processing_samples, 1);
    assert_eq!(event_kinds(&telemetry), vec!["task_claimed", "task_completed"]);
}

#[tokio::test(start_paused = true)]
async fn empty_queue_returns_none() {
    let store = Arc::new(MemoryStore::default());
    let executor = ScriptedExecutor::new(|_| success());
    let (worker, _) = worker(&store, &executor, options(3, Duration::from_millis(10)));
    let (_tx, mut rx) = watch::channel(false);
    assert_eq!(worker.run_once(&mut rx).await.unwrap(), None);
    assert_eq!(executor.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn structured_failure_is_not_retried() {
    let store = Arc::new(MemoryStore::default());
    let id = store.push("convert-group", 0);
    let executor = ScriptedExecutor::new(|_| {
        Ok(ExecutionOutcome::Failure(vec![
            "missing subband 7".into(),
            "bad header".into(),
        ]))
    });
    let (worker, telemetry) = worker(&store, &executor, options(3, Duration::from_millis(10)));
    let (_tx, mut rx) = watch::channel(false);

    let resolution = worker.run_once(&mut rx).await.unwrap().unwrap();
    assert_eq!(
        resolution,
        TaskResolution::Failed {
            error: "missing subband 7; bad header".into()
        }
    );
    assert_eq!(executor.calls(), 1);
    assert_eq!(store.get(id).error.as_deref(), Some("missing subband 7; bad header"));
    assert_eq!(telemetry.metrics.snapshot().groups_failed, 1);
}

#[tokio::test(start_paused = true)]
async fn retryable_errors_are_retried_until_success() {
    let store = Arc::new(MemoryStore::default());
    let id = store.push("convert-group", 0);
    let executor = ScriptedExecutor::new(|call| if call < 3 { transient() } else { success() });
    let (worker, telemetry) = worker(&store, &executor, options(3, Duration::from_millis(10)));
    let (_tx, mut rx) = watch::channel(false);

    let resolution = worker.run_once(&mut rx).await.unwrap();
    assert_eq!(resolution, Some(TaskResolution::Completed));
    assert_eq!(executor.calls(), 3);
    assert_eq!(store.get(id).status, "completed");
    // the claim attempt counter is the queue's, not the in-line retry count
    assert_eq!(store.get(id).attempt, 1);

    let snap = telemetry.metrics.snapshot();
    assert_eq!(snap.groups_retried, 2);
    assert_eq!(snap.groups_processed, 1);
    assert_eq!(
        event_kinds(&telemetry),
        vec![
            "task_claimed",
            "task_retrying",
            "task_retrying",
            "task_completed"
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_fail_with_last_error() {
    let store = Arc::new(MemoryStore::default());
    let id = store.push("convert-group", 0);
    let executor = ScriptedExecutor::new(|_| transient());
    let (worker, _) = worker(&store, &executor, options(3, Duration::from_millis(10)));
    let (_tx, mut rx) = watch::channel(false);

    let resolution = worker.run_once(&mut rx).await.unwrap().unwrap();
    assert!(matches!(resolution, TaskResolution::Failed { ref error } if error.contains("scratch busy")));
    assert_eq!(executor.calls(), 3);
    let task = store.get(id);
    assert_eq!(task.status, "failed");
    assert!(task.error.unwrap().contains("conversion"));
}

#[tokio::test(start_paused = true)]
async fn non_retryable_errors_fail_immediately() {
    let store = Arc::new(MemoryStore::default());
    store.push("image-field", 0);
    let executor = ScriptedExecutor::new(|_| Err(PipelineError::imaging("corrupt visibilities", false)));
    let (worker, _) = worker(&store, &executor, options(5, Duration::from_millis(10)));
    let (_tx, mut rx) = watch::channel(false);

    let resolution = worker.run_once(&mut rx).await.unwrap().unwrap();
    assert!(matches!(resolution, TaskResolution::Failed { .. }));
    assert_eq!(executor.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn executor_panic_fails_the_task() {
    let store = Arc::new(MemoryStore::default());
    let id = store.push("convert-group", 0);
    let executor = ScriptedExecutor::new(|_| panic!("reducer exploded"));
    let (worker, _) = worker(&store, &executor, options(3, Duration::from_millis(10)));
    let (_tx, mut rx) = watch::channel(false);

    let resolution = worker.run_once(&mut rx).await.unwrap().unwrap();
    match resolution {
        TaskResolution::Failed { error } => assert!(error.contains("reducer exploded"), "{}", error),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(executor.calls(), 1);
    assert_eq!(store.get(id).status, "failed");
}

#[tokio::test(start_paused = true)]
async fn rejected_heartbeat_stops_retrying() {
    let store = Arc::new(MemoryStore::default());
    let id = store.push("convert-group", 0);
    let thief = Arc::clone(&store);
    let executor = ScriptedExecutor::new(move |_| {
        thief.steal(id);
        transient()
    });
    let mut opts = options(5, Duration::from_secs(30));
    opts.heartbeat_interval = Duration::from_secs(1);
    let (worker, telemetry) = worker(&store, &executor, opts);
    let (_tx, mut rx) = watch::channel(false);

    let resolution = worker.run_once(&mut rx).await.unwrap();
    assert_eq!(resolution, Some(TaskResolution::ClaimLost));
    assert_eq!(executor.calls(), 1);
    assert_eq!(store.get(id).status, "claimed");
    assert_eq!(store.get(id).worker_id.as_deref(), Some("someone-else"));
    assert!(event_kinds(&telemetry).contains(&"heartbeat_rejected".to_string()));
}

#[tokio::test(start_paused = true)]
async fn heartbeats_refresh_long_running_claims() {
    let store = Arc::new(MemoryStore::default());
    let id = store.push("convert-group", 0);
    // fails through two 30s backoffs, long enough for several heartbeats
    let executor = ScriptedExecutor::new(|call| if call < 3 { transient() } else { success() });
    let mut opts = options(3, Duration::from_secs(30));
    opts.heartbeat_interval = Duration::from_secs(5);
    opts.retry.exponential_base = 1.0;
    let (worker, _) = worker(&store, &executor, opts);
    let (_tx, mut rx) = watch::channel(false);

    let resolution = worker.run_once(&mut rx).await.unwrap();
    assert_eq!(resolution, Some(TaskResolution::Completed));
    assert!(store.heartbeats.load(Ordering::SeqCst) >= 5);
    assert_eq!(store.get(id).status, "completed");
}

#[tokio::test(start_paused = true)]
async fn short_task_timeout_heartbeats_faster_than_configured() {
    let store = Arc::new(MemoryStore::default());
    // 6s task timeout against an hour-long configured heartbeat
    let id = store.push_with_timeout("convert-group", 0, Some(6));
    let executor = ScriptedExecutor::new(|call| if call < 3 { transient() } else { success() });
    let mut opts = options(3, Duration::from_secs(10));
    opts.retry.exponential_base = 1.0;
    let (worker, _) = worker(&store, &executor, opts);
    let (_tx, mut rx) = watch::channel(false);

    let resolution = worker.run_once(&mut rx).await.unwrap();
    assert_eq!(resolution, Some(TaskResolution::Completed));
    // 20s of backoff at a 2s cadence
    assert!(store.heartbeats.load(Ordering::SeqCst) >= 8);
    assert_eq!(store.get(id).status, "completed");
}

#[tokio::test(start_paused = true)]
async fn shutdown_during_backoff_releases_the_task() {
    let store = Arc::new(MemoryStore::default());
    let id = store.push("convert-group", 0);
    let executor = ScriptedExecutor::new(|_| transient());
    let (worker, telemetry) = worker(&store, &executor, options(5, Duration::from_secs(60)));
    let (tx, rx) = watch::channel(false);

    let handle = tokio::spawn(async move { worker.run(rx).await });
    while executor.calls() == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    tx.send(true).unwrap();
    let summary = handle.await.unwrap();

    assert_eq!(summary.released, 1);
    assert_eq!(summary.total(), 1);
    assert_eq!(executor.calls(), 1);
    let task = store.get(id);
    assert_eq!(task.status, "pending");
    assert!(task.worker_id.is_none());
    assert_eq!(task.attempt, 1);
    assert_eq!(telemetry.metrics.snapshot().worker_status, "stopped");
    assert!(event_kinds(&telemetry).contains(&"task_released".to_string()));
}

#[tokio::test(start_paused = true)]
async fn run_drains_queue_in_priority_order() {
    let store = Arc::new(MemoryStore::default());
    let low = store.push("convert-group", 0);
    let high = store.push("convert-group", 10);
    let mid = store.push("convert-group", 5);
    let order = Arc::new(Mutex::new(Vec::new()));

    let seen = Arc::clone(&order);
    let peek = Arc::clone(&store);
    let executor = ScriptedExecutor::new(move |_| {
        let claimed = peek
            .tasks
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.status == "claimed")
            .map(|t| t.task_id);
        seen.lock().unwrap().extend(claimed);
        success()
    });
    let (worker, telemetry) = worker(&store, &executor, options(3, Duration::from_millis(10)));
    let (tx, rx) = watch::channel(false);

    let handle = tokio::spawn(async move { worker.run(rx).await });
    while !store.all_terminal() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tx.send(true).unwrap();
    let summary = handle.await.unwrap();

    assert_eq!(summary.completed, 3);
    assert_eq!(*order.lock().unwrap(), vec![high, mid, low]);
    assert_eq!(telemetry.metrics.snapshot().groups_processed, 3);
}

#[tokio::test(start_paused = true)]
async fn transient_store_errors_are_retried_when_resolving() {
    let store = Arc::new(MemoryStore::default());
    let id = store.push("convert-group", 0);
    store.failing_writes.store(1, Ordering::SeqCst);
    let executor = ScriptedExecutor::new(|_| success());
    let (worker, _) = worker(&store, &executor, options(3, Duration::from_millis(10)));
    let (_tx, mut rx) = watch::channel(false);

    let resolution = worker.run_once(&mut rx).await.unwrap();
    assert_eq!(resolution, Some(TaskResolution::Completed));
    assert_eq!(store.get(id).status, "completed");
}

#[tokio::test(start_paused = true)]
async fn persistent_store_errors_leave_the_claim_for_the_reaper() {
    let store = Arc::new(MemoryStore::default());
    let id = store.push("convert-group", 0);
    store.failing_writes.store(100, Ordering::SeqCst);
    let executor = ScriptedExecutor::new(|_| success());
    let (worker, telemetry) = worker(&store, &executor, options(3, Duration::from_millis(10)));
    let (_tx, mut rx) = watch::channel(false);

    let resolution = worker.run_once(&mut rx).await.unwrap().unwrap();
    match resolution {
        TaskResolution::Unresolved { error } => assert!(error.contains("connection reset")),
        other => panic!("unexpected {:?}", other),
    }
    let task = store.get(id);
    assert_eq!(task.status, "claimed");
    assert_eq!(task.worker_id.as_deref(), Some("test-worker"));
    let snap = telemetry.metrics.snapshot();
    assert_eq!(snap.store_errors, 1);
    assert_eq!(snap.groups_processed, 0);
}

#[tokio::test(start_paused = true)]
async fn error_kinds_outside_the_policy_are_not_retried() {
    let store = Arc::new(MemoryStore::default());
    store.push("convert-group", 0);
    let executor = ScriptedExecutor::new(|_| Err(PipelineError::disk_space("scratch full")));
    let mut opts = options(5, Duration::from_millis(10));
    opts.retry.retryable_kinds = vec![ErrorKind::Conversion];
    let (worker, _) = worker(&store, &executor, opts);
    let (_tx, mut rx) = watch::channel(false);

    worker.run_once(&mut rx).await.unwrap();
    assert_eq!(executor.calls(), 1);
}
