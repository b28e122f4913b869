//! # Events — Fire-and-Forget Task Lifecycle Notifications
//!
//! A bounded, thread-safe event log that collects task and queue state changes
//! from the worker, reaper, and ingestor, and fans them out to subscribers
//! (live dashboards, external hooks).
//!
//! ## Event Types
//!
//! | Variant | Emitted When |
//! |---------|-------------|
//! | `TaskClaimed` | A worker claims a pending task |
//! | `TaskCompleted` | A claimed task resolves successfully |
//! | `TaskFailed` | A claimed task resolves as failed |
//! | `TaskRetrying` | The executor failed with a retryable error and will run again |
//! | `TaskReleased` | A worker hands its claim back on shutdown |
//! | `HeartbeatRejected` | The store no longer recognises the worker's claim |
//! | `TasksReclaimed` | The reaper requeued or failed stale claims |
//! | `GroupCompleted` | An observation group received its last subband |
//!
//! ## Delivery
//!
//! Events are kept in a `VecDeque` bounded at [`RECENT_EVENTS_CAP`], broadcast
//! as JSON on a `tokio::sync::broadcast` channel, and passed to registered
//! hooks. Delivery never blocks or fails the caller: a send with no
//! subscribers is dropped, and a hook that errors or panics is logged.

use crate::health::panic_message;
use serde::Serialize;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    TaskClaimed {
        task_id: String,
        queue_name: String,
        task_name: String,
        worker_id: String,
        attempt: i32,
    },
    TaskCompleted {
        task_id: String,
        task_name: String,
        worker_id: String,
        elapsed_secs: f64,
    },
    TaskFailed {
        task_id: String,
        task_name: String,
        worker_id: String,
        error: String,
    },
    TaskRetrying {
        task_id: String,
        attempt: u32,
        delay_secs: f64,
        error: String,
    },
    TaskReleased {
        task_id: String,
        worker_id: String,
    },
    HeartbeatRejected {
        task_id: String,
        worker_id: String,
    },
    TasksReclaimed {
        requeued: u64,
        failed: u64,
    },
    GroupCompleted {
        group_id: String,
        subband_count: i32,
    },
}

impl TaskEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            TaskEvent::TaskClaimed { .. } => "task_claimed",
            TaskEvent::TaskCompleted { .. } => "task_completed",
            TaskEvent::TaskFailed { .. } => "task_failed",
            TaskEvent::TaskRetrying { .. } => "task_retrying",
            TaskEvent::TaskReleased { .. } => "task_released",
            TaskEvent::HeartbeatRejected { .. } => "heartbeat_rejected",
            TaskEvent::TasksReclaimed { .. } => "tasks_reclaimed",
            TaskEvent::GroupCompleted { .. } => "group_completed",
        }
    }

    fn summary(&self) -> String {
        match self {
            TaskEvent::TaskClaimed {
                task_id,
                task_name,
                worker_id,
                attempt,
                ..
            } => format!("{} {} claimed by {} (attempt {})", task_name, task_id, worker_id, attempt),
            TaskEvent::TaskCompleted {
                task_id,
                task_name,
                elapsed_secs,
                ..
            } => format!("{} {} completed in {:.1}s", task_name, task_id, elapsed_secs),
            TaskEvent::TaskFailed {
                task_id,
                task_name,
                error,
                ..
            } => format!("{} {} failed: {}", task_name, task_id, error),
            TaskEvent::TaskRetrying {
                task_id,
                attempt,
                delay_secs,
                ..
            } => format!("{} retrying after attempt {} in {:.1}s", task_id, attempt, delay_secs),
            TaskEvent::TaskReleased { task_id, worker_id } => {
                format!("{} released by {}", task_id, worker_id)
            }
            TaskEvent::HeartbeatRejected { task_id, worker_id } => {
                format!("{} no longer claimed by {}", task_id, worker_id)
            }
            TaskEvent::TasksReclaimed { requeued, failed } => {
                format!("reclaimed stale tasks: {} requeued, {} failed", requeued, failed)
            }
            TaskEvent::GroupCompleted {
                group_id,
                subband_count,
            } => format!("group {} complete with {} subbands", group_id, subband_count),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct EventRecord {
    pub id: u64,
    pub kind: String,
    pub message: String,
    pub timestamp_ms: u64,
}

/// Subscriber callback. Errors and panics are logged and swallowed.
pub type EventHook = Arc<dyn Fn(&TaskEvent) -> anyhow::Result<()> + Send + Sync>;

pub const RECENT_EVENTS_CAP: usize = 200;
const BROADCAST_CAPACITY: usize = 256;

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub struct EventBus {
    recent: Mutex<VecDeque<EventRecord>>,
    hooks: Mutex<Vec<(String, EventHook)>>,
    sender: broadcast::Sender<String>,
    next_id: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        EventBus {
            recent: Mutex::new(VecDeque::with_capacity(RECENT_EVENTS_CAP)),
            hooks: Mutex::new(Vec::new()),
            sender,
            next_id: AtomicU64::new(1),
        }
    }

    /// Receive every subsequent event as a JSON string.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }

    pub fn add_hook<F>(&self, name: &str, hook: F)
    where
        F: Fn(&TaskEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.hooks
            .lock()
            .unwrap()
            .push((name.to_string(), Arc::new(hook)));
    }

    /// Record and fan out an event. Never fails.
    pub fn emit(&self, event: TaskEvent) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let message = event.summary();
        match &event {
            TaskEvent::TaskFailed { .. } | TaskEvent::HeartbeatRejected { .. } => {
                warn!(event = event.kind(), "{}", message)
            }
            TaskEvent::TaskClaimed { .. } | TaskEvent::TaskRetrying { .. } => {
                debug!(event = event.kind(), "{}", message)
            }
            _ => info!(event = event.kind(), "{}", message),
        }

        let record = EventRecord {
            id,
            kind: event.kind().to_string(),
            message,
            timestamp_ms: now_ms(),
        };
        {
            let mut recent = self.recent.lock().unwrap();
            if recent.len() >= RECENT_EVENTS_CAP {
                recent.pop_front();
            }
            recent.push_back(record);
        }

        if self.sender.receiver_count() > 0 {
            let json = serde_json::json!({
                "id": id,
                "event": event,
            });
            let _ = self.sender.send(json.to_string());
        }

        let hooks: Vec<(String, EventHook)> = self.hooks.lock().unwrap().clone();
        for (name, hook) in hooks {
            match catch_unwind(AssertUnwindSafe(|| hook(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(hook = %name, error = %e, "event hook failed"),
                Err(panic) => {
                    warn!(hook = %name, panic = %panic_message(&panic), "event hook panicked")
                }
            }
        }
    }

    /// Most recent first.
    pub fn recent_events(&self, limit: usize) -> Vec<EventRecord> {
        let events = self.recent.lock().unwrap();
        events.iter().rev().take(limit).cloned().collect()
    }
}
