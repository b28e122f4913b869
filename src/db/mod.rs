//! # Database — PostgreSQL Storage Layer
//!
//! The relational store is the single owner of groups, subbands, and tasks.
//! Every mutation is one conditional statement or one transaction, so any
//! number of worker, reaper, and ingest processes can race safely through a
//! shared `sqlx::PgPool`.
//!
//! ## Schema
//!
//! - `groups`: observation groups keyed by canonical timestamp id
//! - `subbands`: one row per subband file, unique on `file_path`
//! - `tasks`: the durable task queue
//!
//! ## Module Structure
//!
//! - [`groups`]: clustering, subband bookkeeping, rename/merge, state advance
//! - [`tasks`]: spawn/claim/heartbeat/complete/fail/cancel/prune, stale-claim reclaim
//!
//! ## Isolation
//!
//! All statements run at PostgreSQL's default `READ COMMITTED`. Claims rely on
//! `FOR UPDATE SKIP LOCKED` plus a re-checked `status = 'pending'` predicate;
//! group writes take a row lock (`FOR UPDATE`) on the parent group first, and
//! clustering is serialised with a transaction-scoped advisory lock.

mod groups;
mod tasks;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub use groups::NormalizeOutcome;

/// Schema files, applied in order by [`Database::migrate`].
pub const MIGRATIONS: &[(&str, &str)] = &[
    ("001_groups", include_str!("../../migrations/001_groups.sql")),
    ("002_tasks", include_str!("../../migrations/002_tasks.sql")),
    ("003_task_dependencies", include_str!("../../migrations/003_task_dependencies.sql")),
];

// ── Group types ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupState {
    Collecting,
    Pending,
    Normalizing,
    Converting,
    Completed,
    Failed,
}

impl GroupState {
    pub const ALL: [GroupState; 6] = [
        GroupState::Collecting,
        GroupState::Pending,
        GroupState::Normalizing,
        GroupState::Converting,
        GroupState::Completed,
        GroupState::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            GroupState::Collecting => "collecting",
            GroupState::Pending => "pending",
            GroupState::Normalizing => "normalizing",
            GroupState::Converting => "converting",
            GroupState::Completed => "completed",
            GroupState::Failed => "failed",
        }
    }

    fn rank(self) -> u8 {
        match self {
            GroupState::Collecting => 0,
            GroupState::Pending => 1,
            GroupState::Normalizing => 2,
            GroupState::Converting => 3,
            GroupState::Completed | GroupState::Failed => 4,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, GroupState::Completed | GroupState::Failed)
    }

    /// Forward-only: any later state, `failed` from any non-terminal state,
    /// or the same state again.
    pub fn can_advance_to(self, target: GroupState) -> bool {
        self == target || target.rank() > self.rank()
    }
}

impl fmt::Display for GroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GroupState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        GroupState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown group state '{}'", s))
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct GroupRow {
    pub group_id: String,
    pub state: String,
    pub subband_count: i32,
    pub expected_subbands: i32,
    pub ra_deg: Option<f64>,
    pub dec_deg: Option<f64>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub output_path: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SubbandRow {
    pub group_id: String,
    pub subband_index: i32,
    pub file_path: String,
    pub recorded_at: chrono::DateTime<chrono::Utc>,
}

/// Result of [`Database::record_subband`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordOutcome {
    pub group_id: String,
    /// False when the file (or the index) was already recorded.
    pub inserted: bool,
    pub subband_count: i32,
    pub expected_subbands: i32,
    pub state: GroupState,
    /// True only for the recording that moved the group to `pending`.
    pub became_complete: bool,
}

#[derive(Debug, Clone, Default, Serialize, sqlx::FromRow)]
pub struct IngestionStats {
    pub collecting: i64,
    pub pending: i64,
    pub normalizing: i64,
    pub converting: i64,
    pub completed: i64,
    pub failed: i64,
    pub total: i64,
    pub subbands: i64,
}

impl IngestionStats {
    pub fn by_state(&self) -> [(GroupState, i64); 6] {
        [
            (GroupState::Collecting, self.collecting),
            (GroupState::Pending, self.pending),
            (GroupState::Normalizing, self.normalizing),
            (GroupState::Converting, self.converting),
            (GroupState::Completed, self.completed),
            (GroupState::Failed, self.failed),
        ]
    }
}

// ── Task types ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Claimed,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Claimed,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    pub const TERMINAL: [TaskStatus; 3] = [
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Claimed => "claimed",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown task status '{}'", s))
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TaskRow {
    pub task_id: Uuid,
    pub queue_name: String,
    pub task_name: String,
    pub params: Value,
    pub priority: i32,
    pub status: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub claimed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub attempt: i32,
    pub worker_id: Option<String>,
    pub last_heartbeat: Option<chrono::DateTime<chrono::Utc>>,
    pub timeout_sec: Option<i32>,
    /// Tasks that must complete before this one is claimable.
    pub depends_on: Vec<Uuid>,
}

impl TaskRow {
    pub fn status(&self) -> Result<TaskStatus> {
        self.status.parse()
    }
}

#[derive(Debug, Clone, Default, Serialize, sqlx::FromRow)]
pub struct QueueStats {
    pub queue_name: String,
    pub pending: i64,
    pub claimed: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub total: i64,
}

impl QueueStats {
    pub fn by_status(&self) -> [(TaskStatus, i64); 5] {
        [
            (TaskStatus::Pending, self.pending),
            (TaskStatus::Claimed, self.claimed),
            (TaskStatus::Completed, self.completed),
            (TaskStatus::Failed, self.failed),
            (TaskStatus::Cancelled, self.cancelled),
        ]
    }
}

/// What one reaper pass did to stale claims.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReclaimSummary {
    pub requeued: Vec<Uuid>,
    pub failed: Vec<Uuid>,
}

impl ReclaimSummary {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.failed.is_empty()
    }
}

// ── Connection ──────────────────────────────────────────────────

const DEFAULT_POOL_SIZE: u32 = 5;

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to PostgreSQL using the provided database URL.
    ///
    /// The URL is parsed by hand so percent-encoded user names and passwords
    /// (and pooler-style `user.project` names) reach the server unchanged.
    pub async fn connect(database_url: &str) -> Result<Self> {
        Self::connect_with_pool_size(database_url, DEFAULT_POOL_SIZE).await
    }

    pub async fn connect_with_pool_size(database_url: &str, max_connections: u32) -> Result<Self> {
        let url = url::Url::parse(database_url).context("invalid database URL")?;
        let username = urlencoding::decode(url.username())?.into_owned();
        let password = url
            .password()
            .map(|p| urlencoding::decode(p).map(|s| s.into_owned()))
            .transpose()?;
        let mut opts = PgConnectOptions::new()
            .host(url.host_str().unwrap_or("localhost"))
            .port(url.port().unwrap_or(5432))
            .database(url.path().trim_start_matches('/'))
            .username(&username)
            .statement_cache_capacity(0);
        if let Some(ref pw) = password {
            opts = opts.password(pw);
        }
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(opts)
            .await?;
        Ok(Database { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Database { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Execute `SELECT 1` to verify connectivity.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }

    /// Apply every schema file. Each file is idempotent.
    pub async fn migrate(&self) -> Result<()> {
        for &(name, sql) in MIGRATIONS {
            sqlx::raw_sql(sql)
                .execute(&self.pool)
                .await
                .with_context(|| format!("migration {} failed", name))?;
            tracing::info!(migration = name, "applied");
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────
