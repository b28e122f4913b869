//! Task queue operations.
//!
//! Tasks are claimed with `FOR UPDATE SKIP LOCKED` so any number of workers
//! can poll the same queue; under N concurrent claimers racing for one pending
//! row exactly one gets it and the rest see `None`.
//!
//! ## Lifecycle
//!
//! 1. `spawn_task` inserts a `pending` row, optionally naming tasks it
//!    `depends_on`
//! 2. `claim_task` moves the best pending row (priority DESC, created_at ASC)
//!    whose dependencies have all completed to `claimed`, stamping
//!    `worker_id`, `claimed_at`, `last_heartbeat` and incrementing `attempt`
//! 3. `heartbeat_task` refreshes `last_heartbeat` while the claim holds
//! 4. `complete_task` / `fail_task` resolve the claim; `release_task` hands it
//!    back to `pending` on shutdown; `cancel_task` stops it from anywhere
//! 5. `reclaim_stale_tasks` recovers claims whose heartbeat went silent and
//!    `fail_blocked_tasks` fails tasks whose dependency can no longer complete
//!    (both run in the reaper)
//! 6. `prune_tasks` deletes terminal rows past retention
//!
//! Dependencies are fixed at spawn and must already exist, so the dependency
//! graph is acyclic. A dependency that has been pruned counts as satisfied.
//!
//! Every claim-side transition is conditional on `status = 'claimed' AND
//! worker_id = $worker`, so a worker whose claim was reclaimed, cancelled, or
//! resolved elsewhere sees `false` and never overwrites the row.

use super::{Database, QueueStats, ReclaimSummary, TaskRow, TaskStatus};
use crate::error::PipelineError;
use anyhow::Result;
use serde_json::Value;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

const TASK_COLUMNS: &str = "task_id, queue_name, task_name, params, priority, status, created_at, \
     claimed_at, completed_at, result, error, attempt, worker_id, last_heartbeat, timeout_sec, depends_on";

const STATS_COLUMNS: &str = "COUNT(*) FILTER (WHERE status = 'pending') AS pending,
     COUNT(*) FILTER (WHERE status = 'claimed') AS claimed,
     COUNT(*) FILTER (WHERE status = 'completed') AS completed,
     COUNT(*) FILTER (WHERE status = 'failed') AS failed,
     COUNT(*) FILTER (WHERE status = 'cancelled') AS cancelled,
     COUNT(*) AS total";

impl Database {
    /// Insert a `pending` task. Duplicate spawns create distinct tasks.
    pub async fn spawn_task(
        &self,
        queue_name: &str,
        task_name: &str,
        params: &Value,
        priority: i32,
        timeout_sec: Option<i32>,
    ) -> Result<Uuid> {
        self.spawn_task_with_deps(queue_name, task_name, params, priority, timeout_sec, &[])
            .await
    }

    /// Insert a `pending` task that stays unclaimable until every task in
    /// `depends_on` has completed. Unknown dependencies are rejected.
    pub async fn spawn_task_with_deps(
        &self,
        queue_name: &str,
        task_name: &str,
        params: &Value,
        priority: i32,
        timeout_sec: Option<i32>,
        depends_on: &[Uuid],
    ) -> Result<Uuid> {
        validate_spawn(queue_name, task_name, timeout_sec)?;
        let mut deps = depends_on.to_vec();
        deps.sort();
        deps.dedup();

        let mut tx = self.pool.begin().await?;
        if !deps.is_empty() {
            // Shared row locks keep the dependencies from being pruned before
            // the insert commits.
            let found: Vec<Uuid> = sqlx::query_scalar(
                "SELECT task_id FROM tasks WHERE task_id = ANY($1) FOR SHARE",
            )
            .bind(&deps)
            .fetch_all(&mut *tx)
            .await?;
            if let Some(missing) = deps.iter().find(|d| !found.contains(*d)) {
                return Err(
                    PipelineError::validation(format!("unknown dependency {}", missing)).into(),
                );
            }
        }

        let task_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO tasks (task_id, queue_name, task_name, params, priority, timeout_sec, depends_on)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(task_id)
        .bind(queue_name)
        .bind(task_name)
        .bind(params)
        .bind(priority)
        .bind(timeout_sec)
        .bind(&deps)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        info!(
            %task_id,
            queue = queue_name,
            task = task_name,
            priority,
            depends_on = deps.len(),
            "spawned task"
        );
        Ok(task_id)
    }

    /// Spawn `task_name` for `group_id` unless a task for that group already
    /// exists on `queue_name`, whatever its status. Returns the new task id,
    /// or `None` when one was already there.
    ///
    /// Calls for the same group serialize on an advisory lock, so repeating
    /// this after a crash or from several ingestors yields one task.
    pub async fn spawn_group_task_once(
        &self,
        queue_name: &str,
        task_name: &str,
        group_id: &str,
        priority: i32,
    ) -> Result<Option<Uuid>> {
        validate_spawn(queue_name, task_name, None)?;
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(format!("{}/{}/{}", queue_name, task_name, group_id))
            .execute(&mut *tx)
            .await?;

        let task_id = Uuid::new_v4();
        let params = serde_json::json!({ "group_id": group_id });
        let inserted = sqlx::query(
            "INSERT INTO tasks (task_id, queue_name, task_name, params, priority)
             SELECT $1, $2, $3, $4, $5
             WHERE NOT EXISTS (
                 SELECT 1 FROM tasks
                 WHERE queue_name = $2 AND task_name = $3
                   AND params->>'group_id' = $6
             )",
        )
        .bind(task_id)
        .bind(queue_name)
        .bind(task_name)
        .bind(&params)
        .bind(priority)
        .bind(group_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;

        if inserted == 0 {
            return Ok(None);
        }
        info!(%task_id, queue = queue_name, task = task_name, group_id, "spawned group task");
        Ok(Some(task_id))
    }

    /// Complete groups with no `task_name` task on `queue_name`, oldest first.
    pub async fn pending_groups_without_task(
        &self,
        queue_name: &str,
        task_name: &str,
        limit: i64,
    ) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT g.group_id FROM groups g
             WHERE g.state = 'pending'
               AND NOT EXISTS (
                   SELECT 1 FROM tasks t
                   WHERE t.queue_name = $1 AND t.task_name = $2
                     AND t.params->>'group_id' = g.group_id
               )
             ORDER BY g.created_at ASC
             LIMIT $3",
        )
        .bind(queue_name)
        .bind(task_name)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    /// Atomically claim the most urgent pending task on `queue_name` whose
    /// dependencies have all completed.
    ///
    /// Never blocks on rows another claimer holds; returns `None` when nothing
    /// is claimable.
    pub async fn claim_task(&self, queue_name: &str, worker_id: &str) -> Result<Option<TaskRow>> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "UPDATE tasks
             SET status = 'claimed',
                 claimed_at = NOW(),
                 worker_id = $2,
                 last_heartbeat = NOW(),
                 attempt = attempt + 1
             WHERE task_id = (
                 SELECT t.task_id FROM tasks t
                 WHERE t.queue_name = $1 AND t.status = 'pending'
                   AND NOT EXISTS (
                       SELECT 1 FROM tasks d
                       WHERE d.task_id = ANY(t.depends_on) AND d.status <> 'completed'
                   )
                 ORDER BY t.priority DESC, t.created_at ASC
                 LIMIT 1
                 FOR UPDATE OF t SKIP LOCKED
             )
               AND status = 'pending'
             RETURNING {}",
            TASK_COLUMNS
        ))
        .bind(queue_name)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Fail pending tasks with a `failed` or `cancelled` dependency, repeating
    /// until no dependent is left waiting on one.
    pub async fn fail_blocked_tasks(&self) -> Result<Vec<Uuid>> {
        let mut failed = Vec::new();
        loop {
            let ids: Vec<Uuid> = sqlx::query_scalar(
                "UPDATE tasks t
                 SET status = 'failed', completed_at = NOW(),
                     error = 'dependency did not complete'
                 WHERE t.status = 'pending'
                   AND EXISTS (
                       SELECT 1 FROM tasks d
                       WHERE d.task_id = ANY(t.depends_on)
                         AND d.status IN ('failed', 'cancelled')
                   )
                 RETURNING t.task_id",
            )
            .fetch_all(&self.pool)
            .await?;
            if ids.is_empty() {
                break;
            }
            warn!(count = ids.len(), "failed tasks blocked by a dependency");
            failed.extend(ids);
        }
        Ok(failed)
    }

    /// Refresh `last_heartbeat`. `false` means the claim no longer belongs to
    /// `worker_id` and the worker should stop.
    pub async fn heartbeat_task(&self, task_id: Uuid, worker_id: &str) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE tasks SET last_heartbeat = NOW()
             WHERE task_id = $1 AND status = 'claimed' AND worker_id = $2",
        )
        .bind(task_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated == 1)
    }

    /// `claimed → completed`. `false` (and no change) if the claim is gone.
    pub async fn complete_task(&self, task_id: Uuid, worker_id: &str, result: &Value) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE tasks
             SET status = 'completed', result = $3, completed_at = NOW(),
                 worker_id = NULL, claimed_at = NULL
             WHERE task_id = $1 AND status = 'claimed' AND worker_id = $2",
        )
        .bind(task_id)
        .bind(worker_id)
        .bind(result)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated == 1)
    }

    /// `claimed → failed`. `false` (and no change) if the claim is gone.
    pub async fn fail_task(&self, task_id: Uuid, worker_id: &str, error: &str) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE tasks
             SET status = 'failed', error = $3, completed_at = NOW(),
                 worker_id = NULL, claimed_at = NULL
             WHERE task_id = $1 AND status = 'claimed' AND worker_id = $2",
        )
        .bind(task_id)
        .bind(worker_id)
        .bind(error)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated == 1)
    }

    /// `claimed → pending` for a cooperative drain. `attempt` is kept.
    pub async fn release_task(&self, task_id: Uuid, worker_id: &str) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE tasks
             SET status = 'pending', worker_id = NULL, claimed_at = NULL, last_heartbeat = NULL
             WHERE task_id = $1 AND status = 'claimed' AND worker_id = $2",
        )
        .bind(task_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated == 1)
    }

    /// `{pending, claimed} → cancelled`. Returns whether a row changed.
    pub async fn cancel_task(&self, task_id: Uuid) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE tasks
             SET status = 'cancelled', completed_at = NOW(),
                 error = COALESCE(error, 'cancelled'),
                 worker_id = NULL, claimed_at = NULL
             WHERE task_id = $1 AND status IN ('pending', 'claimed')",
        )
        .bind(task_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated == 1)
    }

    /// Delete terminal tasks whose `completed_at` is older than `retention`.
    ///
    /// `statuses` defaults to every terminal status when empty; non-terminal
    /// statuses are rejected.
    pub async fn prune_tasks(
        &self,
        retention: Duration,
        queue_name: Option<&str>,
        statuses: &[TaskStatus],
    ) -> Result<u64> {
        let statuses: &[TaskStatus] = if statuses.is_empty() {
            &TaskStatus::TERMINAL
        } else {
            statuses
        };
        if let Some(s) = statuses.iter().find(|s| !s.is_terminal()) {
            return Err(PipelineError::validation(format!(
                "cannot prune tasks in non-terminal status '{}'",
                s
            ))
            .into());
        }
        let names: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let deleted = sqlx::query(
            "DELETE FROM tasks
             WHERE status = ANY($1)
               AND completed_at < NOW() - make_interval(secs => $2)
               AND ($3::TEXT IS NULL OR queue_name = $3)",
        )
        .bind(&names)
        .bind(retention.as_secs_f64())
        .bind(queue_name)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(deleted)
    }

    pub async fn get_task(&self, task_id: Uuid) -> Result<Option<TaskRow>> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {} FROM tasks WHERE task_id = $1",
            TASK_COLUMNS
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Newest first, optionally filtered by queue and status.
    pub async fn list_tasks(
        &self,
        queue_name: Option<&str>,
        status: Option<TaskStatus>,
        limit: i64,
    ) -> Result<Vec<TaskRow>> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {} FROM tasks
             WHERE ($1::TEXT IS NULL OR queue_name = $1)
               AND ($2::TEXT IS NULL OR status = $2)
             ORDER BY created_at DESC
             LIMIT $3",
            TASK_COLUMNS
        ))
        .bind(queue_name)
        .bind(status.map(|s| s.as_str()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn get_queue_stats(&self, queue_name: &str) -> Result<QueueStats> {
        let stats = sqlx::query_as::<_, QueueStats>(&format!(
            "SELECT $1::TEXT AS queue_name, {} FROM tasks WHERE queue_name = $1",
            STATS_COLUMNS
        ))
        .bind(queue_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(stats)
    }

    /// Per-queue counts for every queue that has tasks.
    pub async fn get_all_queue_stats(&self) -> Result<Vec<QueueStats>> {
        let rows = sqlx::query_as::<_, QueueStats>(&format!(
            "SELECT queue_name, {} FROM tasks GROUP BY queue_name ORDER BY queue_name",
            STATS_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Recover claims whose heartbeat is older than their timeout.
    ///
    /// A stale claim that has already used `max_attempts` attempts is failed
    /// with a timeout error; any other stale claim goes back to `pending`
    /// with its `attempt` count kept. `default_timeout_sec` applies to tasks
    /// spawned without their own `timeout_sec`. Both updates run in one
    /// transaction and re-check staleness under the row lock, so a heartbeat
    /// that lands mid-pass wins.
    pub async fn reclaim_stale_tasks(
        &self,
        default_timeout_sec: i32,
        max_attempts: i32,
    ) -> Result<ReclaimSummary> {
        let mut tx = self.pool.begin().await?;
        let failed: Vec<Uuid> = sqlx::query_scalar(
            "UPDATE tasks
             SET status = 'failed',
                 completed_at = NOW(),
                 error = 'heartbeat timeout after ' || attempt || ' attempt(s), last worker ' || worker_id,
                 worker_id = NULL,
                 claimed_at = NULL
             WHERE status = 'claimed'
               AND COALESCE(last_heartbeat, claimed_at)
                   < NOW() - make_interval(secs => COALESCE(timeout_sec, $1))
               AND attempt >= $2
             RETURNING task_id",
        )
        .bind(default_timeout_sec)
        .bind(max_attempts)
        .fetch_all(&mut *tx)
        .await?;

        let requeued: Vec<Uuid> = sqlx::query_scalar(
            "UPDATE tasks
             SET status = 'pending',
                 error = 'requeued after heartbeat timeout, last worker ' || worker_id,
                 worker_id = NULL,
                 claimed_at = NULL,
                 last_heartbeat = NULL
             WHERE status = 'claimed'
               AND COALESCE(last_heartbeat, claimed_at)
                   < NOW() - make_interval(secs => COALESCE(timeout_sec, $1))
               AND attempt < $2
             RETURNING task_id",
        )
        .bind(default_timeout_sec)
        .bind(max_attempts)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        if !failed.is_empty() {
            warn!(count = failed.len(), tasks = ?failed, "failed stale tasks at attempt limit");
        }
        if !requeued.is_empty() {
            info!(count = requeued.len(), tasks = ?requeued, "requeued stale tasks");
        }
        Ok(ReclaimSummary { requeued, failed })
    }
}

fn validate_spawn(queue_name: &str, task_name: &str, timeout_sec: Option<i32>) -> Result<()> {
    if queue_name.is_empty() || task_name.is_empty() {
        return Err(PipelineError::validation("queue and task names are required").into());
    }
    if matches!(timeout_sec, Some(t) if t <= 0) {
        return Err(PipelineError::validation("timeout_sec must be positive").into());
    }
    Ok(())
}
