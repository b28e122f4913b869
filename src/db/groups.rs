//! Observation group and subband operations.
//!
//! ## Lifecycle
//!
//! 1. `find_or_create_group` clusters a candidate timestamp into an existing
//!    `collecting`/`pending` group within ±tolerance, or opens a new one
//! 2. `record_subband` inserts the file, recounts, and promotes the group to
//!    `pending` once every expected index has arrived
//! 3. `update_group_after_normalize` renames or merges a provisional group
//!    into its canonical id and applies corrected file paths
//! 4. `update_group_state` advances the group through normalizing/converting
//!    to a terminal state
//! 5. `prune_groups` removes terminal groups past retention
//!
//! Each write is one transaction that locks the parent group row first, so a
//! structural error (unknown group, bad index, missing subband) rolls the
//! whole operation back.

use super::{Database, GroupRow, GroupState, IngestionStats, RecordOutcome, SubbandRow};
use crate::error::PipelineError;
use crate::group_id::{normalize_group_id, seconds_between, tolerance_window};
use anyhow::Result;
use serde::Serialize;
use sqlx::PgConnection;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Advisory lock key serialising cluster decisions across processes.
const CLUSTER_LOCK_KEY: i64 = 0x5342_4752_4f55_50; // "SBGROUP"

const GROUP_COLUMNS: &str = "group_id, state, subband_count, expected_subbands, ra_deg, dec_deg, \
     created_at, updated_at, completed_at, output_path, error";

/// What `update_group_after_normalize` did with the old id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum NormalizeOutcome {
    /// Old and new ids were equal; only paths were applied.
    Unchanged,
    Renamed,
    /// Folded into an existing group. `dropped` lists indices the target
    /// already held, whose rows from the old group were discarded.
    Merged { dropped: Vec<i32> },
}

fn unknown_group(group_id: &str) -> anyhow::Error {
    PipelineError::validation(format!("unknown group '{}'", group_id)).into()
}

impl Database {
    /// Resolve `candidate` to the group it belongs to, creating one if needed.
    ///
    /// Searches `collecting`/`pending` groups whose id lies within
    /// `±tolerance_s` of the candidate, oldest `created_at` first. Correct
    /// only while distinct observations are more than `tolerance_s` apart.
    pub async fn find_or_create_group(
        &self,
        candidate: &str,
        tolerance_s: f64,
        expected_subbands: i32,
    ) -> Result<String> {
        let group_id = normalize_group_id(candidate)?;
        let (lo, hi) = tolerance_window(&group_id, tolerance_s)?;
        if expected_subbands <= 0 {
            return Err(PipelineError::validation("expected_subbands must be positive").into());
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(CLUSTER_LOCK_KEY)
            .execute(&mut *tx)
            .await?;

        let existing: Option<String> = sqlx::query_scalar(
            "SELECT group_id FROM groups
             WHERE state IN ('collecting', 'pending')
               AND group_id BETWEEN $1 AND $2
             ORDER BY created_at ASC, group_id ASC
             LIMIT 1",
        )
        .bind(&lo)
        .bind(&hi)
        .fetch_optional(&mut *tx)
        .await?;

        let resolved = match existing {
            Some(id) => {
                if id != group_id {
                    debug!(candidate = %group_id, group_id = %id, "clustered into existing group");
                }
                id
            }
            None => {
                let created = sqlx::query(
                    "INSERT INTO groups (group_id, state, expected_subbands)
                     VALUES ($1, 'collecting', $2)
                     ON CONFLICT (group_id) DO NOTHING",
                )
                .bind(&group_id)
                .bind(expected_subbands)
                .execute(&mut *tx)
                .await?
                .rows_affected();
                if created == 1 {
                    info!(group_id = %group_id, expected_subbands, "created group");
                }
                group_id
            }
        };
        tx.commit().await?;
        Ok(resolved)
    }

    /// Record one subband file against `group_id`.
    ///
    /// Duplicate paths (and repeated indices) are no-ops. The recount, the
    /// `dec_deg` fill, and the `collecting → pending` promotion commit together.
    pub async fn record_subband(
        &self,
        group_id: &str,
        subband_index: i32,
        file_path: &str,
        dec_deg: Option<f64>,
    ) -> Result<RecordOutcome> {
        let mut tx = self.pool.begin().await?;
        let (state, expected): (String, i32) = sqlx::query_as(
            "SELECT state, expected_subbands FROM groups WHERE group_id = $1 FOR UPDATE",
        )
        .bind(group_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| unknown_group(group_id))?;
        let state: GroupState = state.parse()?;

        if subband_index < 0 || subband_index >= expected {
            return Err(PipelineError::validation(format!(
                "subband index {} outside [0, {}) for group '{}'",
                subband_index, expected, group_id
            ))
            .into());
        }

        let inserted = sqlx::query(
            "INSERT INTO subbands (group_id, subband_index, file_path)
             VALUES ($1, $2, $3)
             ON CONFLICT DO NOTHING",
        )
        .bind(group_id)
        .bind(subband_index)
        .bind(file_path)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if !inserted {
            let known: Option<String> = sqlx::query_scalar(
                "SELECT group_id FROM subbands WHERE file_path = $1",
            )
            .bind(file_path)
            .fetch_optional(&mut *tx)
            .await?;
            match known {
                Some(owner) => debug!(file_path, group_id = %owner, "subband file already recorded"),
                None => warn!(
                    group_id,
                    subband_index,
                    file_path,
                    "subband index already recorded with a different file"
                ),
            }
        }

        let count = count_subbands(&mut *tx, group_id).await?;
        let new_state = if state == GroupState::Collecting && count >= expected {
            GroupState::Pending
        } else {
            state
        };
        sqlx::query(
            "UPDATE groups
             SET subband_count = $2,
                 dec_deg = COALESCE(dec_deg, $3),
                 state = $4,
                 updated_at = NOW()
             WHERE group_id = $1",
        )
        .bind(group_id)
        .bind(count)
        .bind(dec_deg)
        .bind(new_state.as_str())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        let became_complete = state == GroupState::Collecting && new_state == GroupState::Pending;
        if became_complete {
            info!(group_id, subband_count = count, "group complete");
        }
        Ok(RecordOutcome {
            group_id: group_id.to_string(),
            inserted,
            subband_count: count,
            expected_subbands: expected,
            state: new_state,
            became_complete,
        })
    }

    /// Move a provisional group to its canonical id and apply corrected paths.
    ///
    /// Merges into `new_group_id` when it already exists, otherwise renames in
    /// place. The move and every path update commit together; any failure
    /// leaves the store as it was.
    pub async fn update_group_after_normalize(
        &self,
        old_group_id: &str,
        new_group_id: &str,
        new_paths: &BTreeMap<i32, String>,
    ) -> Result<NormalizeOutcome> {
        let new_group_id = new_group_id.trim();
        if new_group_id.is_empty() {
            return Err(PipelineError::validation("new group id is empty").into());
        }

        let mut tx = self.pool.begin().await?;
        lock_group(&mut *tx, old_group_id)
            .await?
            .ok_or_else(|| unknown_group(old_group_id))?;

        let outcome = if old_group_id == new_group_id {
            NormalizeOutcome::Unchanged
        } else if lock_group(&mut *tx, new_group_id).await?.is_some() {
            let dropped = merge_into(&mut *tx, old_group_id, new_group_id).await?;
            NormalizeOutcome::Merged { dropped }
        } else {
            sqlx::query("UPDATE groups SET group_id = $2, updated_at = NOW() WHERE group_id = $1")
                .bind(old_group_id)
                .bind(new_group_id)
                .execute(&mut *tx)
                .await?;
            NormalizeOutcome::Renamed
        };

        for (index, path) in new_paths {
            let updated = sqlx::query(
                "UPDATE subbands SET file_path = $3 WHERE group_id = $1 AND subband_index = $2",
            )
            .bind(new_group_id)
            .bind(*index)
            .bind(path)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if updated == 0 {
                return Err(PipelineError::validation(format!(
                    "group '{}' has no subband {} to repath",
                    new_group_id, index
                ))
                .into());
            }
        }

        tx.commit().await?;
        info!(
            old_group_id,
            new_group_id,
            outcome = ?outcome,
            paths = new_paths.len(),
            "normalized group"
        );
        Ok(outcome)
    }

    /// Advance a group's state, stamping `completed_at` on terminal states.
    pub async fn update_group_state(
        &self,
        group_id: &str,
        state: GroupState,
        error: Option<&str>,
        output_path: Option<&str>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let current: GroupState = lock_group(&mut *tx, group_id)
            .await?
            .ok_or_else(|| unknown_group(group_id))?
            .parse()?;
        if !current.can_advance_to(state) {
            return Err(PipelineError::validation(format!(
                "group '{}' cannot move from {} to {}",
                group_id, current, state
            ))
            .into());
        }
        sqlx::query(
            "UPDATE groups
             SET state = $2,
                 error = COALESCE($3, error),
                 output_path = COALESCE($4, output_path),
                 completed_at = CASE WHEN $2 IN ('completed', 'failed')
                                     THEN COALESCE(completed_at, NOW())
                                     ELSE completed_at END,
                 updated_at = NOW()
             WHERE group_id = $1",
        )
        .bind(group_id)
        .bind(state.as_str())
        .bind(error)
        .bind(output_path)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        if current != state {
            info!(group_id, from = %current, to = %state, "group state changed");
        }
        Ok(())
    }

    pub async fn get_group(&self, group_id: &str) -> Result<Option<GroupRow>> {
        let row = sqlx::query_as::<_, GroupRow>(&format!(
            "SELECT {} FROM groups WHERE group_id = $1",
            GROUP_COLUMNS
        ))
        .bind(group_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Newest first, optionally filtered by state.
    pub async fn list_groups(&self, state: Option<GroupState>, limit: i64) -> Result<Vec<GroupRow>> {
        let rows = sqlx::query_as::<_, GroupRow>(&format!(
            "SELECT {} FROM groups
             WHERE ($1::TEXT IS NULL OR state = $1)
             ORDER BY group_id DESC
             LIMIT $2",
            GROUP_COLUMNS
        ))
        .bind(state.map(|s| s.as_str()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Complete groups awaiting processing, oldest first.
    pub async fn get_pending_groups(&self, limit: i64) -> Result<Vec<GroupRow>> {
        let rows = sqlx::query_as::<_, GroupRow>(&format!(
            "SELECT {} FROM groups WHERE state = 'pending' ORDER BY created_at ASC LIMIT $1",
            GROUP_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Subband index → file path for one group.
    pub async fn get_group_files(&self, group_id: &str) -> Result<BTreeMap<i32, String>> {
        let rows: Vec<(i32, String)> = sqlx::query_as(
            "SELECT subband_index, file_path FROM subbands
             WHERE group_id = $1 ORDER BY subband_index",
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    pub async fn get_subband_by_path(&self, file_path: &str) -> Result<Option<SubbandRow>> {
        let row = sqlx::query_as::<_, SubbandRow>(
            "SELECT group_id, subband_index, file_path, recorded_at
             FROM subbands WHERE file_path = $1",
        )
        .bind(file_path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_ingestion_stats(&self) -> Result<IngestionStats> {
        let stats = sqlx::query_as::<_, IngestionStats>(
            "SELECT
                COUNT(*) FILTER (WHERE state = 'collecting') AS collecting,
                COUNT(*) FILTER (WHERE state = 'pending') AS pending,
                COUNT(*) FILTER (WHERE state = 'normalizing') AS normalizing,
                COUNT(*) FILTER (WHERE state = 'converting') AS converting,
                COUNT(*) FILTER (WHERE state = 'completed') AS completed,
                COUNT(*) FILTER (WHERE state = 'failed') AS failed,
                COUNT(*) AS total,
                (SELECT COUNT(*) FROM subbands) AS subbands
             FROM groups",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(stats)
    }

    /// Merge open groups that fell within `tolerance_s` of each other.
    ///
    /// Clusters are formed by walking open ids in order and anchoring on the
    /// earliest id of each cluster. Each cluster collapses into the member
    /// with the most subbands (ties go to the earliest id). Returns the number
    /// of groups merged away.
    pub async fn consolidate_fragmented_groups(&self, tolerance_s: f64) -> Result<usize> {
        if !tolerance_s.is_finite() || tolerance_s < 0.0 {
            return Err(PipelineError::validation(format!(
                "cluster tolerance must be non-negative, got {}",
                tolerance_s
            ))
            .into());
        }
        let tolerance = tolerance_s.trunc() as i64;

        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(CLUSTER_LOCK_KEY)
            .execute(&mut *tx)
            .await?;
        let open: Vec<(String, i32)> = sqlx::query_as(
            "SELECT group_id, subband_count FROM groups
             WHERE state IN ('collecting', 'pending')
             ORDER BY group_id
             FOR UPDATE",
        )
        .fetch_all(&mut *tx)
        .await?;

        let mut merged = 0;
        for cluster in cluster_ids(&open, tolerance) {
            if cluster.len() < 2 {
                continue;
            }
            let target = pick_merge_target(&cluster);
            for (id, _) in &cluster {
                if id == target {
                    continue;
                }
                let dropped = merge_into(&mut *tx, id, target).await?;
                info!(from = %id, into = %target, dropped = ?dropped, "consolidated fragmented group");
                merged += 1;
            }
        }
        tx.commit().await?;
        Ok(merged)
    }

    /// Delete terminal groups whose `completed_at` is older than `retention`.
    pub async fn prune_groups(&self, retention: Duration) -> Result<u64> {
        let deleted = sqlx::query(
            "DELETE FROM groups
             WHERE state IN ('completed', 'failed')
               AND completed_at < NOW() - make_interval(secs => $1)",
        )
        .bind(retention.as_secs_f64())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(deleted)
    }
}

async fn lock_group(conn: &mut PgConnection, group_id: &str) -> Result<Option<String>> {
    let state: Option<String> =
        sqlx::query_scalar("SELECT state FROM groups WHERE group_id = $1 FOR UPDATE")
            .bind(group_id)
            .fetch_optional(&mut *conn)
            .await?;
    Ok(state)
}

async fn count_subbands(conn: &mut PgConnection, group_id: &str) -> Result<i32> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(DISTINCT subband_index) FROM subbands WHERE group_id = $1")
            .bind(group_id)
            .fetch_one(&mut *conn)
            .await?;
    Ok(count as i32)
}

/// Move every subband of `old` under `new`, delete `old`, and recount `new`.
/// Both rows must already be locked by the caller.
async fn merge_into(conn: &mut PgConnection, old: &str, new: &str) -> Result<Vec<i32>> {
    let dropped: Vec<i32> = sqlx::query_scalar(
        "DELETE FROM subbands o
         USING subbands n
         WHERE o.group_id = $1 AND n.group_id = $2
           AND o.subband_index = n.subband_index
         RETURNING o.subband_index",
    )
    .bind(old)
    .bind(new)
    .fetch_all(&mut *conn)
    .await?;
    if !dropped.is_empty() {
        warn!(old, new, dropped = ?dropped, "merge target already held these subbands");
    }

    sqlx::query("UPDATE subbands SET group_id = $2 WHERE group_id = $1")
        .bind(old)
        .bind(new)
        .execute(&mut *conn)
        .await?;

    let old_dec: Option<f64> =
        sqlx::query_scalar("DELETE FROM groups WHERE group_id = $1 RETURNING dec_deg")
            .bind(old)
            .fetch_one(&mut *conn)
            .await?;

    let count = count_subbands(conn, new).await?;
    sqlx::query(
        "UPDATE groups
         SET subband_count = $2,
             dec_deg = COALESCE(dec_deg, $3),
             state = CASE WHEN state = 'collecting' AND $2 >= expected_subbands
                          THEN 'pending' ELSE state END,
             updated_at = NOW()
         WHERE group_id = $1",
    )
    .bind(new)
    .bind(count)
    .bind(old_dec)
    .execute(&mut *conn)
    .await?;
    Ok(dropped)
}

/// Partition sorted `(id, count)` pairs into clusters anchored on their earliest id.
pub(crate) fn cluster_ids(sorted: &[(String, i32)], tolerance_s: i64) -> Vec<Vec<(String, i32)>> {
    let mut clusters: Vec<Vec<(String, i32)>> = Vec::new();
    for (id, count) in sorted {
        let joins = clusters
            .last()
            .and_then(|c| c.first())
            .and_then(|(anchor, _)| seconds_between(anchor, id).ok())
            .is_some_and(|delta| delta <= tolerance_s);
        match clusters.last_mut() {
            Some(cluster) if joins => cluster.push((id.clone(), *count)),
            _ => clusters.push(vec![(id.clone(), *count)]),
        }
    }
    clusters
}

/// Member with the most subbands; earliest id on ties.
pub(crate) fn pick_merge_target(cluster: &[(String, i32)]) -> &str {
    let mut best = &cluster[0];
    for member in &cluster[1..] {
        if member.1 > best.1 {
            best = member;
        }
    }
    &best.0
}
