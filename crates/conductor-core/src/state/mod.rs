//! Task state machine transitions.
//!
//! Validates and executes state transitions for tasks, enforcing the
//! allowed transition graph, optimistic locking, timestamp management,
//! and retry limits.

pub mod dispatch;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use conductor_db::Db;
use conductor_db::models::TaskStatus;
use conductor_db::queries::tasks as task_db;

/// The task state machine.
///
/// Enforces the valid transition graph:
///
/// ```text
/// pending      -> queued | cancelled
/// queued       -> running | cancelled
/// running      -> completed | needs_review | failed | pending (retry) | cancelled
/// needs_review -> completed | pending (retry) | failed   (checkpoint resolution)
/// failed       -> pending   (operator retry override)
/// ```
///
/// `blocked` never appears here: it is derived from unmet dependencies at
/// read time, not stored.
pub struct TaskStateMachine;

impl TaskStateMachine {
    /// Check whether a transition from `from` to `to` is a valid edge
    /// in the state graph.
    pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
        matches!(
            (from, to),
            (TaskStatus::Pending, TaskStatus::Queued)
                | (TaskStatus::Pending, TaskStatus::Cancelled)
                | (TaskStatus::Queued, TaskStatus::Running)
                | (TaskStatus::Queued, TaskStatus::Cancelled)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::NeedsReview)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Pending)
                | (TaskStatus::Running, TaskStatus::Cancelled)
                | (TaskStatus::NeedsReview, TaskStatus::Completed)
                | (TaskStatus::NeedsReview, TaskStatus::Pending)
                | (TaskStatus::NeedsReview, TaskStatus::Failed)
                | (TaskStatus::Failed, TaskStatus::Pending)
        )
    }

    /// Execute a state transition with optimistic locking.
    ///
    /// - Validates the transition is legal.
    /// - Sets `started_at` when transitioning `queued -> running`.
    /// - Sets `completed_at` when entering a terminal status.
    /// - For retry edges (`* -> pending`), delegates to
    ///   [`Self::retry_transition`] which also increments the attempt
    ///   counter.
    ///
    /// Returns an error if the transition is not valid, the task does not
    /// exist, or the stored status does not match `from` (optimistic lock
    /// failure).
    pub async fn transition(
        db: &Db,
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !Self::is_valid_transition(from, to) {
            bail!(
                "invalid state transition: {} -> {} for task {}",
                from,
                to,
                task_id
            );
        }

        // Retry edges are special: they increment the attempt counter.
        if to == TaskStatus::Pending {
            return Self::retry_transition(db, task_id, from).await;
        }

        let started_at = if from == TaskStatus::Queued && to == TaskStatus::Running {
            Some(now)
        } else {
            None
        };

        let completed_at = if to.is_terminal() { Some(now) } else { None };

        let rows = task_db::transition_task_status(db.write(), task_id, from, to, started_at, completed_at)
            .await
            .with_context(|| {
                format!(
                    "failed to transition task {} from {} to {}",
                    task_id, from, to
                )
            })?;

        if rows == 0 {
            return Self::lock_failure(db, task_id, from).await;
        }

        Ok(())
    }

    /// Execute a failure-shaped transition (`-> failed` or
    /// `-> needs_review`), recording the error that caused it.
    pub async fn fail_transition(
        db: &Db,
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !Self::is_valid_transition(from, to) {
            bail!(
                "invalid state transition: {} -> {} for task {}",
                from,
                to,
                task_id
            );
        }

        let rows = task_db::transition_task_failure(db.write(), task_id, from, to, error, now)
            .await
            .with_context(|| {
                format!("failed to record failure for task {} ({} -> {})", task_id, from, to)
            })?;

        if rows == 0 {
            return Self::lock_failure(db, task_id, from).await;
        }

        Ok(())
    }

    /// Handle a retry edge back to `pending`.
    ///
    /// Fetches the task to check the attempt counter against `retry_max`,
    /// then atomically increments the attempt and resets the status.
    async fn retry_transition(db: &Db, task_id: Uuid, from: TaskStatus) -> Result<()> {
        let task = task_db::get_task(db.read(), task_id)
            .await?
            .with_context(|| format!("task {} not found", task_id))?;

        if task.status != from {
            bail!(
                "cannot retry task {}: current status is {}, expected {}",
                task_id,
                task.status,
                from
            );
        }

        // Transient retries respect retry_max; operator overrides from
        // needs_review/failed do not (the operator already adjudicated).
        if from == TaskStatus::Running && task.attempt >= task.retry_max {
            bail!(
                "cannot retry task {}: attempt {} >= retry_max {}",
                task_id,
                task.attempt,
                task.retry_max
            );
        }

        let rows = task_db::transition_task_retry(db.write(), task_id, from, task.attempt).await?;

        if rows == 0 {
            bail!(
                "optimistic lock failed on retry for task {} (attempt {})",
                task_id,
                task.attempt
            );
        }

        Ok(())
    }

    /// Validate that all dependencies of a task are `completed`.
    pub async fn check_dependencies(db: &Db, task_id: Uuid) -> Result<()> {
        let dep_ids = task_db::get_task_dependencies(db.read(), task_id).await?;

        for dep_id in dep_ids {
            let dep = task_db::get_task(db.read(), dep_id)
                .await?
                .with_context(|| format!("dependency task {} not found", dep_id))?;

            if dep.status != TaskStatus::Completed {
                bail!(
                    "dependency {} ({}) for task {} has status {}, expected completed",
                    dep.title,
                    dep_id,
                    task_id,
                    dep.status
                );
            }
        }

        Ok(())
    }

    /// Build the diagnostic error after a zero-row optimistic update.
    async fn lock_failure(db: &Db, task_id: Uuid, expected: TaskStatus) -> Result<()> {
        let task = task_db::get_task(db.read(), task_id).await?;
        match task {
            None => bail!("task {} not found", task_id),
            Some(t) => bail!(
                "optimistic lock failed: task {} has status {}, expected {}",
                task_id,
                t.status,
                expected
            ),
        }
    }
}
