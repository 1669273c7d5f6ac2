//! Convenience dispatch helpers that wrap [`super::TaskStateMachine`]
//! transitions with semantic names.

use anyhow::Result;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use conductor_db::Db;
use conductor_db::models::TaskStatus;

use super::TaskStateMachine;

/// Queue a task for dispatch: transition `pending -> queued`.
///
/// Dependencies must already be satisfied; the scheduler's ready query
/// guarantees this, and [`TaskStateMachine::check_dependencies`] can
/// re-verify when in doubt.
pub async fn queue_task(db: &Db, task_id: Uuid, now: DateTime<Utc>) -> Result<()> {
    TaskStateMachine::transition(db, task_id, TaskStatus::Pending, TaskStatus::Queued, now).await
}

/// Start a task: transition `queued -> running`, setting `started_at`.
pub async fn start_task(db: &Db, task_id: Uuid, now: DateTime<Utc>) -> Result<()> {
    TaskStateMachine::transition(db, task_id, TaskStatus::Queued, TaskStatus::Running, now).await
}

/// Mark a running task permanently failed, recording the error.
pub async fn fail_task(db: &Db, task_id: Uuid, error: &str, now: DateTime<Utc>) -> Result<()> {
    TaskStateMachine::fail_transition(
        db,
        task_id,
        TaskStatus::Running,
        TaskStatus::Failed,
        error,
        now,
    )
    .await
}

/// Park a running task for human review after retries are exhausted.
pub async fn review_task(db: &Db, task_id: Uuid, error: &str, now: DateTime<Utc>) -> Result<()> {
    TaskStateMachine::fail_transition(
        db,
        task_id,
        TaskStatus::Running,
        TaskStatus::NeedsReview,
        error,
        now,
    )
    .await
}

/// Reset a running task to `pending` for a transient retry.
///
/// Increments the attempt counter; fails once `attempt >= retry_max`.
pub async fn retry_task(db: &Db, task_id: Uuid, now: DateTime<Utc>) -> Result<()> {
    TaskStateMachine::transition(db, task_id, TaskStatus::Running, TaskStatus::Pending, now).await
}

/// Cancel a task from any in-flight status.
pub async fn cancel_task(
    db: &Db,
    task_id: Uuid,
    from: TaskStatus,
    now: DateTime<Utc>,
) -> Result<()> {
    TaskStateMachine::transition(db, task_id, from, TaskStatus::Cancelled, now).await
}

/// Operator override: push a `failed` or `needs_review` task back to
/// `pending` regardless of the retry budget.
pub async fn override_retry(
    db: &Db,
    task_id: Uuid,
    from: TaskStatus,
    now: DateTime<Utc>,
) -> Result<()> {
    TaskStateMachine::transition(db, task_id, from, TaskStatus::Pending, now).await
}
