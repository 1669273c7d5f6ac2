//! Database query functions for the `tasks` and `task_deps` tables.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{SqliteExecutor, SqlitePool};
use uuid::Uuid;

use crate::models::{Complexity, Task, TaskStatus, TaskType};

/// Parameters for inserting a new task row.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub id: Uuid,
    pub project_id: Uuid,
    pub plan_id: Uuid,
    pub title: String,
    pub description: String,
    pub task_type: TaskType,
    pub complexity: Complexity,
    pub wave: i64,
    pub priority: i64,
    pub tools_needed: Vec<String>,
    pub retry_max: i64,
    pub created_at: DateTime<Utc>,
}

/// Insert a new task row in `pending` status.
pub async fn insert_task<'e>(exec: impl SqliteExecutor<'e>, new: &NewTask) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (id, project_id, plan_id, title, description, task_type, \
                            complexity, wave, priority, status, tools_needed, retry_max, \
                            created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?, ?) \
         RETURNING *",
    )
    .bind(new.id)
    .bind(new.project_id)
    .bind(new.plan_id)
    .bind(&new.title)
    .bind(&new.description)
    .bind(new.task_type)
    .bind(new.complexity)
    .bind(new.wave)
    .bind(new.priority)
    .bind(Json(new.tools_needed.clone()))
    .bind(new.retry_max)
    .bind(new.created_at)
    .fetch_one(exec)
    .await
    .with_context(|| format!("failed to insert task {:?}", new.title))?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &SqlitePool, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// List all tasks for a project in scheduling order.
pub async fn list_tasks_for_project(pool: &SqlitePool, project_id: Uuid) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE project_id = ? \
         ORDER BY wave ASC, priority DESC, created_at ASC",
    )
    .bind(project_id)
    .fetch_all(pool)
    .await
    .context("failed to list tasks for project")?;

    Ok(tasks)
}

/// Count tasks materialized from a given plan.
pub async fn count_tasks_for_plan(pool: &SqlitePool, plan_id: Uuid) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tasks WHERE plan_id = ?")
        .bind(plan_id)
        .fetch_one(pool)
        .await
        .context("failed to count tasks for plan")?;

    Ok(row.0)
}

/// Insert a dependency edge: `task_id` depends on `depends_on_id`.
///
/// Uses `ON CONFLICT DO NOTHING` so this is idempotent.
pub async fn insert_task_dep<'e>(
    exec: impl SqliteExecutor<'e>,
    task_id: Uuid,
    depends_on_id: Uuid,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO task_deps (task_id, depends_on) VALUES (?, ?) \
         ON CONFLICT DO NOTHING",
    )
    .bind(task_id)
    .bind(depends_on_id)
    .execute(exec)
    .await
    .context("failed to insert task dependency")?;

    Ok(())
}

/// Get the IDs of all tasks that a given task depends on.
pub async fn get_task_dependencies(pool: &SqlitePool, task_id: Uuid) -> Result<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> =
        sqlx::query_as("SELECT depends_on FROM task_deps WHERE task_id = ?")
            .bind(task_id)
            .fetch_all(pool)
            .await
            .context("failed to get task dependencies")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

// -----------------------------------------------------------------------
// State-machine queries
// -----------------------------------------------------------------------

/// Atomically transition a task from one status to another.
///
/// Optimistic locking: the UPDATE's WHERE clause pins `status = from`, so
/// the row only changes if the current status matches. Returns the number
/// of rows affected (0 means the status did not match).
pub async fn transition_task_status<'e>(
    exec: impl SqliteExecutor<'e>,
    task_id: Uuid,
    from: TaskStatus,
    to: TaskStatus,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = ?, \
             started_at = COALESCE(?, started_at), \
             completed_at = COALESCE(?, completed_at) \
         WHERE id = ? AND status = ?",
    )
    .bind(to)
    .bind(started_at)
    .bind(completed_at)
    .bind(task_id)
    .bind(from)
    .execute(exec)
    .await
    .context("failed to transition task status")?;

    Ok(result.rows_affected())
}

/// Atomically reset a task to `pending` for another attempt, incrementing
/// the attempt counter and clearing per-run timestamps. Locks on both the
/// expected current status and the current attempt value.
pub async fn transition_task_retry<'e>(
    exec: impl SqliteExecutor<'e>,
    task_id: Uuid,
    from: TaskStatus,
    current_attempt: i64,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'pending', \
             attempt = attempt + 1, \
             started_at = NULL, \
             completed_at = NULL \
         WHERE id = ? AND status = ? AND attempt = ?",
    )
    .bind(task_id)
    .bind(from)
    .bind(current_attempt)
    .execute(exec)
    .await
    .context("failed to reset task for retry")?;

    Ok(result.rows_affected())
}

/// Finish a running task as `completed`, storing its output and usage
/// totals for the final attempt.
#[allow(clippy::too_many_arguments)]
pub async fn complete_task<'e>(
    exec: impl SqliteExecutor<'e>,
    task_id: Uuid,
    output: &str,
    partial: bool,
    tokens_in: i64,
    tokens_out: i64,
    cost: f64,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'completed', output = ?, partial = ?, \
             tokens_in = ?, tokens_out = ?, cost = ?, error = NULL, \
             completed_at = ? \
         WHERE id = ? AND status = 'running'",
    )
    .bind(output)
    .bind(partial)
    .bind(tokens_in)
    .bind(tokens_out)
    .bind(cost)
    .bind(now)
    .bind(task_id)
    .execute(exec)
    .await
    .context("failed to complete task")?;

    Ok(result.rows_affected())
}

/// Move a task into a failure-shaped status (`failed` or `needs_review`),
/// recording the error that got it there.
pub async fn transition_task_failure<'e>(
    exec: impl SqliteExecutor<'e>,
    task_id: Uuid,
    from: TaskStatus,
    to: TaskStatus,
    error: &str,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = ?, error = ?, completed_at = ? \
         WHERE id = ? AND status = ?",
    )
    .bind(to)
    .bind(error)
    .bind(now)
    .bind(task_id)
    .bind(from)
    .execute(exec)
    .await
    .context("failed to record task failure")?;

    Ok(result.rows_affected())
}

/// Record the error message for a task without changing its status.
///
/// Used on transient retries so the next attempt's context can carry the
/// previous failure.
pub async fn set_task_error<'e>(
    exec: impl SqliteExecutor<'e>,
    task_id: Uuid,
    error: &str,
) -> Result<u64> {
    let result = sqlx::query("UPDATE tasks SET error = ? WHERE id = ?")
        .bind(error)
        .bind(task_id)
        .execute(exec)
        .await
        .context("failed to set task error")?;

    Ok(result.rows_affected())
}

/// Update the operator-editable fields of a pending task.
pub async fn update_task_fields<'e>(
    exec: impl SqliteExecutor<'e>,
    task_id: Uuid,
    title: Option<&str>,
    description: Option<&str>,
    priority: Option<i64>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET title = COALESCE(?, title), \
             description = COALESCE(?, description), \
             priority = COALESCE(?, priority) \
         WHERE id = ? AND status = 'pending'",
    )
    .bind(title)
    .bind(description)
    .bind(priority)
    .bind(task_id)
    .execute(exec)
    .await
    .context("failed to update task fields")?;

    Ok(result.rows_affected())
}

// -----------------------------------------------------------------------
// Scheduler queries
// -----------------------------------------------------------------------

/// Get all pending tasks in a project whose dependencies are all
/// `completed`, in scheduling order: wave ascending, then priority
/// descending, then creation time ascending.
pub async fn get_ready_tasks(pool: &SqlitePool, project_id: Uuid) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT t.* \
         FROM tasks t \
         WHERE t.project_id = ? \
           AND t.status = 'pending' \
           AND NOT EXISTS ( \
               SELECT 1 FROM task_deps td \
               JOIN tasks dep ON dep.id = td.depends_on \
               WHERE td.task_id = t.id AND dep.status != 'completed' \
           ) \
         ORDER BY t.wave ASC, t.priority DESC, t.created_at ASC",
    )
    .bind(project_id)
    .fetch_all(pool)
    .await
    .context("failed to get ready tasks")?;

    Ok(tasks)
}

/// Count pending tasks in a project that have at least one unfinished
/// dependency. These are the tasks reported as blocked.
pub async fn count_blocked_tasks(pool: &SqlitePool, project_id: Uuid) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) \
         FROM tasks t \
         WHERE t.project_id = ? \
           AND t.status = 'pending' \
           AND EXISTS ( \
               SELECT 1 FROM task_deps td \
               JOIN tasks dep ON dep.id = td.depends_on \
               WHERE td.task_id = t.id AND dep.status != 'completed' \
           )",
    )
    .bind(project_id)
    .fetch_one(pool)
    .await
    .context("failed to count blocked tasks")?;

    Ok(row.0)
}

/// Status counts for a project's tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectProgress {
    pub pending: i64,
    pub queued: i64,
    pub running: i64,
    pub completed: i64,
    pub needs_review: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub total: i64,
}

impl ProjectProgress {
    /// Tasks that can still change state without operator action.
    pub fn runnable(&self) -> i64 {
        self.pending + self.queued + self.running
    }
}

/// Get a summary of task counts by status for a given project.
pub async fn get_project_progress(pool: &SqlitePool, project_id: Uuid) -> Result<ProjectProgress> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status, COUNT(*) FROM tasks WHERE project_id = ? GROUP BY status",
    )
    .bind(project_id)
    .fetch_all(pool)
    .await
    .context("failed to get project progress")?;

    let mut progress = ProjectProgress::default();
    for (status, count) in &rows {
        match status.as_str() {
            "pending" => progress.pending = *count,
            "queued" => progress.queued = *count,
            "running" => progress.running = *count,
            "completed" => progress.completed = *count,
            "needs_review" => progress.needs_review = *count,
            "failed" => progress.failed = *count,
            "cancelled" => progress.cancelled = *count,
            _ => {}
        }
        progress.total += count;
    }
    Ok(progress)
}

// -----------------------------------------------------------------------
// Recovery and cancellation
// -----------------------------------------------------------------------

/// List tasks stranded in `queued` or `running` across all projects.
///
/// After a crash, the in-memory dispatch state is gone, so any task in an
/// in-flight status belongs to a worker that no longer exists.
pub async fn list_stranded_tasks(pool: &SqlitePool) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE status IN ('queued', 'running')",
    )
    .fetch_all(pool)
    .await
    .context("failed to list stranded tasks")?;

    Ok(tasks)
}

/// Reset a stranded task back to `pending` so the scheduler can pick it up
/// again. Restart-recovery only; normal retries go through
/// [`transition_task_retry`].
pub async fn recover_task_to_pending<'e>(
    exec: impl SqliteExecutor<'e>,
    task_id: Uuid,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET status = 'pending', started_at = NULL \
         WHERE id = ? AND status IN ('queued', 'running')",
    )
    .bind(task_id)
    .execute(exec)
    .await
    .context("failed to recover task to pending")?;

    Ok(result.rows_affected())
}

/// Move a stranded, retry-exhausted task straight to `needs_review`.
/// Restart-recovery only.
pub async fn recover_task_to_review<'e>(
    exec: impl SqliteExecutor<'e>,
    task_id: Uuid,
    error: &str,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'needs_review', error = ?, started_at = NULL, completed_at = ? \
         WHERE id = ? AND status IN ('queued', 'running')",
    )
    .bind(error)
    .bind(now)
    .bind(task_id)
    .execute(exec)
    .await
    .context("failed to recover task to needs_review")?;

    Ok(result.rows_affected())
}

/// Cancel every task in a project that has not yet reached a worker
/// (`pending` or `queued`). Running tasks are cancelled by their workers.
///
/// Returns the cancelled tasks.
pub async fn cancel_idle_tasks_for_project<'e>(
    exec: impl SqliteExecutor<'e>,
    project_id: Uuid,
    now: DateTime<Utc>,
) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "UPDATE tasks \
         SET status = 'cancelled', completed_at = ? \
         WHERE project_id = ? AND status IN ('pending', 'queued') \
         RETURNING *",
    )
    .bind(now)
    .bind(project_id)
    .fetch_all(exec)
    .await
    .context("failed to cancel idle tasks")?;

    Ok(tasks)
}
