//! Database query functions for the `projects` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{SqliteExecutor, SqlitePool};
use uuid::Uuid;

use crate::models::{Project, ProjectStatus};

/// Insert a new project row in `draft` status.
pub async fn insert_project<'e>(
    exec: impl SqliteExecutor<'e>,
    id: Uuid,
    name: &str,
    description: &str,
    now: DateTime<Utc>,
) -> Result<Project> {
    let project = sqlx::query_as::<_, Project>(
        "INSERT INTO projects (id, name, description, status, created_at) \
         VALUES (?, ?, ?, 'draft', ?) \
         RETURNING *",
    )
    .bind(id)
    .bind(name)
    .bind(description)
    .bind(now)
    .fetch_one(exec)
    .await
    .context("failed to insert project")?;

    Ok(project)
}

/// Fetch a single project by ID.
pub async fn get_project(pool: &SqlitePool, id: Uuid) -> Result<Option<Project>> {
    let project = sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch project")?;

    Ok(project)
}

/// List all projects, newest first.
pub async fn list_projects(pool: &SqlitePool) -> Result<Vec<Project>> {
    let projects =
        sqlx::query_as::<_, Project>("SELECT * FROM projects ORDER BY created_at DESC")
            .fetch_all(pool)
            .await
            .context("failed to list projects")?;

    Ok(projects)
}

/// List projects the executor drives: `ready`, `executing`, or `paused`,
/// oldest first so long-running projects are not starved.
pub async fn list_active_projects(pool: &SqlitePool) -> Result<Vec<Project>> {
    let projects = sqlx::query_as::<_, Project>(
        "SELECT * FROM projects \
         WHERE status IN ('ready', 'executing', 'paused') \
         ORDER BY created_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list active projects")?;

    Ok(projects)
}

/// Atomically transition a project from one status to another.
///
/// Optimistic locking: the WHERE clause pins the expected current status,
/// so zero rows affected means the status had already moved.
pub async fn transition_project_status<'e>(
    exec: impl SqliteExecutor<'e>,
    id: Uuid,
    from: ProjectStatus,
    to: ProjectStatus,
) -> Result<u64> {
    let result = sqlx::query("UPDATE projects SET status = ? WHERE id = ? AND status = ?")
        .bind(to)
        .bind(id)
        .bind(from)
        .execute(exec)
        .await
        .context("failed to transition project status")?;

    Ok(result.rows_affected())
}

/// Move a project to a terminal status, recording the completion time and
/// an optional failure reason.
pub async fn finish_project<'e>(
    exec: impl SqliteExecutor<'e>,
    id: Uuid,
    to: ProjectStatus,
    fail_reason: Option<&str>,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE projects \
         SET status = ?, fail_reason = ?, completed_at = ? \
         WHERE id = ? AND status NOT IN ('completed', 'failed', 'cancelled')",
    )
    .bind(to)
    .bind(fail_reason)
    .bind(now)
    .bind(id)
    .execute(exec)
    .await
    .context("failed to finish project")?;

    Ok(result.rows_affected())
}
