//! Database query functions for the `checkpoints` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{SqliteExecutor, SqlitePool};
use uuid::Uuid;

use crate::models::{Checkpoint, CheckpointResolution};

/// Insert a new pending checkpoint for a task.
pub async fn insert_checkpoint<'e>(
    exec: impl SqliteExecutor<'e>,
    id: Uuid,
    project_id: Uuid,
    task_id: Uuid,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<Checkpoint> {
    let checkpoint = sqlx::query_as::<_, Checkpoint>(
        "INSERT INTO checkpoints (id, project_id, task_id, reason, status, created_at) \
         VALUES (?, ?, ?, ?, 'pending', ?) \
         RETURNING *",
    )
    .bind(id)
    .bind(project_id)
    .bind(task_id)
    .bind(reason)
    .bind(now)
    .fetch_one(exec)
    .await
    .context("failed to insert checkpoint")?;

    Ok(checkpoint)
}

/// Fetch a checkpoint by its ID.
pub async fn get_checkpoint(pool: &SqlitePool, id: Uuid) -> Result<Option<Checkpoint>> {
    let checkpoint = sqlx::query_as::<_, Checkpoint>("SELECT * FROM checkpoints WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch checkpoint")?;

    Ok(checkpoint)
}

/// List unresolved checkpoints for a project, oldest first.
pub async fn list_pending_checkpoints(
    pool: &SqlitePool,
    project_id: Uuid,
) -> Result<Vec<Checkpoint>> {
    let checkpoints = sqlx::query_as::<_, Checkpoint>(
        "SELECT * FROM checkpoints \
         WHERE project_id = ? AND status = 'pending' \
         ORDER BY created_at ASC",
    )
    .bind(project_id)
    .fetch_all(pool)
    .await
    .context("failed to list pending checkpoints")?;

    Ok(checkpoints)
}

/// Resolve a pending checkpoint with the operator's decision.
///
/// Returns the number of rows affected; zero means the checkpoint was
/// missing or already resolved.
pub async fn resolve_checkpoint<'e>(
    exec: impl SqliteExecutor<'e>,
    id: Uuid,
    resolution: CheckpointResolution,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE checkpoints \
         SET status = 'resolved', resolution = ?, resolved_at = ? \
         WHERE id = ? AND status = 'pending'",
    )
    .bind(resolution)
    .bind(now)
    .bind(id)
    .execute(exec)
    .await
    .context("failed to resolve checkpoint")?;

    Ok(result.rows_affected())
}
