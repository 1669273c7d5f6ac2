//! Database query functions for the `events` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{SqliteExecutor, SqlitePool};
use uuid::Uuid;

use crate::models::EventRecord;

/// Parameters for inserting a new event row.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub project_id: Uuid,
    pub task_id: Option<Uuid>,
    pub kind: String,
    pub message: String,
    pub payload: Value,
    pub recorded_at: DateTime<Utc>,
}

/// Insert a new event row. Returns the inserted row with its
/// autoincrement ID.
pub async fn insert_event<'e>(exec: impl SqliteExecutor<'e>, new: &NewEvent) -> Result<EventRecord> {
    let event = sqlx::query_as::<_, EventRecord>(
        "INSERT INTO events (project_id, task_id, kind, message, payload, recorded_at) \
         VALUES (?, ?, ?, ?, ?, ?) \
         RETURNING *",
    )
    .bind(new.project_id)
    .bind(new.task_id)
    .bind(&new.kind)
    .bind(&new.message)
    .bind(&new.payload)
    .bind(new.recorded_at)
    .fetch_one(exec)
    .await
    .with_context(|| {
        format!(
            "failed to insert event {} for project {}",
            new.kind, new.project_id
        )
    })?;

    Ok(event)
}

/// List events for a project with ID greater than `after_id`, in ID order.
/// Used by reconnecting subscribers to catch up before going live.
pub async fn list_events_after(
    pool: &SqlitePool,
    project_id: Uuid,
    after_id: i64,
    limit: i64,
) -> Result<Vec<EventRecord>> {
    let events = sqlx::query_as::<_, EventRecord>(
        "SELECT * FROM events \
         WHERE project_id = ? AND id > ? \
         ORDER BY id ASC \
         LIMIT ?",
    )
    .bind(project_id)
    .bind(after_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list events")?;

    Ok(events)
}

/// Count all events recorded for a project.
pub async fn count_events_for_project(pool: &SqlitePool, project_id: Uuid) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM events WHERE project_id = ?")
        .bind(project_id)
        .fetch_one(pool)
        .await
        .context("failed to count events")?;

    Ok(row.0)
}
