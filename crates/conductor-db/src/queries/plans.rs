//! Database query functions for the `plans` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{SqliteExecutor, SqlitePool};
use uuid::Uuid;

use crate::models::Plan;

/// Insert a new plan row in `draft` status.
#[allow(clippy::too_many_arguments)]
pub async fn insert_plan<'e>(
    exec: impl SqliteExecutor<'e>,
    id: Uuid,
    project_id: Uuid,
    version: i64,
    summary: &str,
    payload: &str,
    now: DateTime<Utc>,
) -> Result<Plan> {
    let plan = sqlx::query_as::<_, Plan>(
        "INSERT INTO plans (id, project_id, version, summary, payload, status, created_at) \
         VALUES (?, ?, ?, ?, ?, 'draft', ?) \
         RETURNING *",
    )
    .bind(id)
    .bind(project_id)
    .bind(version)
    .bind(summary)
    .bind(payload)
    .bind(now)
    .fetch_one(exec)
    .await
    .context("failed to insert plan")?;

    Ok(plan)
}

/// Fetch a plan by its ID.
pub async fn get_plan(pool: &SqlitePool, id: Uuid) -> Result<Option<Plan>> {
    let plan = sqlx::query_as::<_, Plan>("SELECT * FROM plans WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch plan")?;

    Ok(plan)
}

/// List all plans for a project, newest version first.
pub async fn list_plans_for_project(pool: &SqlitePool, project_id: Uuid) -> Result<Vec<Plan>> {
    let plans = sqlx::query_as::<_, Plan>(
        "SELECT * FROM plans WHERE project_id = ? ORDER BY version DESC",
    )
    .bind(project_id)
    .fetch_all(pool)
    .await
    .context("failed to list plans for project")?;

    Ok(plans)
}

/// Return the currently approved plan for a project, if any.
pub async fn get_approved_plan(pool: &SqlitePool, project_id: Uuid) -> Result<Option<Plan>> {
    let plan = sqlx::query_as::<_, Plan>(
        "SELECT * FROM plans WHERE project_id = ? AND status = 'approved'",
    )
    .bind(project_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch approved plan")?;

    Ok(plan)
}

/// Next plan version for a project (1 for the first plan).
pub async fn next_plan_version<'e>(exec: impl SqliteExecutor<'e>, project_id: Uuid) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COALESCE(MAX(version), 0) + 1 FROM plans WHERE project_id = ?",
    )
    .bind(project_id)
    .fetch_one(exec)
    .await
    .context("failed to compute next plan version")?;

    Ok(row.0)
}

/// Transition a plan from `draft` to `approved`, setting `approved_at`.
///
/// Returns the number of rows affected; zero means the plan was missing or
/// not a draft.
pub async fn approve_plan<'e>(
    exec: impl SqliteExecutor<'e>,
    id: Uuid,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE plans SET status = 'approved', approved_at = ? \
         WHERE id = ? AND status = 'draft'",
    )
    .bind(now)
    .bind(id)
    .execute(exec)
    .await
    .context("failed to approve plan")?;

    Ok(result.rows_affected())
}

/// Mark every currently approved plan for a project as superseded.
///
/// Run in the same transaction as [`approve_plan`] so the invariant of at
/// most one approved plan per project holds at every commit point.
pub async fn supersede_approved_plans<'e>(
    exec: impl SqliteExecutor<'e>,
    project_id: Uuid,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE plans SET status = 'superseded' \
         WHERE project_id = ? AND status = 'approved'",
    )
    .bind(project_id)
    .execute(exec)
    .await
    .context("failed to supersede approved plans")?;

    Ok(result.rows_affected())
}
