//! Database query functions for the `usage_records` and `budget_periods`
//! tables.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{SqliteExecutor, SqlitePool};
use uuid::Uuid;

use crate::models::{BudgetPeriod, UsageRecord};

/// Parameters for inserting a new usage record.
#[derive(Debug, Clone)]
pub struct NewUsage {
    pub id: Uuid,
    pub project_id: Uuid,
    pub task_id: Option<Uuid>,
    pub provider: String,
    pub model: String,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub cost: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Insert a new usage record. Append-only.
pub async fn insert_usage<'e>(exec: impl SqliteExecutor<'e>, new: &NewUsage) -> Result<UsageRecord> {
    let record = sqlx::query_as::<_, UsageRecord>(
        "INSERT INTO usage_records (id, project_id, task_id, provider, model, \
                                    tokens_in, tokens_out, cost, recorded_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
         RETURNING *",
    )
    .bind(new.id)
    .bind(new.project_id)
    .bind(new.task_id)
    .bind(&new.provider)
    .bind(&new.model)
    .bind(new.tokens_in)
    .bind(new.tokens_out)
    .bind(new.cost)
    .bind(new.recorded_at)
    .fetch_one(exec)
    .await
    .context("failed to insert usage record")?;

    Ok(record)
}

/// Add spend to a budget period, creating the row if absent.
#[allow(clippy::too_many_arguments)]
pub async fn upsert_budget_period<'e>(
    exec: impl SqliteExecutor<'e>,
    scope: &str,
    period_key: &str,
    cost: f64,
    tokens_in: i64,
    tokens_out: i64,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO budget_periods (scope, period_key, spent, tokens_in, tokens_out, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?) \
         ON CONFLICT (scope, period_key) DO UPDATE SET \
             spent = spent + excluded.spent, \
             tokens_in = tokens_in + excluded.tokens_in, \
             tokens_out = tokens_out + excluded.tokens_out, \
             updated_at = excluded.updated_at",
    )
    .bind(scope)
    .bind(period_key)
    .bind(cost)
    .bind(tokens_in)
    .bind(tokens_out)
    .bind(now)
    .execute(exec)
    .await
    .with_context(|| format!("failed to upsert budget period {scope}/{period_key}"))?;

    Ok(())
}

/// Committed spend for a period. Zero when the row does not exist.
pub async fn period_spent(pool: &SqlitePool, scope: &str, period_key: &str) -> Result<f64> {
    let row: (f64,) = sqlx::query_as(
        "SELECT COALESCE(SUM(spent), 0.0) FROM budget_periods \
         WHERE scope = ? AND period_key = ?",
    )
    .bind(scope)
    .bind(period_key)
    .fetch_one(pool)
    .await
    .context("failed to read period spend")?;

    Ok(row.0)
}

/// Fetch a full budget period row, if present.
pub async fn get_budget_period(
    pool: &SqlitePool,
    scope: &str,
    period_key: &str,
) -> Result<Option<BudgetPeriod>> {
    let period = sqlx::query_as::<_, BudgetPeriod>(
        "SELECT * FROM budget_periods WHERE scope = ? AND period_key = ?",
    )
    .bind(scope)
    .bind(period_key)
    .fetch_optional(pool)
    .await
    .context("failed to fetch budget period")?;

    Ok(period)
}

/// List all usage records for a project, oldest first.
pub async fn list_usage_for_project(
    pool: &SqlitePool,
    project_id: Uuid,
) -> Result<Vec<UsageRecord>> {
    let records = sqlx::query_as::<_, UsageRecord>(
        "SELECT * FROM usage_records WHERE project_id = ? ORDER BY recorded_at ASC, id ASC",
    )
    .bind(project_id)
    .fetch_all(pool)
    .await
    .context("failed to list usage for project")?;

    Ok(records)
}

/// Count usage records attributed to a task.
pub async fn count_usage_for_task(pool: &SqlitePool, task_id: Uuid) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM usage_records WHERE task_id = ?")
        .bind(task_id)
        .fetch_one(pool)
        .await
        .context("failed to count usage for task")?;

    Ok(row.0)
}
