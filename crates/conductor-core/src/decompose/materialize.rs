//! Materialize a decomposition into rows.
//!
//! Approving a plan and writing its task DAG happen in one transaction:
//! supersede any previously approved plan, approve the new one, insert all
//! task rows and dependency edges, and move the project to `ready`. If any
//! step fails the whole operation rolls back.

use anyhow::Context;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use conductor_db::Db;
use conductor_db::models::{Plan, Project, ProjectStatus, Task};
use conductor_db::queries::{plans as plan_db, projects as project_db, tasks as task_db};

use crate::error::CoreError;

use super::Decomposition;

/// Approve `plan` and materialize `decomposition` into task rows.
///
/// Idempotence at the plan level: a plan that already has tasks is a
/// conflict, so re-running approval can never duplicate tasks.
pub async fn approve_and_materialize(
    db: &Db,
    project: &Project,
    plan: &Plan,
    decomposition: &Decomposition,
    retry_max: i64,
    now: DateTime<Utc>,
) -> Result<Vec<Task>, CoreError> {
    // Guard outside the write transaction; the status check inside
    // approve_plan still protects against a racing approval.
    let existing = task_db::count_tasks_for_plan(db.read(), plan.id).await?;
    if existing > 0 {
        return Err(CoreError::conflict(format!(
            "plan {} already has {existing} materialized tasks",
            plan.id
        )));
    }

    let mut tx = db.begin().await?;

    // 1. At most one approved plan per project.
    plan_db::supersede_approved_plans(&mut *tx, project.id).await?;
    let rows = plan_db::approve_plan(&mut *tx, plan.id, now).await?;
    if rows == 0 {
        return Err(CoreError::conflict(format!(
            "plan {} is not a draft",
            plan.id
        )));
    }

    // 2. Remove leftovers from a superseded plan so the project's task
    //    list reflects exactly one decomposition.
    let dropped = task_db::cancel_idle_tasks_for_project(&mut *tx, project.id, now).await?;
    for task in &dropped {
        tracing::warn!(
            task_id = %task.id,
            task_title = %task.title,
            "cancelled task from superseded plan"
        );
    }

    // 3. Insert tasks, keeping an index -> id map for the edges.
    let mut ids: Vec<Uuid> = Vec::with_capacity(decomposition.tasks.len());
    let mut tasks: Vec<Task> = Vec::with_capacity(decomposition.tasks.len());

    for decomposed in &decomposition.tasks {
        let new = task_db::NewTask {
            id: Uuid::new_v4(),
            project_id: project.id,
            plan_id: plan.id,
            title: decomposed.title.clone(),
            description: decomposed.description.clone(),
            task_type: decomposed.task_type,
            complexity: decomposed.complexity,
            wave: decomposed.wave,
            priority: decomposed.priority,
            tools_needed: decomposed.tools_needed.clone(),
            retry_max,
            created_at: now,
        };
        let task = task_db::insert_task(&mut *tx, &new).await?;
        ids.push(task.id);
        tasks.push(task);
    }

    // 4. Insert dependency edges.
    for (idx, decomposed) in decomposition.tasks.iter().enumerate() {
        for &dep_idx in &decomposed.depends_on {
            task_db::insert_task_dep(&mut *tx, ids[idx], ids[dep_idx]).await?;
        }
    }

    // 5. Project becomes schedulable.
    if project.status != ProjectStatus::Ready {
        project_db::transition_project_status(&mut *tx, project.id, project.status, ProjectStatus::Ready)
            .await?;
    }

    tx.commit().await.context("failed to commit plan materialization")?;

    tracing::info!(
        project_id = %project.id,
        plan_id = %plan.id,
        task_count = tasks.len(),
        "plan approved and materialized"
    );

    Ok(tasks)
}
