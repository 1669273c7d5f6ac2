//! The per-task worker.
//!
//! One worker owns one task attempt: start it, run the agent, and settle
//! the outcome as exactly one state transition plus events. Workers never
//! propagate errors to the tick loop; anything that escapes the normal
//! settle paths forces the task to `failed` so the scheduler keeps its
//! footing.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use conductor_db::models::{Task, TaskStatus};
use conductor_db::queries::{checkpoints as checkpoint_db, tasks as task_db};

use crate::events::{Event, EventKind};
use crate::router::ModelChoice;
use crate::runner::{AgentOutcome, RunnerError};
use crate::state::dispatch;

use super::{ExecutorInner, context};

/// Run one task attempt to settlement.
///
/// Owns the semaphore permit for the duration of the agent call and the
/// budget reservation until settlement; both are released on every exit
/// path, including cancellation.
pub(crate) async fn run_worker(
    inner: Arc<ExecutorInner>,
    task: Task,
    choice: ModelChoice,
    estimated: f64,
    permit: OwnedSemaphorePermit,
    cancel: CancellationToken,
) {
    if let Err(e) = drive_task(&inner, &task, &choice, &cancel).await {
        tracing::error!(
            task_id = %task.id,
            task_title = %task.title,
            error = %e,
            "worker escaped settle paths, forcing task failure"
        );
        force_fail(&inner, &task, &e.to_string()).await;
    }

    // Settlement done: return the reservation, then the dispatch slot.
    inner.budget.release(task.project_id, estimated).await;
    inner
        .dispatched
        .lock()
        .expect("dispatch set lock poisoned")
        .remove(&task.id);
    inner
        .inflight
        .lock()
        .expect("inflight map lock poisoned")
        .remove(&task.id);
    drop(permit);
}

async fn drive_task(
    inner: &Arc<ExecutorInner>,
    task: &Task,
    choice: &ModelChoice,
    cancel: &CancellationToken,
) -> Result<()> {
    let db = &inner.db;
    let now = inner.clock.now();

    // QUEUED -> RUNNING. A zero-row update means the task was cancelled
    // between dispatch and start; nothing to do.
    if let Err(e) = dispatch::start_task(db, task.id, now).await {
        tracing::info!(task_id = %task.id, "task no longer queued, worker exiting: {e}");
        return Ok(());
    }

    inner
        .bus
        .publish_logged(
            Event::task(
                EventKind::TaskStart,
                task.project_id,
                task.id,
                format!("task {} started (attempt {})", task.title, task.attempt),
            )
            .with_extra("attempt", json!(task.attempt))
            .with_extra("model", json!(choice.model_id)),
        )
        .await;

    let context = match context::build_task_context(db, task, inner.config.context_budget_bytes)
        .await
    {
        Ok(context) => context,
        Err(e) => {
            tracing::warn!(task_id = %task.id, error = %e, "context build failed, using bare description");
            task.description.clone()
        }
    };

    match inner.runner.run(task, &context, choice, cancel).await {
        Ok(outcome) => settle_success(inner, task, outcome).await,
        Err(e) if e.is_cancelled() || cancel.is_cancelled() => settle_cancelled(inner, task).await,
        Err(e) if e.is_transient() && task.attempt < task.retry_max => {
            settle_retry(inner, task, &e).await
        }
        Err(e) if e.is_transient() => settle_review(inner, task, &e).await,
        Err(e) => settle_failed(inner, task, &e).await,
    }
}

/// Success: task row update and completion event in one transaction.
/// Usage rows were already written per round by the runner.
async fn settle_success(
    inner: &Arc<ExecutorInner>,
    task: &Task,
    outcome: AgentOutcome,
) -> Result<()> {
    let now = inner.clock.now();
    let mut tx = inner.db.begin().await?;

    let rows = task_db::complete_task(
        &mut *tx,
        task.id,
        &outcome.text,
        outcome.partial,
        outcome.tokens_in,
        outcome.tokens_out,
        outcome.cost,
        now,
    )
    .await?;

    if rows == 0 {
        // The task left `running` under us; nothing to settle.
        tracing::warn!(task_id = %task.id, "completion found task not running, dropping result");
        return Ok(());
    }

    inner
        .bus
        .publish_in(
            &mut tx,
            Event::task(
                EventKind::TaskComplete,
                task.project_id,
                task.id,
                format!("task {} completed", task.title),
            )
            .with_extra("partial", json!(outcome.partial))
            .with_extra("cost", json!(outcome.cost))
            .with_extra("rounds", json!(outcome.rounds)),
        )
        .await?;

    tx.commit().await.context("failed to commit task completion")?;

    tracing::info!(
        task_id = %task.id,
        task_title = %task.title,
        partial = outcome.partial,
        cost = outcome.cost,
        "task completed"
    );
    Ok(())
}

async fn settle_cancelled(inner: &Arc<ExecutorInner>, task: &Task) -> Result<()> {
    let now = inner.clock.now();
    // The task may already be terminal if cancellation raced settlement.
    if let Err(e) = dispatch::cancel_task(&inner.db, task.id, TaskStatus::Running, now).await {
        tracing::debug!(task_id = %task.id, "cancel transition skipped: {e}");
    }

    inner
        .bus
        .publish_logged(
            Event::task(
                EventKind::TaskFailed,
                task.project_id,
                task.id,
                format!("task {} cancelled", task.title),
            )
            .with_extra("reason", json!("cancelled")),
        )
        .await;

    tracing::info!(task_id = %task.id, task_title = %task.title, "task cancelled");
    Ok(())
}

async fn settle_retry(inner: &Arc<ExecutorInner>, task: &Task, error: &RunnerError) -> Result<()> {
    let now = inner.clock.now();
    let message = error.to_string();

    task_db::set_task_error(inner.db.write(), task.id, &message).await?;
    dispatch::retry_task(&inner.db, task.id, now).await?;

    let backoff = inner.backoff_after(task.attempt);
    let deadline = now + backoff;
    inner
        .retry_deadlines
        .lock()
        .expect("retry deadline lock poisoned")
        .insert(task.id, deadline);

    inner
        .bus
        .publish_logged(
            Event::task(
                EventKind::TaskRetry,
                task.project_id,
                task.id,
                format!(
                    "task {} hit a transient error, retrying (attempt {})",
                    task.title,
                    task.attempt + 1
                ),
            )
            .with_extra("error", json!(message))
            .with_extra("retry_at", json!(deadline)),
        )
        .await;

    tracing::info!(
        task_id = %task.id,
        attempt = task.attempt,
        backoff_ms = backoff.num_milliseconds(),
        "task scheduled for retry"
    );
    Ok(())
}

/// Retries exhausted: park for review and open a checkpoint, atomically.
async fn settle_review(inner: &Arc<ExecutorInner>, task: &Task, error: &RunnerError) -> Result<()> {
    let now = inner.clock.now();
    let message = error.to_string();
    let mut tx = inner.db.begin().await?;

    let rows = task_db::transition_task_failure(
        &mut *tx,
        task.id,
        TaskStatus::Running,
        TaskStatus::NeedsReview,
        &message,
        now,
    )
    .await?;
    if rows == 0 {
        tracing::warn!(task_id = %task.id, "review transition found task not running");
        return Ok(());
    }

    let reason = format!(
        "retries exhausted after {} attempts: {message}",
        task.attempt + 1
    );
    let checkpoint = checkpoint_db::insert_checkpoint(
        &mut *tx,
        Uuid::new_v4(),
        task.project_id,
        task.id,
        &reason,
        now,
    )
    .await?;

    inner
        .bus
        .publish_in(
            &mut tx,
            Event::task(
                EventKind::TaskNeedsReview,
                task.project_id,
                task.id,
                format!("task {} needs review: {message}", task.title),
            )
            .with_extra("attempts", json!(task.attempt + 1)),
        )
        .await?;
    inner
        .bus
        .publish_in(
            &mut tx,
            Event::task(
                EventKind::Checkpoint,
                task.project_id,
                task.id,
                format!("checkpoint opened for task {}", task.title),
            )
            .with_extra("checkpoint_id", json!(checkpoint.id)),
        )
        .await?;

    tx.commit().await.context("failed to commit review transition")?;

    tracing::warn!(
        task_id = %task.id,
        task_title = %task.title,
        checkpoint_id = %checkpoint.id,
        "task parked for human review"
    );
    Ok(())
}

async fn settle_failed(inner: &Arc<ExecutorInner>, task: &Task, error: &RunnerError) -> Result<()> {
    let now = inner.clock.now();
    let message = error.to_string();
    dispatch::fail_task(&inner.db, task.id, &message, now).await?;

    inner
        .bus
        .publish_logged(
            Event::task(
                EventKind::TaskFailed,
                task.project_id,
                task.id,
                format!("task {} failed: {message}", task.title),
            )
            .with_extra("error", json!(message)),
        )
        .await;

    tracing::warn!(task_id = %task.id, task_title = %task.title, error = %message, "task failed");
    Ok(())
}

/// Last resort when a settle path itself errored: walk the task into
/// `failed` from whatever status it is in so the project cannot wedge.
async fn force_fail(inner: &Arc<ExecutorInner>, task: &Task, error: &str) {
    let now = inner.clock.now();
    let db = &inner.db;

    let current = match task_db::get_task(db.read(), task.id).await {
        Ok(Some(t)) => t.status,
        _ => return,
    };

    let result = match current {
        TaskStatus::Running => dispatch::fail_task(db, task.id, error, now).await,
        TaskStatus::Queued => {
            // Force through the state chain so the machine stays consistent.
            let _ = dispatch::start_task(db, task.id, now).await;
            dispatch::fail_task(db, task.id, error, now).await
        }
        _ => Ok(()),
    };
    if let Err(e) = result {
        tracing::error!(task_id = %task.id, error = %e, "force-fail could not settle task");
        return;
    }

    if matches!(current, TaskStatus::Running | TaskStatus::Queued) {
        inner
            .bus
            .publish_logged(
                Event::task(
                    EventKind::TaskFailed,
                    task.project_id,
                    task.id,
                    format!("task {} failed: {error}", task.title),
                )
                .with_extra("error", json!(error)),
            )
            .await;
    }
}
