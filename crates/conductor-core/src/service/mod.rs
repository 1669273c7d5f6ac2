//! The composition root and service surface.
//!
//! [`Core::new`] wires every component exactly once -- store, event bus,
//! budget manager, resource monitor, router, runner, executor -- with no
//! globals and no import-time side effects. The methods on [`Core`] are
//! the operations the outer HTTP layer calls; each is a plain async call
//! returning `Result<T, CoreError>`.

use std::sync::Arc;

use anyhow::Context;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use conductor_db::Db;
use conductor_db::models::{
    Checkpoint, CheckpointResolution, EventRecord, Plan, Project, ProjectStatus, Task, TaskStatus,
    UsageRecord,
};
use conductor_db::queries::{
    checkpoints as checkpoint_db, events as event_db, plans as plan_db, projects as project_db,
    tasks as task_db, usage as usage_db,
};

use crate::budget::{BudgetManager, BudgetStatus, ReserveOutcome};
use crate::clock::Clock;
use crate::config::CoreConfig;
use crate::decompose::{self, materialize};
use crate::error::CoreError;
use crate::events::{Event, EventBus, EventKind, EventStream};
use crate::executor::{Executor, ExecutorHandle};
use crate::monitor::ResourceMonitor;
use crate::provider::ProviderRegistry;
use crate::router::ModelRouter;
use crate::runner::{AgentRunner, RunnerConfig};
use crate::state::dispatch;
use crate::tools::ToolRegistry;

/// A task together with its derived blocked flag.
#[derive(Debug, Clone)]
pub struct TaskOverview {
    pub task: Task,
    /// Pending with at least one dependency not yet completed.
    pub blocked: bool,
}

/// Operator-editable task fields. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<i64>,
}

/// Aggregate view returned by [`Core::project_status`].
#[derive(Debug, Clone)]
pub struct ProjectStatusView {
    pub project: Project,
    pub progress: task_db::ProjectProgress,
    pub blocked: i64,
    /// Committed spend attributed to this project.
    pub spent: f64,
}

/// Background loops started by [`Core::start`].
pub struct CoreHandle {
    executor: ExecutorHandle,
    monitor_cancel: CancellationToken,
    monitor_handle: JoinHandle<()>,
}

impl CoreHandle {
    /// Stop the monitor and the executor, draining workers.
    pub async fn stop(self) {
        self.monitor_cancel.cancel();
        let _ = self.monitor_handle.await;
        self.executor.stop().await;
    }
}

/// The execution core, fully wired.
pub struct Core {
    db: Db,
    bus: EventBus,
    budget: Arc<BudgetManager>,
    monitor: ResourceMonitor,
    executor: Executor,
    clock: Arc<dyn Clock>,
    config: CoreConfig,
}

impl Core {
    /// Wire all components. `providers` and `tools` are what the outer
    /// layer registered; the shared HTTP client for health probes is
    /// created here and closed when the core is dropped.
    pub fn new(
        db: Db,
        providers: ProviderRegistry,
        tools: ToolRegistry,
        router: ModelRouter,
        config: CoreConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let bus = EventBus::new(db.clone(), Arc::clone(&clock), config.events.clone());
        let budget = Arc::new(BudgetManager::new(
            db.clone(),
            Arc::clone(&clock),
            config.budget.clone(),
        ));
        let monitor = ResourceMonitor::new(reqwest::Client::new(), &config.monitor);
        let router = Arc::new(router);
        let runner = AgentRunner::new(
            Arc::new(providers),
            Arc::new(tools),
            bus.clone(),
            Arc::clone(&budget),
            RunnerConfig {
                max_tool_rounds: config.max_tool_rounds,
            },
        );
        let executor = Executor::new(
            db.clone(),
            bus.clone(),
            Arc::clone(&budget),
            monitor.clone(),
            router,
            runner,
            Arc::clone(&clock),
            config.clone(),
        );

        Self {
            db,
            bus,
            budget,
            monitor,
            executor,
            clock,
            config,
        }
    }

    /// Run restart recovery, then spawn the executor tick loop and the
    /// resource monitor.
    pub async fn start(&self) -> Result<CoreHandle, CoreError> {
        self.executor.recover().await?;
        let executor = self.executor.spawn();
        let monitor_cancel = CancellationToken::new();
        let monitor_handle = self.monitor.spawn(monitor_cancel.clone());
        Ok(CoreHandle {
            executor,
            monitor_cancel,
            monitor_handle,
        })
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn monitor(&self) -> &ResourceMonitor {
        &self.monitor
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    // -------------------------------------------------------------------
    // Projects
    // -------------------------------------------------------------------

    pub async fn create_project(
        &self,
        name: &str,
        description: &str,
    ) -> Result<Project, CoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(CoreError::validation("project name must not be empty"));
        }

        let project = project_db::insert_project(
            self.db.write(),
            Uuid::new_v4(),
            name,
            description,
            self.clock.now(),
        )
        .await?;

        tracing::info!(project_id = %project.id, name = %project.name, "project created");
        Ok(project)
    }

    pub async fn get_project(&self, project_id: Uuid) -> Result<Project, CoreError> {
        project_db::get_project(self.db.read(), project_id)
            .await?
            .ok_or_else(|| CoreError::not_found("project", project_id))
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>, CoreError> {
        Ok(project_db::list_projects(self.db.read()).await?)
    }

    pub async fn project_status(&self, project_id: Uuid) -> Result<ProjectStatusView, CoreError> {
        let project = self.get_project(project_id).await?;
        let progress = task_db::get_project_progress(self.db.read(), project_id).await?;
        let blocked = task_db::count_blocked_tasks(self.db.read(), project_id).await?;
        let spent =
            usage_db::period_spent(self.db.read(), "project", &project_id.to_string()).await?;
        Ok(ProjectStatusView {
            project,
            progress,
            blocked,
            spent,
        })
    }

    /// `ready -> executing`. The executor also flips this on first
    /// dispatch; the explicit call just starts work without waiting for a
    /// tick to select tasks.
    pub async fn start_project(&self, project_id: Uuid) -> Result<(), CoreError> {
        let project = self.get_project(project_id).await?;
        let rows = project_db::transition_project_status(
            self.db.write(),
            project_id,
            ProjectStatus::Ready,
            ProjectStatus::Executing,
        )
        .await?;
        if rows == 0 {
            return Err(CoreError::conflict(format!(
                "project {} cannot start from status {}",
                project_id, project.status
            )));
        }
        Ok(())
    }

    /// Stop selecting new tasks; in-flight workers continue.
    pub async fn pause_project(&self, project_id: Uuid) -> Result<(), CoreError> {
        let project = self.get_project(project_id).await?;
        for from in [ProjectStatus::Executing, ProjectStatus::Ready] {
            let rows = project_db::transition_project_status(
                self.db.write(),
                project_id,
                from,
                ProjectStatus::Paused,
            )
            .await?;
            if rows > 0 {
                return Ok(());
            }
        }
        Err(CoreError::conflict(format!(
            "project {} cannot pause from status {}",
            project_id, project.status
        )))
    }

    pub async fn resume_project(&self, project_id: Uuid) -> Result<(), CoreError> {
        let project = self.get_project(project_id).await?;
        let rows = project_db::transition_project_status(
            self.db.write(),
            project_id,
            ProjectStatus::Paused,
            ProjectStatus::Executing,
        )
        .await?;
        if rows == 0 {
            return Err(CoreError::conflict(format!(
                "project {} cannot resume from status {}",
                project_id, project.status
            )));
        }
        Ok(())
    }

    /// Cancel a project: idle tasks are cancelled in one transaction, the
    /// project goes terminal, and every in-flight worker is signalled.
    /// Workers transition their own running tasks.
    pub async fn cancel_project(&self, project_id: Uuid) -> Result<(), CoreError> {
        let project = self.get_project(project_id).await?;
        if project.status.is_terminal() {
            return Err(CoreError::conflict(format!(
                "project {} is already {}",
                project_id, project.status
            )));
        }

        let now = self.clock.now();
        let mut tx = self.db.begin().await?;
        let cancelled = task_db::cancel_idle_tasks_for_project(&mut *tx, project_id, now).await?;
        project_db::finish_project(
            &mut *tx,
            project_id,
            ProjectStatus::Cancelled,
            Some("cancelled by operator"),
            now,
        )
        .await?;
        self.bus
            .publish_in(
                &mut tx,
                Event::project(EventKind::ProjectFailed, project_id, "project cancelled")
                    .with_extra("reason", json!("cancelled"))
                    .with_extra("cancelled_tasks", json!(cancelled.len())),
            )
            .await?;
        tx.commit().await.context("failed to commit project cancel")?;

        self.executor.cancel_project_workers(project_id);

        tracing::info!(
            project_id = %project_id,
            idle_cancelled = cancelled.len(),
            "project cancelled"
        );
        Ok(())
    }

    // -------------------------------------------------------------------
    // Plans
    // -------------------------------------------------------------------

    /// Store a new draft plan version for a project.
    ///
    /// The payload must parse as plan JSON; full DAG validation happens at
    /// approval. A project in `draft` moves to `planning`.
    pub async fn submit_plan(&self, project_id: Uuid, payload: &str) -> Result<Plan, CoreError> {
        let project = self.get_project(project_id).await?;
        if !matches!(
            project.status,
            ProjectStatus::Draft | ProjectStatus::Planning | ProjectStatus::Ready
        ) {
            return Err(CoreError::conflict(format!(
                "cannot submit a plan while project {} is {}",
                project_id, project.status
            )));
        }

        let parsed = decompose::parse_plan_payload(payload)
            .map_err(|e| CoreError::validation(e.to_string()))?;

        let now = self.clock.now();
        let mut tx = self.db.begin().await?;
        let version = plan_db::next_plan_version(&mut *tx, project_id).await?;
        let plan = plan_db::insert_plan(
            &mut *tx,
            Uuid::new_v4(),
            project_id,
            version,
            &parsed.summary,
            payload,
            now,
        )
        .await?;
        if project.status == ProjectStatus::Draft {
            project_db::transition_project_status(
                &mut *tx,
                project_id,
                ProjectStatus::Draft,
                ProjectStatus::Planning,
            )
            .await?;
        }
        tx.commit().await.context("failed to commit plan submission")?;

        tracing::info!(
            project_id = %project_id,
            plan_id = %plan.id,
            version,
            "plan submitted"
        );
        Ok(plan)
    }

    pub async fn get_plan(&self, plan_id: Uuid) -> Result<Plan, CoreError> {
        plan_db::get_plan(self.db.read(), plan_id)
            .await?
            .ok_or_else(|| CoreError::not_found("plan", plan_id))
    }

    pub async fn list_plans(&self, project_id: Uuid) -> Result<Vec<Plan>, CoreError> {
        self.get_project(project_id).await?;
        Ok(plan_db::list_plans_for_project(self.db.read(), project_id).await?)
    }

    /// Approve a draft plan: validate and decompose its payload, then
    /// materialize the task DAG and move the project to `ready`, all in
    /// one transaction. Supersedes any previously approved plan.
    pub async fn approve_plan(&self, plan_id: Uuid) -> Result<Vec<Task>, CoreError> {
        let plan = self.get_plan(plan_id).await?;
        if plan.status != conductor_db::models::PlanStatus::Draft {
            return Err(CoreError::conflict(format!(
                "plan {} is {}, only drafts can be approved",
                plan_id, plan.status
            )));
        }

        let project = self.get_project(plan.project_id).await?;
        if !matches!(
            project.status,
            ProjectStatus::Draft | ProjectStatus::Planning | ProjectStatus::Ready
        ) {
            return Err(CoreError::conflict(format!(
                "cannot approve a plan while project {} is {}",
                project.id, project.status
            )));
        }

        let payload = decompose::parse_plan_payload(&plan.payload)
            .map_err(|e| CoreError::validation(e.to_string()))?;
        let decomposition =
            decompose::decompose(&payload).map_err(|e| CoreError::validation(e.to_string()))?;

        materialize::approve_and_materialize(
            &self.db,
            &project,
            &plan,
            &decomposition,
            self.config.max_retries,
            self.clock.now(),
        )
        .await
    }

    // -------------------------------------------------------------------
    // Tasks
    // -------------------------------------------------------------------

    pub async fn get_task(&self, task_id: Uuid) -> Result<Task, CoreError> {
        task_db::get_task(self.db.read(), task_id)
            .await?
            .ok_or_else(|| CoreError::not_found("task", task_id))
    }

    /// List a project's tasks with their derived blocked flag.
    pub async fn list_tasks(&self, project_id: Uuid) -> Result<Vec<TaskOverview>, CoreError> {
        self.get_project(project_id).await?;
        let tasks = task_db::list_tasks_for_project(self.db.read(), project_id).await?;
        let ready: std::collections::HashSet<Uuid> =
            task_db::get_ready_tasks(self.db.read(), project_id)
                .await?
                .into_iter()
                .map(|t| t.id)
                .collect();

        Ok(tasks
            .into_iter()
            .map(|task| {
                let blocked = task.status == TaskStatus::Pending && !ready.contains(&task.id);
                TaskOverview { task, blocked }
            })
            .collect())
    }

    /// Update operator-editable fields of a pending task.
    pub async fn update_task(&self, task_id: Uuid, update: TaskUpdate) -> Result<Task, CoreError> {
        if update.title.is_none() && update.description.is_none() && update.priority.is_none() {
            return Err(CoreError::validation("no fields to update"));
        }
        let task = self.get_task(task_id).await?;
        let rows = task_db::update_task_fields(
            self.db.write(),
            task_id,
            update.title.as_deref(),
            update.description.as_deref(),
            update.priority,
        )
        .await?;
        if rows == 0 {
            return Err(CoreError::conflict(format!(
                "task {} is {}, only pending tasks can be updated",
                task_id, task.status
            )));
        }
        self.get_task(task_id).await
    }

    /// Operator retry override for a `failed` or `needs_review` task.
    pub async fn retry_task(&self, task_id: Uuid) -> Result<Task, CoreError> {
        let task = self.get_task(task_id).await?;
        if !matches!(task.status, TaskStatus::Failed | TaskStatus::NeedsReview) {
            return Err(CoreError::conflict(format!(
                "task {} is {}, only failed or needs_review tasks can be retried",
                task_id, task.status
            )));
        }

        dispatch::override_retry(&self.db, task_id, task.status, self.clock.now()).await?;
        self.executor.clear_retry_deadline(task_id);
        self.get_task(task_id).await
    }

    // -------------------------------------------------------------------
    // Checkpoints
    // -------------------------------------------------------------------

    pub async fn get_checkpoint(&self, checkpoint_id: Uuid) -> Result<Checkpoint, CoreError> {
        checkpoint_db::get_checkpoint(self.db.read(), checkpoint_id)
            .await?
            .ok_or_else(|| CoreError::not_found("checkpoint", checkpoint_id))
    }

    pub async fn list_pending_checkpoints(
        &self,
        project_id: Uuid,
    ) -> Result<Vec<Checkpoint>, CoreError> {
        self.get_project(project_id).await?;
        Ok(checkpoint_db::list_pending_checkpoints(self.db.read(), project_id).await?)
    }

    /// Resolve a pending checkpoint.
    ///
    /// `approve` completes the task with the output already recorded for
    /// the reviewed attempt (no fresh agent call); `retry` sends it back
    /// to `pending` with a fresh attempt; `fail` makes the failure final.
    pub async fn resolve_checkpoint(
        &self,
        checkpoint_id: Uuid,
        resolution: CheckpointResolution,
    ) -> Result<Checkpoint, CoreError> {
        let checkpoint = self.get_checkpoint(checkpoint_id).await?;
        let task = self.get_task(checkpoint.task_id).await?;
        let now = self.clock.now();

        let mut tx = self.db.begin().await?;
        let rows = checkpoint_db::resolve_checkpoint(&mut *tx, checkpoint_id, resolution, now).await?;
        if rows == 0 {
            return Err(CoreError::conflict(format!(
                "checkpoint {} is already resolved",
                checkpoint_id
            )));
        }

        match resolution {
            CheckpointResolution::Approve => {
                let rows = task_db::transition_task_status(
                    &mut *tx,
                    task.id,
                    TaskStatus::NeedsReview,
                    TaskStatus::Completed,
                    None,
                    Some(now),
                )
                .await?;
                if rows == 0 {
                    return Err(CoreError::conflict(format!(
                        "task {} is {}, cannot approve",
                        task.id, task.status
                    )));
                }
                self.bus
                    .publish_in(
                        &mut tx,
                        Event::task(
                            EventKind::TaskComplete,
                            task.project_id,
                            task.id,
                            format!("task {} approved after review", task.title),
                        )
                        .with_extra("checkpoint_id", json!(checkpoint_id)),
                    )
                    .await?;
            }
            CheckpointResolution::Retry => {
                let rows = task_db::transition_task_retry(
                    &mut *tx,
                    task.id,
                    TaskStatus::NeedsReview,
                    task.attempt,
                )
                .await?;
                if rows == 0 {
                    return Err(CoreError::conflict(format!(
                        "task {} is {}, cannot retry",
                        task.id, task.status
                    )));
                }
                self.bus
                    .publish_in(
                        &mut tx,
                        Event::task(
                            EventKind::TaskRetry,
                            task.project_id,
                            task.id,
                            format!("task {} re-queued after review", task.title),
                        )
                        .with_extra("checkpoint_id", json!(checkpoint_id)),
                    )
                    .await?;
            }
            CheckpointResolution::Fail => {
                let rows = task_db::transition_task_failure(
                    &mut *tx,
                    task.id,
                    TaskStatus::NeedsReview,
                    TaskStatus::Failed,
                    "failed by checkpoint resolution",
                    now,
                )
                .await?;
                if rows == 0 {
                    return Err(CoreError::conflict(format!(
                        "task {} is {}, cannot fail",
                        task.id, task.status
                    )));
                }
                self.bus
                    .publish_in(
                        &mut tx,
                        Event::task(
                            EventKind::TaskFailed,
                            task.project_id,
                            task.id,
                            format!("task {} failed by review", task.title),
                        )
                        .with_extra("checkpoint_id", json!(checkpoint_id)),
                    )
                    .await?;
            }
        }

        tx.commit()
            .await
            .context("failed to commit checkpoint resolution")?;

        if resolution == CheckpointResolution::Retry {
            self.executor.clear_retry_deadline(task.id);
        }

        tracing::info!(
            checkpoint_id = %checkpoint_id,
            task_id = %task.id,
            resolution = %resolution,
            "checkpoint resolved"
        );
        self.get_checkpoint(checkpoint_id).await
    }

    // -------------------------------------------------------------------
    // Events and usage
    // -------------------------------------------------------------------

    /// Subscribe to a project's live event stream.
    pub async fn subscribe_events(&self, project_id: Uuid) -> Result<EventStream, CoreError> {
        self.get_project(project_id).await?;
        self.bus.subscribe(project_id)
    }

    /// Replay persisted events after `after_id`, for catch-up before
    /// attaching to the live stream.
    pub async fn list_events(
        &self,
        project_id: Uuid,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<EventRecord>, CoreError> {
        self.get_project(project_id).await?;
        Ok(event_db::list_events_after(self.db.read(), project_id, after_id, limit).await?)
    }

    pub async fn budget_status(&self) -> Result<BudgetStatus, CoreError> {
        Ok(self.budget.status().await?)
    }

    /// Pre-flight answer for "would a reservation of this size be granted
    /// right now?". Refusals surface as [`CoreError::BudgetExhausted`];
    /// nothing is reserved either way, so a granted answer can still be
    /// outrun by concurrent dispatch.
    pub async fn check_budget(
        &self,
        project_id: Uuid,
        estimated_cost: f64,
    ) -> Result<(), CoreError> {
        if !estimated_cost.is_finite() || estimated_cost < 0.0 {
            return Err(CoreError::validation(
                "estimated cost must be a non-negative number",
            ));
        }
        self.get_project(project_id).await?;

        match self.budget.check(project_id, estimated_cost).await? {
            ReserveOutcome::Granted => Ok(()),
            ReserveOutcome::Refused(refusal) => Err(CoreError::BudgetExhausted(format!(
                "{} limit {} reached for {} (committed {}, reserved {})",
                refusal.scope,
                refusal.limit,
                refusal.period_key,
                refusal.committed,
                refusal.reserved
            ))),
        }
    }

    pub async fn list_usage(&self, project_id: Uuid) -> Result<Vec<UsageRecord>, CoreError> {
        self.get_project(project_id).await?;
        Ok(usage_db::list_usage_for_project(self.db.read(), project_id).await?)
    }
}
