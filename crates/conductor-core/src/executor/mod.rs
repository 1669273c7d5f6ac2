//! Wave-based scheduler: drives every approved project from ready to a
//! terminal state while honoring concurrency, budget, dependencies,
//! resource availability, and cancellation.
//!
//! A single long-lived driver ticks on an interval. Each tick loads the
//! active projects, runs liveness and terminal checks, selects ready
//! tasks, and launches one worker per selected task. Workers settle their
//! own task; the tick loop never blocks on them.
//!
//! The in-memory dispatch state (`dispatched`, `inflight`,
//! `retry_deadlines`) is authoritative for run-time decisions but never
//! outlives the process; [`Executor::recover`] rebuilds a consistent
//! picture from the store on startup.

pub mod context;
mod worker;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use conductor_db::Db;
use conductor_db::models::{Project, ProjectStatus, Task};
use conductor_db::queries::{checkpoints as checkpoint_db, projects as project_db, tasks as task_db};

use crate::budget::{BudgetManager, BudgetRefusal, ReserveOutcome};
use crate::clock::Clock;
use crate::config::CoreConfig;
use crate::events::{Event, EventBus, EventKind};
use crate::monitor::ResourceMonitor;
use crate::router::ModelRouter;
use crate::runner::AgentRunner;
use crate::state::dispatch;

/// A worker tracked in the in-flight map.
///
/// The entry is inserted before the worker task is spawned so the map can
/// never miss a live worker; `abort` is filled in right after the spawn
/// and stays `None` if the worker already finished and removed itself.
pub(crate) struct InflightWorker {
    pub(crate) project_id: Uuid,
    pub(crate) cancel: CancellationToken,
    pub(crate) abort: Option<AbortHandle>,
}

pub(crate) struct ExecutorInner {
    pub(crate) db: Db,
    pub(crate) bus: EventBus,
    pub(crate) budget: Arc<BudgetManager>,
    pub(crate) monitor: ResourceMonitor,
    pub(crate) router: Arc<ModelRouter>,
    pub(crate) runner: AgentRunner,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: CoreConfig,
    pub(crate) semaphore: Arc<Semaphore>,
    pub(crate) dispatched: Mutex<HashSet<Uuid>>,
    pub(crate) inflight: Mutex<HashMap<Uuid, InflightWorker>>,
    pub(crate) retry_deadlines: Mutex<HashMap<Uuid, DateTime<Utc>>>,
    pub(crate) warned_budget_keys: Mutex<HashSet<String>>,
}

impl ExecutorInner {
    /// Backoff before re-dispatching after the given attempt:
    /// `base * 2^attempt` plus jitter, bounded by `backoff_max_ms`.
    pub(crate) fn backoff_after(&self, attempt: i64) -> Duration {
        let base = self.config.backoff_base_ms;
        let exponent = attempt.clamp(0, 16) as u32;
        let exp = base.saturating_mul(1u64 << exponent);
        let bounded = exp.min(self.config.backoff_max_ms);
        let jitter = if bounded > 0 {
            rand::rng().random_range(0..=bounded / 4)
        } else {
            0
        };
        let total = (bounded + jitter).min(self.config.backoff_max_ms);
        Duration::milliseconds(total as i64)
    }
}

/// Handle to a running executor loop.
pub struct ExecutorHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    executor: Executor,
}

impl ExecutorHandle {
    /// Stop ticking, signal every in-flight worker, and wait a bounded
    /// grace period before aborting stragglers.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
        self.executor.shutdown_workers().await;
    }
}

/// The scheduler.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<ExecutorInner>,
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Db,
        bus: EventBus,
        budget: Arc<BudgetManager>,
        monitor: ResourceMonitor,
        router: Arc<ModelRouter>,
        runner: AgentRunner,
        clock: Arc<dyn Clock>,
        config: CoreConfig,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_tasks));
        Self {
            inner: Arc::new(ExecutorInner {
                db,
                bus,
                budget,
                monitor,
                router,
                runner,
                clock,
                config,
                semaphore,
                dispatched: Mutex::new(HashSet::new()),
                inflight: Mutex::new(HashMap::new()),
                retry_deadlines: Mutex::new(HashMap::new()),
                warned_budget_keys: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Restart recovery: tasks stranded in `queued`/`running` by a
    /// previous process go back to `pending` when attempts remain, or to
    /// `needs_review` with a checkpoint when they are spent.
    pub async fn recover(&self) -> Result<()> {
        let stranded = task_db::list_stranded_tasks(self.inner.db.read()).await?;
        for task in &stranded {
            tracing::warn!(
                task_id = %task.id,
                task_title = %task.title,
                status = %task.status,
                "resetting task stranded by restart"
            );

            if task.attempt < task.retry_max {
                task_db::recover_task_to_pending(self.inner.db.write(), task.id).await?;
                continue;
            }

            let now = self.inner.clock.now();
            let reason = "interrupted by restart with no retries left";
            let mut tx = self.inner.db.begin().await?;
            let rows = task_db::recover_task_to_review(&mut *tx, task.id, reason, now).await?;
            if rows > 0 {
                let checkpoint = checkpoint_db::insert_checkpoint(
                    &mut *tx,
                    Uuid::new_v4(),
                    task.project_id,
                    task.id,
                    reason,
                    now,
                )
                .await?;
                self.inner
                    .bus
                    .publish_in(
                        &mut tx,
                        Event::task(
                            EventKind::TaskNeedsReview,
                            task.project_id,
                            task.id,
                            format!("task {} needs review: {reason}", task.title),
                        )
                        .with_extra("checkpoint_id", json!(checkpoint.id)),
                    )
                    .await?;
            }
            tx.commit().await?;
        }
        Ok(())
    }

    /// Spawn the tick loop. Runs until the handle is stopped.
    pub fn spawn(&self) -> ExecutorHandle {
        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let executor = self.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(executor.inner.config.tick_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = executor.tick().await {
                            tracing::error!(error = %e, "executor tick failed");
                        }
                    }
                    _ = loop_cancel.cancelled() => break,
                }
            }
        });

        ExecutorHandle {
            cancel,
            handle,
            executor: self.clone(),
        }
    }

    /// One scheduling pass over every active project.
    ///
    /// Public so tests (and embedding callers) can drive the scheduler
    /// deterministically without the interval loop.
    pub async fn tick(&self) -> Result<()> {
        let projects = project_db::list_active_projects(self.inner.db.read()).await?;
        for project in projects {
            if project.status == ProjectStatus::Paused {
                continue;
            }
            if let Err(e) = self.tick_project(&project).await {
                tracing::error!(
                    project_id = %project.id,
                    error = %e,
                    "scheduling pass failed for project"
                );
            }
        }
        Ok(())
    }

    async fn tick_project(&self, project: &Project) -> Result<()> {
        let inner = &self.inner;
        let progress = task_db::get_project_progress(inner.db.read(), project.id).await?;
        if progress.total == 0 {
            return Ok(());
        }

        let ready = task_db::get_ready_tasks(inner.db.read(), project.id).await?;
        let now = inner.clock.now();

        // Dead-project detection: nothing runnable or awaiting review, yet
        // pending tasks remain -- their dependencies can never complete.
        if progress.queued == 0
            && progress.running == 0
            && progress.needs_review == 0
            && progress.pending > 0
            && ready.is_empty()
            && !self.has_inflight_for(project.id)
        {
            let reason = "unsatisfiable dependencies";
            project_db::finish_project(
                inner.db.write(),
                project.id,
                ProjectStatus::Failed,
                Some(reason),
                now,
            )
            .await?;
            inner
                .bus
                .publish_logged(
                    Event::project(
                        EventKind::ProjectFailed,
                        project.id,
                        format!("project failed: {reason}"),
                    )
                    .with_extra("blocked_tasks", json!(progress.pending)),
                )
                .await;
            tracing::warn!(project_id = %project.id, "dead project detected, failing");
            return Ok(());
        }

        // Terminal check: every task settled and no worker still holds one.
        if progress.runnable() == 0
            && progress.needs_review == 0
            && !self.has_inflight_for(project.id)
        {
            return self.finish_project(project, &progress).await;
        }

        self.dispatch_ready(project, ready, now).await
    }

    async fn finish_project(
        &self,
        project: &Project,
        progress: &task_db::ProjectProgress,
    ) -> Result<()> {
        let inner = &self.inner;
        let now = inner.clock.now();

        if progress.failed > 0 {
            project_db::finish_project(
                inner.db.write(),
                project.id,
                ProjectStatus::Failed,
                Some("one or more tasks failed"),
                now,
            )
            .await?;
            inner
                .bus
                .publish_logged(
                    Event::project(
                        EventKind::ProjectFailed,
                        project.id,
                        format!("project failed: {} task(s) failed", progress.failed),
                    )
                    .with_extra("failed_tasks", json!(progress.failed)),
                )
                .await;
            tracing::warn!(project_id = %project.id, failed = progress.failed, "project failed");
        } else {
            project_db::finish_project(inner.db.write(), project.id, ProjectStatus::Completed, None, now)
                .await?;
            inner
                .bus
                .publish_logged(Event::project(
                    EventKind::ProjectComplete,
                    project.id,
                    format!("project completed: {} task(s)", progress.completed),
                ))
                .await;
            tracing::info!(project_id = %project.id, "project completed");
        }
        Ok(())
    }

    async fn dispatch_ready(
        &self,
        project: &Project,
        ready: Vec<Task>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let inner = &self.inner;
        let mut project_status = project.status;

        for task in ready {
            if self.is_dispatched(task.id) {
                continue;
            }
            if let Some(deadline) = self.retry_deadline(task.id) {
                if now < deadline {
                    continue;
                }
            }

            let choice = inner.router.route(task.task_type, task.complexity).clone();
            if !inner.monitor.is_available(&choice.provider_id) {
                tracing::debug!(
                    task_id = %task.id,
                    provider = %choice.provider_id,
                    "provider offline, skipping task this tick"
                );
                continue;
            }

            // Concurrency gate: no permit, no more dispatching this tick.
            let Ok(permit) = inner.semaphore.clone().try_acquire_owned() else {
                break;
            };

            let estimated = inner.router.estimated_cost(task.task_type, task.complexity);
            match inner.budget.reserve(project.id, estimated).await? {
                ReserveOutcome::Granted => {}
                ReserveOutcome::Refused(refusal) => {
                    drop(permit);
                    self.warn_budget_once(project.id, &refusal).await;
                    break;
                }
            }

            if let Err(e) = dispatch::queue_task(&inner.db, task.id, now).await {
                tracing::warn!(task_id = %task.id, error = %e, "failed to queue task, skipping");
                inner.budget.release(project.id, estimated).await;
                drop(permit);
                continue;
            }

            if project_status == ProjectStatus::Ready {
                project_db::transition_project_status(
                    inner.db.write(),
                    project.id,
                    ProjectStatus::Ready,
                    ProjectStatus::Executing,
                )
                .await?;
                project_status = ProjectStatus::Executing;
            }

            self.inner
                .retry_deadlines
                .lock()
                .expect("retry deadline lock poisoned")
                .remove(&task.id);
            inner
                .dispatched
                .lock()
                .expect("dispatch set lock poisoned")
                .insert(task.id);

            let cancel = CancellationToken::new();
            inner
                .inflight
                .lock()
                .expect("inflight map lock poisoned")
                .insert(
                    task.id,
                    InflightWorker {
                        project_id: project.id,
                        cancel: cancel.clone(),
                        abort: None,
                    },
                );
            let handle = tokio::spawn(worker::run_worker(
                Arc::clone(inner),
                task.clone(),
                choice,
                estimated,
                permit,
                cancel,
            ));
            if let Some(entry) = inner
                .inflight
                .lock()
                .expect("inflight map lock poisoned")
                .get_mut(&task.id)
            {
                entry.abort = Some(handle.abort_handle());
            }
        }

        Ok(())
    }

    /// Publish `budget_warning` once per refused period key.
    async fn warn_budget_once(&self, project_id: Uuid, refusal: &BudgetRefusal) {
        let key = format!("{}:{}", refusal.scope, refusal.period_key);
        let fresh = self
            .inner
            .warned_budget_keys
            .lock()
            .expect("budget warning lock poisoned")
            .insert(key.clone());
        if !fresh {
            return;
        }

        self.inner
            .bus
            .publish_logged(
                Event::project(
                    EventKind::BudgetWarning,
                    project_id,
                    format!(
                        "budget reservation refused: {} limit {} reached",
                        refusal.scope, refusal.limit
                    ),
                )
                .with_extra("scope", json!(refusal.scope.as_str()))
                .with_extra("period_key", json!(refusal.period_key))
                .with_extra("committed", json!(refusal.committed))
                .with_extra("reserved", json!(refusal.reserved))
                .with_extra("limit", json!(refusal.limit)),
            )
            .await;
        tracing::warn!(
            scope = refusal.scope.as_str(),
            period_key = %refusal.period_key,
            "budget reservation refused, scheduling stopped"
        );
    }

    /// Signal every in-flight worker belonging to a project.
    pub fn cancel_project_workers(&self, project_id: Uuid) {
        let inflight = self.inner.inflight.lock().expect("inflight map lock poisoned");
        for worker in inflight.values() {
            if worker.project_id == project_id {
                worker.cancel.cancel();
            }
        }
    }

    /// Forget a task's retry deadline (operator retry override).
    pub fn clear_retry_deadline(&self, task_id: Uuid) {
        self.inner
            .retry_deadlines
            .lock()
            .expect("retry deadline lock poisoned")
            .remove(&task_id);
    }

    /// Number of workers currently in flight.
    pub fn inflight_count(&self) -> usize {
        self.inner.inflight.lock().expect("inflight map lock poisoned").len()
    }

    /// Signal all workers, wait out the grace period, abort stragglers.
    pub async fn shutdown_workers(&self) {
        {
            let inflight = self.inner.inflight.lock().expect("inflight map lock poisoned");
            for worker in inflight.values() {
                worker.cancel.cancel();
            }
        }

        let deadline = tokio::time::Instant::now() + self.inner.config.shutdown_grace();
        while self.inflight_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(StdDuration::from_millis(25)).await;
        }

        let leftovers: Vec<(Uuid, InflightWorker)> = {
            let mut inflight = self.inner.inflight.lock().expect("inflight map lock poisoned");
            inflight.drain().collect()
        };
        if !leftovers.is_empty() {
            tracing::warn!(
                remaining = leftovers.len(),
                "shutdown grace expired, aborting workers"
            );
            for (task_id, worker) in leftovers {
                if let Some(abort) = worker.abort {
                    abort.abort();
                }
                self.inner
                    .dispatched
                    .lock()
                    .expect("dispatch set lock poisoned")
                    .remove(&task_id);
            }
        }
    }

    fn is_dispatched(&self, task_id: Uuid) -> bool {
        self.inner
            .dispatched
            .lock()
            .expect("dispatch set lock poisoned")
            .contains(&task_id)
    }

    fn retry_deadline(&self, task_id: Uuid) -> Option<DateTime<Utc>> {
        self.inner
            .retry_deadlines
            .lock()
            .expect("retry deadline lock poisoned")
            .get(&task_id)
            .copied()
    }

    fn has_inflight_for(&self, project_id: Uuid) -> bool {
        self.inner
            .inflight
            .lock()
            .expect("inflight map lock poisoned")
            .values()
            .any(|w| w.project_id == project_id)
    }
}
