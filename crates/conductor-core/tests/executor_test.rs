//! End-to-end scheduler tests: ticks are driven manually so every
//! scenario is deterministic.

mod common;

use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use uuid::Uuid;

use conductor_db::models::{ProjectStatus, TaskStatus};
use conductor_db::queries::{checkpoints, events as event_db, plans, projects, tasks, usage};

use common::{MockStep, TestHarness, build_harness, plan_json, task_status, test_config, wait_until};

/// Create a project with an approved plan and return (project_id, tasks).
async fn approved_project(
    h: &TestHarness,
    tasks: &[(&str, &[usize])],
) -> (Uuid, Vec<conductor_db::models::Task>) {
    let project = h.core.create_project("demo", "end to end").await.unwrap();
    let plan = h.core.submit_plan(project.id, &plan_json(tasks)).await.unwrap();
    let materialized = h.core.approve_plan(plan.id).await.unwrap();
    (project.id, materialized)
}

/// Tick repeatedly until the condition holds. Ticking is idempotent for
/// settled state, so this also drains worker bookkeeping races.
async fn tick_until<F, Fut>(h: &TestHarness, mut check: F, what: &str)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..600 {
        h.core.executor().tick().await.unwrap();
        if check().await {
            return;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    panic!("timed out ticking until {what}");
}

async fn project_status(h: &TestHarness, project_id: Uuid) -> ProjectStatus {
    h.core.get_project(project_id).await.unwrap().status
}

#[tokio::test]
async fn single_task_happy_path() {
    let h = build_harness(test_config()).await;
    h.provider.push(MockStep::text("5"));

    let (project_id, tasks) = approved_project(&h, &[("sum", &[])]).await;
    let task_id = tasks[0].id;

    assert_eq!(project_status(&h, project_id).await, ProjectStatus::Ready);

    tick_until(
        &h,
        || {
            let db = h.db.clone();
            async move { task_status(&db, task_id).await == TaskStatus::Completed }
        },
        "task completion",
    )
    .await;
    tick_until(
        &h,
        || {
            let core = &h.core;
            async move { core.get_project(project_id).await.unwrap().status == ProjectStatus::Completed }
        },
        "project completion",
    )
    .await;

    let task = h.core.get_task(task_id).await.unwrap();
    assert_eq!(task.output.as_deref(), Some("5"));
    assert!(!task.partial);
    assert_eq!(task.tokens_in, 10);
    assert_eq!(task.tokens_out, 1);
    assert!(task.started_at.is_some() && task.completed_at.is_some());

    // Exactly one usage record, priced by the router's table.
    let records = usage::list_usage_for_project(h.db.read(), project_id).await.unwrap();
    assert_eq!(records.len(), 1);
    let expected = (10.0 * 0.8 + 1.0 * 4.0) / 1_000_000.0;
    assert!((records[0].cost - expected).abs() < 1e-12);
    assert_eq!(records[0].task_id, Some(task_id));

    // Events arrive in lifecycle order.
    let events = event_db::list_events_after(h.db.read(), project_id, 0, 100)
        .await
        .unwrap();
    let kinds: Vec<&str> = events.iter().map(|e| e.kind.as_str()).collect();
    let start = kinds.iter().position(|k| *k == "task_start").expect("task_start");
    let complete = kinds
        .iter()
        .position(|k| *k == "task_complete")
        .expect("task_complete");
    let project_done = kinds
        .iter()
        .position(|k| *k == "project_complete")
        .expect("project_complete");
    assert!(start < complete && complete < project_done);
}

#[tokio::test]
async fn dependent_task_waits_for_its_parent() {
    let h = build_harness(test_config()).await;
    h.provider.push(MockStep::Hang);

    let (project_id, tasks) = approved_project(&h, &[("a", &[]), ("b", &[0])]).await;
    let (a, b) = (tasks[0].id, tasks[1].id);
    assert_eq!(tasks[0].wave, 0);
    assert_eq!(tasks[1].wave, 1);

    h.core.executor().tick().await.unwrap();
    wait_until(
        || {
            let provider = h.provider.clone();
            async move { provider.calls() == 1 }
        },
        "worker to reach the provider",
    )
    .await;

    // While a runs, b is pending and reported blocked.
    assert_eq!(task_status(&h.db, a).await, TaskStatus::Running);
    let overview = h.core.list_tasks(project_id).await.unwrap();
    let b_view = overview.iter().find(|t| t.task.id == b).unwrap();
    assert!(b_view.blocked);
    assert_eq!(b_view.task.status, TaskStatus::Pending);

    // Let a finish; b follows and the project completes.
    h.provider.release();
    tick_until(
        &h,
        || {
            let db = h.db.clone();
            async move { task_status(&db, b).await == TaskStatus::Completed }
        },
        "task b completion",
    )
    .await;
    tick_until(
        &h,
        || {
            let core = &h.core;
            async move { core.get_project(project_id).await.unwrap().status == ProjectStatus::Completed }
        },
        "project completion",
    )
    .await;

    // b started only after a completed.
    let a_row = h.core.get_task(a).await.unwrap();
    let b_row = h.core.get_task(b).await.unwrap();
    assert!(b_row.started_at.unwrap() >= a_row.completed_at.unwrap());
}

#[tokio::test]
async fn cancel_project_stops_running_and_idle_tasks() {
    let h = build_harness(test_config()).await;
    h.provider.push(MockStep::Hang);

    let (project_id, tasks) = approved_project(&h, &[("a", &[]), ("b", &[0])]).await;
    let (a, b) = (tasks[0].id, tasks[1].id);

    h.core.executor().tick().await.unwrap();
    wait_until(
        || {
            let provider = h.provider.clone();
            async move { provider.calls() == 1 }
        },
        "worker to reach the provider",
    )
    .await;
    assert_eq!(task_status(&h.db, a).await, TaskStatus::Running);

    h.core.cancel_project(project_id).await.unwrap();

    wait_until(
        || {
            let db = h.db.clone();
            async move { task_status(&db, a).await == TaskStatus::Cancelled }
        },
        "task a cancellation",
    )
    .await;
    assert_eq!(task_status(&h.db, b).await, TaskStatus::Cancelled);
    assert_eq!(project_status(&h, project_id).await, ProjectStatus::Cancelled);

    // Reservations net to zero once the worker drains.
    wait_until(
        || {
            let core = &h.core;
            async move { core.budget_status().await.unwrap().daily.reserved == 0.0 }
        },
        "reservation release",
    )
    .await;

    // No further task_start events for the cancelled project.
    let starts_before = event_db::list_events_after(h.db.read(), project_id, 0, 100)
        .await
        .unwrap()
        .iter()
        .filter(|e| e.kind == "task_start")
        .count();
    h.core.executor().tick().await.unwrap();
    tokio::time::sleep(StdDuration::from_millis(50)).await;
    let starts_after = event_db::list_events_after(h.db.read(), project_id, 0, 100)
        .await
        .unwrap()
        .iter()
        .filter(|e| e.kind == "task_start")
        .count();
    assert_eq!(starts_before, starts_after);
}

#[tokio::test]
async fn offline_provider_defers_selection() {
    let mut config = test_config();
    config.monitor.targets = vec![conductor_core::config::ProbeTarget {
        provider_id: "cloud".to_string(),
        health_url: None,
        credential_env: None,
    }];
    let h = build_harness(config).await;

    let (_project_id, tasks) = approved_project(&h, &[("a", &[])]).await;
    let task_id = tasks[0].id;

    h.core.monitor().set_available("cloud", false);
    h.core.executor().tick().await.unwrap();
    tokio::time::sleep(StdDuration::from_millis(50)).await;
    assert_eq!(task_status(&h.db, task_id).await, TaskStatus::Pending);
    assert_eq!(h.provider.calls(), 0);

    // First tick after the resource returns picks the task up.
    h.core.monitor().set_available("cloud", true);
    tick_until(
        &h,
        || {
            let db = h.db.clone();
            async move { task_status(&db, task_id).await == TaskStatus::Completed }
        },
        "completion after resource recovery",
    )
    .await;
}

#[tokio::test]
async fn transient_failure_backs_off_then_redispatches() {
    let mut config = test_config();
    config.backoff_base_ms = 60_000;
    config.backoff_max_ms = 120_000;
    let h = build_harness(config).await;
    h.provider.push(MockStep::Transient("connection reset".to_string()));

    let (project_id, tasks) = approved_project(&h, &[("a", &[])]).await;
    let task_id = tasks[0].id;

    tick_until(
        &h,
        || {
            let db = h.db.clone();
            async move {
                let task = tasks::get_task(db.read(), task_id).await.unwrap().unwrap();
                task.status == TaskStatus::Pending && task.attempt == 1
            }
        },
        "transient retry reset",
    )
    .await;
    assert_eq!(h.provider.calls(), 1);

    // Within the backoff window the task is not re-selected.
    for _ in 0..5 {
        h.core.executor().tick().await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    assert_eq!(h.provider.calls(), 1);
    assert_eq!(task_status(&h.db, task_id).await, TaskStatus::Pending);

    // Past the deadline the next eligible tick re-dispatches and the
    // retry succeeds (empty script answers "done").
    h.clock.advance(Duration::minutes(5));
    tick_until(
        &h,
        || {
            let db = h.db.clone();
            async move { task_status(&db, task_id).await == TaskStatus::Completed }
        },
        "retry completion",
    )
    .await;
    assert_eq!(h.provider.calls(), 2);

    let events = event_db::list_events_after(h.db.read(), project_id, 0, 100)
        .await
        .unwrap();
    assert!(events.iter().any(|e| e.kind == "task_retry"));
}

#[tokio::test]
async fn permanent_failure_fails_task_and_project() {
    let h = build_harness(test_config()).await;
    h.provider.push(MockStep::Permanent("schema violation".to_string()));

    let (project_id, tasks) = approved_project(&h, &[("a", &[])]).await;
    let task_id = tasks[0].id;

    tick_until(
        &h,
        || {
            let db = h.db.clone();
            async move { task_status(&db, task_id).await == TaskStatus::Failed }
        },
        "permanent failure",
    )
    .await;

    let task = h.core.get_task(task_id).await.unwrap();
    assert!(task.error.as_deref().unwrap_or_default().contains("schema violation"));
    assert_eq!(task.attempt, 0, "permanent errors are not retried");

    tick_until(
        &h,
        || {
            let core = &h.core;
            async move { core.get_project(project_id).await.unwrap().status == ProjectStatus::Failed }
        },
        "project failure",
    )
    .await;
}

#[tokio::test]
async fn dead_project_detection_fails_unreachable_work() {
    let h = build_harness(test_config()).await;
    h.provider.push(MockStep::Permanent("no".to_string()));

    let (project_id, tasks) = approved_project(&h, &[("a", &[]), ("b", &[0])]).await;

    tick_until(
        &h,
        || {
            let db = h.db.clone();
            let a = tasks[0].id;
            async move { task_status(&db, a).await == TaskStatus::Failed }
        },
        "task a failure",
    )
    .await;

    // b is pending but can never run: the project is dead.
    tick_until(
        &h,
        || {
            let core = &h.core;
            async move { core.get_project(project_id).await.unwrap().status == ProjectStatus::Failed }
        },
        "dead project detection",
    )
    .await;

    let project = h.core.get_project(project_id).await.unwrap();
    assert_eq!(project.fail_reason.as_deref(), Some("unsatisfiable dependencies"));
    assert_eq!(task_status(&h.db, tasks[1].id).await, TaskStatus::Pending);

    let events = event_db::list_events_after(h.db.read(), project_id, 0, 100)
        .await
        .unwrap();
    assert!(events.iter().any(|e| e.kind == "project_failed"));
}

#[tokio::test]
async fn retry_exhaustion_opens_a_checkpoint() {
    let mut config = test_config();
    config.max_retries = 0;
    let h = build_harness(config).await;
    h.provider.push(MockStep::Transient("flaky".to_string()));

    let (project_id, tasks) = approved_project(&h, &[("a", &[])]).await;
    let task_id = tasks[0].id;

    tick_until(
        &h,
        || {
            let db = h.db.clone();
            async move { task_status(&db, task_id).await == TaskStatus::NeedsReview }
        },
        "needs_review",
    )
    .await;

    let pending = checkpoints::list_pending_checkpoints(h.db.read(), project_id)
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].task_id, task_id);

    let events = event_db::list_events_after(h.db.read(), project_id, 0, 100)
        .await
        .unwrap();
    assert!(events.iter().any(|e| e.kind == "task_needs_review"));
    assert!(events.iter().any(|e| e.kind == "checkpoint"));

    // The project stays executing while review is pending: needs_review
    // tasks are not terminal for liveness.
    h.core.executor().tick().await.unwrap();
    tokio::time::sleep(StdDuration::from_millis(50)).await;
    assert_eq!(project_status(&h, project_id).await, ProjectStatus::Executing);

    // Approving the checkpoint completes the task and then the project.
    h.core
        .resolve_checkpoint(pending[0].id, conductor_db::models::CheckpointResolution::Approve)
        .await
        .unwrap();
    tick_until(
        &h,
        || {
            let core = &h.core;
            async move { core.get_project(project_id).await.unwrap().status == ProjectStatus::Completed }
        },
        "project completion after approval",
    )
    .await;
}

#[tokio::test]
async fn budget_refusal_warns_once_and_frees_up_later() {
    let mut config = test_config();
    // One medium task reserves (8000 * 0.8 + 2000 * 4.0) / 1e6 = 0.0144;
    // the limit fits one reservation but not two.
    config.budget.daily_limit = Some(0.02);
    let h = build_harness(config).await;

    let (project_id, tasks) = approved_project(&h, &[("a", &[]), ("b", &[])]).await;
    let ids: Vec<Uuid> = tasks.iter().map(|t| t.id).collect();

    // With the reservation released after each completion and only
    // ~1e-5 committed per task, both eventually fit one at a time.
    tick_until(
        &h,
        || {
            let db = h.db.clone();
            let ids = ids.clone();
            async move {
                let mut completed = 0;
                for id in &ids {
                    if task_status(&db, *id).await == TaskStatus::Completed {
                        completed += 1;
                    }
                }
                completed == 2
            }
        },
        "both tasks completing under the budget",
    )
    .await;

    // Only one warning for the refused daily key, across all the ticks.
    let events = event_db::list_events_after(h.db.read(), project_id, 0, 500)
        .await
        .unwrap();
    assert_eq!(events.iter().filter(|e| e.kind == "budget_warning").count(), 1);

    assert_eq!(
        usage::list_usage_for_project(h.db.read(), project_id).await.unwrap().len(),
        2
    );
}

#[tokio::test]
async fn paused_projects_are_skipped() {
    let h = build_harness(test_config()).await;
    let (project_id, tasks) = approved_project(&h, &[("a", &[])]).await;

    h.core.pause_project(project_id).await.unwrap();
    h.core.executor().tick().await.unwrap();
    tokio::time::sleep(StdDuration::from_millis(50)).await;
    assert_eq!(task_status(&h.db, tasks[0].id).await, TaskStatus::Pending);
    assert_eq!(h.provider.calls(), 0);

    h.core.resume_project(project_id).await.unwrap();
    tick_until(
        &h,
        || {
            let db = h.db.clone();
            let id = tasks[0].id;
            async move { task_status(&db, id).await == TaskStatus::Completed }
        },
        "completion after resume",
    )
    .await;
}

#[tokio::test]
async fn restart_recovery_resets_stranded_tasks() {
    let h = build_harness(test_config()).await;

    // Seed stranded rows directly, as a crashed process would leave them.
    let project = projects::insert_project(h.db.write(), Uuid::new_v4(), "crashed", "", Utc::now())
        .await
        .unwrap();
    let plan = plans::insert_plan(h.db.write(), Uuid::new_v4(), project.id, 1, "p", "{}", Utc::now())
        .await
        .unwrap();

    let mut fresh = None;
    let mut spent = None;
    for (title, attempt) in [("fresh", 0i64), ("spent", 3i64)] {
        let task = tasks::insert_task(
            h.db.write(),
            &tasks::NewTask {
                id: Uuid::new_v4(),
                project_id: project.id,
                plan_id: plan.id,
                title: title.to_string(),
                description: "d".to_string(),
                task_type: conductor_db::models::TaskType::Research,
                complexity: conductor_db::models::Complexity::Medium,
                wave: 0,
                priority: 0,
                tools_needed: vec![],
                retry_max: 3,
                created_at: Utc::now(),
            },
        )
        .await
        .unwrap();
        tasks::transition_task_status(
            h.db.write(),
            task.id,
            TaskStatus::Pending,
            TaskStatus::Queued,
            None,
            None,
        )
        .await
        .unwrap();
        if attempt > 0 {
            tasks::transition_task_status(
                h.db.write(),
                task.id,
                TaskStatus::Queued,
                TaskStatus::Running,
                Some(Utc::now()),
                None,
            )
            .await
            .unwrap();
            sqlx::query("UPDATE tasks SET attempt = ? WHERE id = ?")
                .bind(attempt)
                .bind(task.id)
                .execute(h.db.write())
                .await
                .unwrap();
            spent = Some(task.id);
        } else {
            fresh = Some(task.id);
        }
    }

    h.core.executor().recover().await.unwrap();

    assert_eq!(task_status(&h.db, fresh.unwrap()).await, TaskStatus::Pending);
    assert_eq!(task_status(&h.db, spent.unwrap()).await, TaskStatus::NeedsReview);

    let pending = checkpoints::list_pending_checkpoints(h.db.read(), project.id)
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].task_id, spent.unwrap());
}

#[tokio::test]
async fn spawned_loop_drives_projects_and_stops_cleanly() {
    let h = build_harness(test_config()).await;
    h.provider.push(MockStep::text("42"));

    let (project_id, _tasks) = approved_project(&h, &[("answer", &[])]).await;

    let handle = h.core.executor().spawn();
    wait_until(
        || {
            let core = &h.core;
            async move {
                core.get_project(project_id).await.unwrap().status == ProjectStatus::Completed
            }
        },
        "loop-driven completion",
    )
    .await;

    handle.stop().await;
    assert_eq!(h.core.executor().inflight_count(), 0);
}
