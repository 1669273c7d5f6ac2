//! Integration tests for usage records, budget periods, events, and
//! checkpoints.

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use conductor_db::Db;
use conductor_db::models::{
    CheckpointResolution, CheckpointStatus, Complexity, Plan, Project, Task, TaskType,
};
use conductor_db::queries::{checkpoints, events, plans, projects, tasks, usage};
use conductor_test_utils::create_test_db;

async fn seed(db: &Db) -> (Project, Plan, Task) {
    let project = projects::insert_project(db.write(), Uuid::new_v4(), "usage", "", Utc::now())
        .await
        .expect("insert project");
    let plan = plans::insert_plan(db.write(), Uuid::new_v4(), project.id, 1, "plan", "{}", Utc::now())
        .await
        .expect("insert plan");
    let task = tasks::insert_task(
        db.write(),
        &tasks::NewTask {
            id: Uuid::new_v4(),
            project_id: project.id,
            plan_id: plan.id,
            title: "t".to_string(),
            description: "d".to_string(),
            task_type: TaskType::Research,
            complexity: Complexity::Simple,
            wave: 0,
            priority: 0,
            tools_needed: vec![],
            retry_max: 3,
            created_at: Utc::now(),
        },
    )
    .await
    .expect("insert task");
    (project, plan, task)
}

fn spend(project: &Project, task: &Task, cost: f64) -> usage::NewUsage {
    usage::NewUsage {
        id: Uuid::new_v4(),
        project_id: project.id,
        task_id: Some(task.id),
        provider: "cloud".to_string(),
        model: "frontier-small".to_string(),
        tokens_in: 100,
        tokens_out: 20,
        cost,
        recorded_at: Utc::now(),
    }
}

#[tokio::test]
async fn usage_append_and_list() {
    let (db, _dir) = create_test_db().await;
    let (project, _plan, task) = seed(&db).await;

    usage::insert_usage(db.write(), &spend(&project, &task, 0.01)).await.unwrap();
    usage::insert_usage(db.write(), &spend(&project, &task, 0.02)).await.unwrap();

    let records = usage::list_usage_for_project(db.read(), project.id).await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].provider, "cloud");

    assert_eq!(usage::count_usage_for_task(db.read(), task.id).await.unwrap(), 2);
    assert_eq!(usage::count_usage_for_task(db.read(), Uuid::new_v4()).await.unwrap(), 0);
}

#[tokio::test]
async fn budget_period_upsert_accumulates() {
    let (db, _dir) = create_test_db().await;

    assert_eq!(usage::period_spent(db.read(), "daily", "2026-08-01").await.unwrap(), 0.0);

    usage::upsert_budget_period(db.write(), "daily", "2026-08-01", 0.10, 100, 20, Utc::now())
        .await
        .unwrap();
    usage::upsert_budget_period(db.write(), "daily", "2026-08-01", 0.05, 50, 10, Utc::now())
        .await
        .unwrap();
    // A different key accumulates separately.
    usage::upsert_budget_period(db.write(), "daily", "2026-08-02", 1.0, 1, 1, Utc::now())
        .await
        .unwrap();

    let spent = usage::period_spent(db.read(), "daily", "2026-08-01").await.unwrap();
    assert!((spent - 0.15).abs() < 1e-9);

    let period = usage::get_budget_period(db.read(), "daily", "2026-08-01")
        .await
        .unwrap()
        .expect("period row exists");
    assert_eq!(period.tokens_in, 150);
    assert_eq!(period.tokens_out, 30);
}

#[tokio::test]
async fn events_are_ordered_and_replayable() {
    let (db, _dir) = create_test_db().await;
    let (project, _plan, task) = seed(&db).await;

    for (i, kind) in ["task_start", "tool_call", "task_complete"].iter().enumerate() {
        events::insert_event(
            db.write(),
            &events::NewEvent {
                project_id: project.id,
                task_id: Some(task.id),
                kind: kind.to_string(),
                message: format!("event {i}"),
                payload: json!({"seq": i}),
                recorded_at: Utc::now(),
            },
        )
        .await
        .unwrap();
    }

    let all = events::list_events_after(db.read(), project.id, 0, 100).await.unwrap();
    assert_eq!(all.len(), 3);
    assert!(all[0].id < all[1].id && all[1].id < all[2].id);
    assert_eq!(all[0].kind, "task_start");
    assert_eq!(all[2].payload["seq"], json!(2));

    // Replay from a cursor.
    let tail = events::list_events_after(db.read(), project.id, all[0].id, 100)
        .await
        .unwrap();
    assert_eq!(tail.len(), 2);
    assert_eq!(tail[0].kind, "tool_call");

    assert_eq!(events::count_events_for_project(db.read(), project.id).await.unwrap(), 3);
}

#[tokio::test]
async fn checkpoint_lifecycle() {
    let (db, _dir) = create_test_db().await;
    let (project, _plan, task) = seed(&db).await;

    let checkpoint = checkpoints::insert_checkpoint(
        db.write(),
        Uuid::new_v4(),
        project.id,
        task.id,
        "retries exhausted",
        Utc::now(),
    )
    .await
    .unwrap();
    assert_eq!(checkpoint.status, CheckpointStatus::Pending);
    assert!(checkpoint.resolution.is_none());

    let pending = checkpoints::list_pending_checkpoints(db.read(), project.id)
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);

    let rows = checkpoints::resolve_checkpoint(
        db.write(),
        checkpoint.id,
        CheckpointResolution::Approve,
        Utc::now(),
    )
    .await
    .unwrap();
    assert_eq!(rows, 1);

    // Double resolution is locked out.
    let rows = checkpoints::resolve_checkpoint(
        db.write(),
        checkpoint.id,
        CheckpointResolution::Fail,
        Utc::now(),
    )
    .await
    .unwrap();
    assert_eq!(rows, 0);

    let resolved = checkpoints::get_checkpoint(db.read(), checkpoint.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resolved.status, CheckpointStatus::Resolved);
    assert_eq!(resolved.resolution, Some(CheckpointResolution::Approve));
    assert!(resolved.resolved_at.is_some());

    let pending = checkpoints::list_pending_checkpoints(db.read(), project.id)
        .await
        .unwrap();
    assert!(pending.is_empty());
}
