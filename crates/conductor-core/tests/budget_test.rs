//! Integration tests for the budget manager: atomic reservation under
//! concurrency, release symmetry, recording, rollover, and the mid-loop
//! hard stop.

mod common;

use std::sync::Arc;

use chrono::{Duration, Utc};
use uuid::Uuid;

use conductor_core::budget::{BudgetManager, ReserveOutcome, SpendRecord};
use conductor_core::config::BudgetConfig;
use conductor_db::Db;
use conductor_db::queries::{projects, usage};

use common::{ManualClock, create_test_db};

/// Usage rows reference projects, so tests that record spend need one.
async fn seed_project(db: &Db) -> Uuid {
    let project = projects::insert_project(db.write(), Uuid::new_v4(), "budget", "", Utc::now())
        .await
        .expect("insert project");
    project.id
}

fn limits(daily: Option<f64>, monthly: Option<f64>, per_project: Option<f64>) -> BudgetConfig {
    BudgetConfig {
        daily_limit: daily,
        monthly_limit: monthly,
        per_project_limit: per_project,
        hard_stop_margin: 0.01,
    }
}

async fn manager(config: BudgetConfig) -> (Arc<BudgetManager>, ManualClock, tempfile::TempDir) {
    let (db, dir) = create_test_db().await;
    let clock = ManualClock::new(ManualClock::default_start());
    let budget = Arc::new(BudgetManager::new(db, Arc::new(clock.clone()), config));
    (budget, clock, dir)
}

fn spend(project_id: Uuid, cost: f64) -> SpendRecord {
    SpendRecord {
        project_id,
        task_id: None,
        provider: "cloud".to_string(),
        model: "frontier-small".to_string(),
        tokens_in: 100,
        tokens_out: 20,
        cost,
    }
}

#[tokio::test]
async fn concurrent_reserves_never_overcommit() {
    // Daily limit 1.00, 20 concurrent reserves of 0.10: exactly 10 pass.
    let (budget, _clock, _dir) = manager(limits(Some(1.0), None, None)).await;
    let project_id = Uuid::new_v4();

    let attempts: Vec<_> = (0..20)
        .map(|_| {
            let budget = Arc::clone(&budget);
            tokio::spawn(async move { budget.reserve(project_id, 0.10).await.unwrap() })
        })
        .collect();

    let mut granted = 0;
    for attempt in attempts {
        if attempt.await.unwrap().is_granted() {
            granted += 1;
        }
    }
    assert_eq!(granted, 10);

    let (daily, monthly, project) = budget.reserved_totals(project_id).await;
    assert!((daily - 1.0).abs() < 1e-9);
    assert!((monthly - 1.0).abs() < 1e-9);
    assert!((project - 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn refusal_names_the_exhausted_scope() {
    let (budget, _clock, _dir) = manager(limits(Some(0.05), None, None)).await;
    let project_id = Uuid::new_v4();

    match budget.reserve(project_id, 0.10).await.unwrap() {
        ReserveOutcome::Refused(refusal) => {
            assert_eq!(refusal.scope.as_str(), "daily");
            assert_eq!(refusal.limit, 0.05);
            assert_eq!(refusal.period_key, "2026-08-01");
        }
        ReserveOutcome::Granted => panic!("reserve should have been refused"),
    }

    // A refused reserve leaves no residue.
    let (daily, _, _) = budget.reserved_totals(project_id).await;
    assert_eq!(daily, 0.0);
}

#[tokio::test]
async fn check_answers_without_reserving() {
    let (budget, _clock, _dir) = manager(limits(Some(1.0), None, None)).await;
    let project_id = Uuid::new_v4();

    assert!(budget.check(project_id, 0.9).await.unwrap().is_granted());
    // A check holds nothing: counters are untouched.
    let (daily, monthly, project) = budget.reserved_totals(project_id).await;
    assert_eq!((daily, monthly, project), (0.0, 0.0, 0.0));

    // Checks see live reservations, and refusals carry the same detail
    // a refused reserve would.
    assert!(budget.reserve(project_id, 0.9).await.unwrap().is_granted());
    match budget.check(project_id, 0.2).await.unwrap() {
        ReserveOutcome::Refused(refusal) => {
            assert_eq!(refusal.scope.as_str(), "daily");
            assert_eq!(refusal.reserved, 0.9);
        }
        ReserveOutcome::Granted => panic!("check should have been refused"),
    }
    let (daily, _, _) = budget.reserved_totals(project_id).await;
    assert_eq!(daily, 0.9, "refused check leaves reservations as they were");
}

#[tokio::test]
async fn reserve_then_release_restores_counters() {
    let (budget, _clock, _dir) = manager(limits(Some(10.0), Some(100.0), Some(5.0))).await;
    let project_id = Uuid::new_v4();

    assert!(budget.reserve(project_id, 1.25).await.unwrap().is_granted());
    assert!(budget.reserve(project_id, 0.75).await.unwrap().is_granted());
    budget.release(project_id, 1.25).await;
    budget.release(project_id, 0.75).await;

    let (daily, monthly, project) = budget.reserved_totals(project_id).await;
    assert_eq!(daily, 0.0);
    assert_eq!(monthly, 0.0);
    assert_eq!(project, 0.0);

    // Over-release clamps rather than going negative.
    budget.release(project_id, 99.0).await;
    let (daily, _, _) = budget.reserved_totals(project_id).await;
    assert_eq!(daily, 0.0);
}

#[tokio::test]
async fn record_writes_usage_and_all_three_periods() {
    let (db, _dir) = create_test_db().await;
    let clock = ManualClock::new(ManualClock::default_start());
    let budget = BudgetManager::new(db.clone(), Arc::new(clock), limits(None, None, None));
    let project_id = seed_project(&db).await;

    budget.record_now(&spend(project_id, 0.10)).await.unwrap();
    budget.record_now(&spend(project_id, 0.05)).await.unwrap();

    let daily = usage::period_spent(db.read(), "daily", "2026-08-01").await.unwrap();
    let monthly = usage::period_spent(db.read(), "monthly", "2026-08").await.unwrap();
    let project = usage::period_spent(db.read(), "project", &project_id.to_string())
        .await
        .unwrap();
    assert!((daily - 0.15).abs() < 1e-9);
    assert!((monthly - 0.15).abs() < 1e-9);
    assert!((project - 0.15).abs() < 1e-9);
}

#[tokio::test]
async fn committed_spend_blocks_further_reserves() {
    let (db, _dir) = create_test_db().await;
    let clock = ManualClock::new(ManualClock::default_start());
    let budget = BudgetManager::new(
        db.clone(),
        Arc::new(clock),
        limits(Some(1.0), None, None),
    );
    let project_id = seed_project(&db).await;

    budget.record_now(&spend(project_id, 0.95)).await.unwrap();

    assert!(!budget.reserve(project_id, 0.10).await.unwrap().is_granted());
    assert!(budget.reserve(project_id, 0.04).await.unwrap().is_granted());
}

#[tokio::test]
async fn period_rollover_resets_reservations() {
    let (budget, clock, _dir) = manager(limits(Some(1.0), None, None)).await;
    let project_id = Uuid::new_v4();

    assert!(budget.reserve(project_id, 0.9).await.unwrap().is_granted());
    assert!(!budget.reserve(project_id, 0.9).await.unwrap().is_granted());

    // The next day opens a fresh daily window.
    clock.advance(Duration::days(1));
    assert!(budget.reserve(project_id, 0.9).await.unwrap().is_granted());
}

#[tokio::test]
async fn monthly_reservation_survives_daily_rollover() {
    let (budget, clock, _dir) = manager(limits(None, Some(1.0), None)).await;
    let project_id = Uuid::new_v4();

    assert!(budget.reserve(project_id, 0.9).await.unwrap().is_granted());
    clock.advance(Duration::days(1));
    // Still August: the monthly counter is intact.
    assert!(!budget.reserve(project_id, 0.9).await.unwrap().is_granted());

    clock.advance(Duration::days(31));
    assert!(budget.reserve(project_id, 0.9).await.unwrap().is_granted());
}

#[tokio::test]
async fn can_continue_stops_at_the_margin() {
    let (db, _dir) = create_test_db().await;
    let clock = ManualClock::new(ManualClock::default_start());
    let budget = BudgetManager::new(
        db.clone(),
        Arc::new(clock),
        limits(Some(1.0), None, None),
    );
    let project_id = seed_project(&db).await;

    assert!(budget.can_continue(project_id).await.unwrap());

    budget.record_now(&spend(project_id, 0.80)).await.unwrap();
    assert!(budget.can_continue(project_id).await.unwrap());

    // 0.995 committed leaves 0.005 <= margin 0.01.
    budget.record_now(&spend(project_id, 0.195)).await.unwrap();
    assert!(!budget.can_continue(project_id).await.unwrap());
}

#[tokio::test]
async fn unlimited_budget_always_continues() {
    let (budget, _clock, _dir) = manager(limits(None, None, None)).await;
    let project_id = Uuid::new_v4();

    assert!(budget.reserve(project_id, 1e9).await.unwrap().is_granted());
    assert!(budget.can_continue(project_id).await.unwrap());
}

#[tokio::test]
async fn status_reports_committed_and_reserved() {
    let (db, _dir) = create_test_db().await;
    let clock = ManualClock::new(ManualClock::default_start());
    let budget = BudgetManager::new(
        db.clone(),
        Arc::new(clock),
        limits(Some(2.0), Some(20.0), None),
    );
    let project_id = seed_project(&db).await;

    budget.record_now(&spend(project_id, 0.25)).await.unwrap();
    assert!(budget.reserve(project_id, 0.50).await.unwrap().is_granted());

    let status = budget.status().await.unwrap();
    assert_eq!(status.daily.period_key, "2026-08-01");
    assert!((status.daily.committed - 0.25).abs() < 1e-9);
    assert!((status.daily.reserved - 0.50).abs() < 1e-9);
    assert_eq!(status.daily.limit, Some(2.0));
    assert_eq!(status.monthly.period_key, "2026-08");
    assert_eq!(status.monthly.limit, Some(20.0));
}
