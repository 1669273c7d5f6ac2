//! Cost reservation and recording.
//!
//! The manager holds in-memory reservation counters for the current daily
//! and monthly periods plus a per-project map, all behind one async mutex
//! so a reserve is an atomic check-and-increment against
//! `committed + reserved + estimated`. Committed spend is always read from
//! the store, never cached; reservations are process-local and are lost on
//! restart by design.
//!
//! A task reserved just before midnight that records just after midnight
//! briefly double-counts in the old day's reservation counter. The counter
//! zeroes at the next period-key check, so the drift is bounded to one
//! reserve/release cycle.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::{Sqlite, Transaction};
use tokio::sync::Mutex;
use uuid::Uuid;

use conductor_db::Db;
use conductor_db::models::UsageRecord;
use conductor_db::queries::usage as usage_db;

use crate::clock::{Clock, daily_key, monthly_key};
use crate::config::BudgetConfig;

/// The three budget scopes, in check order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetScope {
    Daily,
    Monthly,
    Project,
}

impl BudgetScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Monthly => "monthly",
            Self::Project => "project",
        }
    }
}

impl fmt::Display for BudgetScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a reservation was refused.
#[derive(Debug, Clone)]
pub struct BudgetRefusal {
    pub scope: BudgetScope,
    pub period_key: String,
    pub committed: f64,
    pub reserved: f64,
    pub limit: f64,
}

/// Outcome of [`BudgetManager::reserve`].
#[derive(Debug, Clone)]
pub enum ReserveOutcome {
    Granted,
    Refused(BudgetRefusal),
}

impl ReserveOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted)
    }
}

/// One billable call to record.
#[derive(Debug, Clone)]
pub struct SpendRecord {
    pub project_id: Uuid,
    pub task_id: Option<Uuid>,
    pub provider: String,
    pub model: String,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub cost: f64,
}

/// Point-in-time view of one scope for reporting.
#[derive(Debug, Clone)]
pub struct ScopeStatus {
    pub period_key: String,
    pub committed: f64,
    pub reserved: f64,
    pub limit: Option<f64>,
}

/// Aggregate budget view for `budget_status`.
#[derive(Debug, Clone)]
pub struct BudgetStatus {
    pub daily: ScopeStatus,
    pub monthly: ScopeStatus,
}

#[derive(Debug, Default)]
struct ReservationState {
    daily_key: String,
    monthly_key: String,
    reserved_daily: f64,
    reserved_monthly: f64,
    reserved_project: HashMap<Uuid, f64>,
}

impl ReservationState {
    /// Zero counters whose period key has rolled over.
    fn roll(&mut self, daily: &str, monthly: &str) {
        if self.daily_key != daily {
            self.daily_key = daily.to_owned();
            self.reserved_daily = 0.0;
        }
        if self.monthly_key != monthly {
            self.monthly_key = monthly.to_owned();
            self.reserved_monthly = 0.0;
        }
    }
}

/// Pre-flight cost reservation, post-flight recording, release on failure.
pub struct BudgetManager {
    db: Db,
    clock: Arc<dyn Clock>,
    config: BudgetConfig,
    state: Mutex<ReservationState>,
}

impl BudgetManager {
    pub fn new(db: Db, clock: Arc<dyn Clock>, config: BudgetConfig) -> Self {
        Self {
            db,
            clock,
            config,
            state: Mutex::new(ReservationState::default()),
        }
    }

    /// Atomically check all three scopes and reserve `estimated` against
    /// them, or refuse without changing anything.
    ///
    /// The mutex is held across the committed-spend reads and the counter
    /// updates, so concurrent reserves serialize and can never jointly
    /// overcommit.
    pub async fn reserve(&self, project_id: Uuid, estimated: f64) -> Result<ReserveOutcome> {
        let mut state = self.state.lock().await;

        let now = self.clock.now();
        state.roll(&daily_key(now), &monthly_key(now));

        if let Some(refusal) = self.find_refusal(&state, project_id, estimated).await? {
            return Ok(ReserveOutcome::Refused(refusal));
        }

        state.reserved_daily += estimated;
        state.reserved_monthly += estimated;
        *state.reserved_project.entry(project_id).or_insert(0.0) += estimated;

        Ok(ReserveOutcome::Granted)
    }

    /// Read-only variant of [`Self::reserve`]: same limit checks against
    /// committed plus reserved spend, no counter changes. Answers the
    /// service surface's pre-flight question; the dispatch path uses
    /// [`Self::reserve`] so its answer stays binding.
    pub async fn check(&self, project_id: Uuid, estimated: f64) -> Result<ReserveOutcome> {
        let mut state = self.state.lock().await;

        let now = self.clock.now();
        state.roll(&daily_key(now), &monthly_key(now));

        match self.find_refusal(&state, project_id, estimated).await? {
            Some(refusal) => Ok(ReserveOutcome::Refused(refusal)),
            None => Ok(ReserveOutcome::Granted),
        }
    }

    /// The first scope that cannot absorb `estimated`, in check order:
    /// daily, monthly, per-project.
    async fn find_refusal(
        &self,
        state: &ReservationState,
        project_id: Uuid,
        estimated: f64,
    ) -> Result<Option<BudgetRefusal>> {
        if let Some(limit) = self.config.daily_limit {
            let key = state.daily_key.clone();
            let committed = usage_db::period_spent(self.db.read(), "daily", &key).await?;
            if committed + state.reserved_daily + estimated > limit {
                return Ok(Some(BudgetRefusal {
                    scope: BudgetScope::Daily,
                    period_key: key,
                    committed,
                    reserved: state.reserved_daily,
                    limit,
                }));
            }
        }

        if let Some(limit) = self.config.monthly_limit {
            let key = state.monthly_key.clone();
            let committed = usage_db::period_spent(self.db.read(), "monthly", &key).await?;
            if committed + state.reserved_monthly + estimated > limit {
                return Ok(Some(BudgetRefusal {
                    scope: BudgetScope::Monthly,
                    period_key: key,
                    committed,
                    reserved: state.reserved_monthly,
                    limit,
                }));
            }
        }

        if let Some(limit) = self.config.per_project_limit {
            let key = project_id.to_string();
            let committed = usage_db::period_spent(self.db.read(), "project", &key).await?;
            let reserved = state.reserved_project.get(&project_id).copied().unwrap_or(0.0);
            if committed + reserved + estimated > limit {
                return Ok(Some(BudgetRefusal {
                    scope: BudgetScope::Project,
                    period_key: key,
                    committed,
                    reserved,
                    limit,
                }));
            }
        }

        Ok(None)
    }

    /// Return a reservation. Called on failure, cancellation, and after
    /// the actual cost has been recorded. Counters clamp at zero.
    pub async fn release(&self, project_id: Uuid, estimated: f64) {
        let mut state = self.state.lock().await;

        let now = self.clock.now();
        let dkey = daily_key(now);
        let mkey = monthly_key(now);
        state.roll(&dkey, &mkey);

        state.reserved_daily = (state.reserved_daily - estimated).max(0.0);
        state.reserved_monthly = (state.reserved_monthly - estimated).max(0.0);
        if let Some(reserved) = state.reserved_project.get_mut(&project_id) {
            *reserved = (*reserved - estimated).max(0.0);
            if *reserved == 0.0 {
                state.reserved_project.remove(&project_id);
            }
        }
    }

    /// Record one billable call inside the caller's transaction: append
    /// the usage row and upsert the daily, monthly, and project periods.
    pub async fn record(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        spend: &SpendRecord,
    ) -> Result<UsageRecord> {
        let now = self.clock.now();
        let record = usage_db::insert_usage(
            &mut **tx,
            &usage_db::NewUsage {
                id: Uuid::new_v4(),
                project_id: spend.project_id,
                task_id: spend.task_id,
                provider: spend.provider.clone(),
                model: spend.model.clone(),
                tokens_in: spend.tokens_in,
                tokens_out: spend.tokens_out,
                cost: spend.cost,
                recorded_at: now,
            },
        )
        .await?;

        for (scope, key) in [
            ("daily", daily_key(now)),
            ("monthly", monthly_key(now)),
            ("project", spend.project_id.to_string()),
        ] {
            usage_db::upsert_budget_period(
                &mut **tx,
                scope,
                &key,
                spend.cost,
                spend.tokens_in,
                spend.tokens_out,
                now,
            )
            .await?;
        }

        Ok(record)
    }

    /// Record one billable call in its own transaction. Used by the tool
    /// loop between rounds.
    pub async fn record_now(&self, spend: &SpendRecord) -> Result<UsageRecord> {
        let mut tx = self.db.begin().await?;
        let record = self.record(&mut tx, spend).await?;
        tx.commit().await.context("failed to commit usage record")?;
        Ok(record)
    }

    /// Mid-loop hard stop: false once the remaining headroom in any
    /// limited scope falls to the configured margin. Compares committed
    /// spend only; the caller's own reservation does not count against it.
    pub async fn can_continue(&self, project_id: Uuid) -> Result<bool> {
        let now = self.clock.now();

        if let Some(limit) = self.config.daily_limit {
            let committed = usage_db::period_spent(self.db.read(), "daily", &daily_key(now)).await?;
            if limit - committed <= self.config.hard_stop_margin {
                return Ok(false);
            }
        }
        if let Some(limit) = self.config.monthly_limit {
            let committed =
                usage_db::period_spent(self.db.read(), "monthly", &monthly_key(now)).await?;
            if limit - committed <= self.config.hard_stop_margin {
                return Ok(false);
            }
        }
        if let Some(limit) = self.config.per_project_limit {
            let committed =
                usage_db::period_spent(self.db.read(), "project", &project_id.to_string()).await?;
            if limit - committed <= self.config.hard_stop_margin {
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Reporting view for `budget_status`.
    pub async fn status(&self) -> Result<BudgetStatus> {
        let now = self.clock.now();
        let dkey = daily_key(now);
        let mkey = monthly_key(now);

        let committed_daily = usage_db::period_spent(self.db.read(), "daily", &dkey).await?;
        let committed_monthly = usage_db::period_spent(self.db.read(), "monthly", &mkey).await?;

        let mut state = self.state.lock().await;
        state.roll(&dkey, &mkey);

        Ok(BudgetStatus {
            daily: ScopeStatus {
                period_key: dkey,
                committed: committed_daily,
                reserved: state.reserved_daily,
                limit: self.config.daily_limit,
            },
            monthly: ScopeStatus {
                period_key: mkey,
                committed: committed_monthly,
                reserved: state.reserved_monthly,
                limit: self.config.monthly_limit,
            },
        })
    }

    /// Current reservation totals `(daily, monthly, project)`.
    pub async fn reserved_totals(&self, project_id: Uuid) -> (f64, f64, f64) {
        let state = self.state.lock().await;
        (
            state.reserved_daily,
            state.reserved_monthly,
            state.reserved_project.get(&project_id).copied().unwrap_or(0.0),
        )
    }
}
