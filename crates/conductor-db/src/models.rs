use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Draft,
    Planning,
    Ready,
    Executing,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ProjectStatus {
    /// Whether the project can make no further progress.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Draft => "draft",
            Self::Planning => "planning",
            Self::Ready => "ready",
            Self::Executing => "executing",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for ProjectStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "planning" => Ok(Self::Planning),
            "ready" => Ok(Self::Ready),
            "executing" => Ok(Self::Executing),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(StatusParseError::new("project status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Status of a plan. At most one plan per project is `approved` at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Draft,
    Approved,
    Superseded,
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Draft => "draft",
            Self::Approved => "approved",
            Self::Superseded => "superseded",
        };
        f.write_str(s)
    }
}

impl FromStr for PlanStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "approved" => Ok(Self::Approved),
            "superseded" => Ok(Self::Superseded),
            other => Err(StatusParseError::new("plan status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Status of a task.
///
/// `blocked` is deliberately absent: a pending task with unmet dependencies
/// is *reported* as blocked but *stored* as `pending` so the scheduler's
/// ready query stays a single predicate over stored state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Completed,
    NeedsReview,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Whether the task will never run again without operator action.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::NeedsReview => "needs_review",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "needs_review" => Ok(Self::NeedsReview),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(StatusParseError::new("task status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Kind of work a task represents -- one input to model routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Code,
    Research,
    Analysis,
    Asset,
    Integration,
    Documentation,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Code => "code",
            Self::Research => "research",
            Self::Analysis => "analysis",
            Self::Asset => "asset",
            Self::Integration => "integration",
            Self::Documentation => "documentation",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskType {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "code" => Ok(Self::Code),
            "research" => Ok(Self::Research),
            "analysis" => Ok(Self::Analysis),
            "asset" => Ok(Self::Asset),
            "integration" => Ok(Self::Integration),
            "documentation" => Ok(Self::Documentation),
            other => Err(StatusParseError::new("task type", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Estimated difficulty of a task -- the other input to model routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Medium,
    Complex,
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Simple => "simple",
            Self::Medium => "medium",
            Self::Complex => "complex",
        };
        f.write_str(s)
    }
}

impl FromStr for Complexity {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "simple" => Ok(Self::Simple),
            "medium" => Ok(Self::Medium),
            "complex" => Ok(Self::Complex),
            other => Err(StatusParseError::new("complexity", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Status of a human-review checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Pending,
    Resolved,
}

impl fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Resolved => "resolved",
        };
        f.write_str(s)
    }
}

impl FromStr for CheckpointStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "resolved" => Ok(Self::Resolved),
            other => Err(StatusParseError::new("checkpoint status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Operator decision attached to a resolved checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CheckpointResolution {
    Approve,
    Retry,
    Fail,
}

impl fmt::Display for CheckpointResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Approve => "approve",
            Self::Retry => "retry",
            Self::Fail => "fail",
        };
        f.write_str(s)
    }
}

impl FromStr for CheckpointResolution {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(Self::Approve),
            "retry" => Ok(Self::Retry),
            "fail" => Ok(Self::Fail),
            other => Err(StatusParseError::new("checkpoint resolution", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Error returned when parsing an invalid enum string.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid {kind}: {value:?}")]
pub struct StatusParseError {
    kind: &'static str,
    value: String,
}

impl StatusParseError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A project -- the top-level container for plans and tasks.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub status: ProjectStatus,
    pub fail_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One decomposition attempt for a project. Immutable once non-draft.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Plan {
    pub id: Uuid,
    pub project_id: Uuid,
    pub version: i64,
    pub summary: String,
    /// The raw plan JSON as submitted by the planning layer.
    pub payload: String,
    pub status: PlanStatus,
    pub created_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
}

/// A task -- a unit of work within an approved plan.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub project_id: Uuid,
    pub plan_id: Uuid,
    pub title: String,
    pub description: String,
    pub task_type: TaskType,
    pub complexity: Complexity,
    /// Longest-dependency-chain depth; tasks of equal wave are independent.
    pub wave: i64,
    pub priority: i64,
    pub status: TaskStatus,
    pub tools_needed: Json<Vec<String>>,
    pub retry_max: i64,
    pub attempt: i64,
    pub output: Option<String>,
    /// Set when the tool loop was cut short by budget exhaustion.
    pub partial: bool,
    pub error: Option<String>,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub cost: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// An edge in the task dependency DAG.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskDep {
    pub task_id: Uuid,
    pub depends_on: Uuid,
}

/// One billable API call. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UsageRecord {
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

/// Committed spend aggregated per (scope, period key).
///
/// Scope is `daily` / `monthly` / `project`; the key is the calendar date,
/// the calendar month, or the project id respectively.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BudgetPeriod {
    pub scope: String,
    pub period_key: String,
    pub spent: f64,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub updated_at: DateTime<Utc>,
}

/// A persisted progress event. Also broadcast live by the event bus.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EventRecord {
    pub id: i64,
    pub project_id: Uuid,
    pub task_id: Option<Uuid>,
    pub kind: String,
    pub message: String,
    pub payload: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

/// A request for human adjudication of a retry-exhausted task.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Checkpoint {
    pub id: Uuid,
    pub project_id: Uuid,
    pub task_id: Uuid,
    pub reason: String,
    pub status: CheckpointStatus,
    pub resolution: Option<CheckpointResolution>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
