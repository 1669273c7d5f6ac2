//! Error taxonomy for the service surface.
//!
//! Internal plumbing uses `anyhow` with context, as the query layer does;
//! everything that crosses the service boundary is folded into
//! [`CoreError`] so outer adapters can map each variant onto their own
//! error vocabulary (400/404/409/...).

use thiserror::Error;

/// Errors surfaced by the service operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed input at the boundary. No state was changed.
    #[error("validation: {0}")]
    Validation(String),

    /// Entity lookup miss.
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    /// Attempted illegal state transition. No state was changed.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A budget reservation was refused or a mid-loop stop fired.
    #[error("budget exhausted: {0}")]
    BudgetExhausted(String),

    /// Anything else: storage failures, invariant violations.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CoreError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
}
