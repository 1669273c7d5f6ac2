//! Injectable time source.
//!
//! Budget period keys and retry deadlines are derived from wall time, so
//! both take a [`Clock`] rather than calling `Utc::now()` directly. Tests
//! swap in a manual clock and advance it across period boundaries.

use chrono::{DateTime, Utc};

/// Wall-clock source.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Format the daily period key for a timestamp, e.g. `2026-08-01`.
pub fn daily_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}

/// Format the monthly period key for a timestamp, e.g. `2026-08`.
pub fn monthly_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m").to_string()
}
