//! Core configuration.
//!
//! Deserializable from TOML with serde defaults so callers can override
//! only what they need. The core itself never reads files or environment
//! variables at import time; the outer layer resolves a config and hands
//! it to the composition root.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the execution core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Maximum number of concurrently running task workers.
    pub max_concurrent_tasks: usize,
    /// Milliseconds between executor ticks.
    pub tick_interval_ms: u64,
    /// Transient-error retries per task before escalating to review.
    pub max_retries: i64,
    /// Base backoff in milliseconds; attempt N waits `base * 2^N` plus
    /// jitter.
    pub backoff_base_ms: u64,
    /// Upper bound on a single backoff wait.
    pub backoff_max_ms: u64,
    /// Maximum request/response rounds per agent invocation.
    pub max_tool_rounds: u32,
    /// Byte budget for dependency context handed to an agent.
    pub context_budget_bytes: usize,
    /// Seconds a worker is given to drain on shutdown before being aborted.
    pub shutdown_grace_ms: u64,
    /// Budget limits and margins.
    pub budget: BudgetConfig,
    /// Event bus sizing.
    pub events: EventBusConfig,
    /// Resource monitor cadence.
    pub monitor: MonitorConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 4,
            tick_interval_ms: 2_000,
            max_retries: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            max_tool_rounds: 10,
            context_budget_bytes: 16_384,
            shutdown_grace_ms: 10_000,
            budget: BudgetConfig::default(),
            events: EventBusConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl CoreConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Spending limits in account currency. `None` means unlimited.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub daily_limit: Option<f64>,
    pub monthly_limit: Option<f64>,
    pub per_project_limit: Option<f64>,
    /// Mid-loop hard stop: a tool loop ends early once the remaining
    /// headroom in any limited scope falls to this margin.
    pub hard_stop_margin: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily_limit: None,
            monthly_limit: None,
            per_project_limit: None,
            hard_stop_margin: 0.01,
        }
    }
}

/// Event bus sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Live subscribers allowed per project.
    pub subscriber_cap: usize,
    /// Events buffered per subscriber before the oldest are dropped.
    pub queue_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            subscriber_cap: 10,
            queue_capacity: 256,
        }
    }
}

/// Resource monitor cadence and probe targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub targets: Vec<ProbeTarget>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: 30_000,
            probe_timeout_ms: 2_000,
            targets: Vec::new(),
        }
    }
}

/// One provider health probe: an HTTP endpoint, or just the presence of a
/// credential when the provider has no cheap status URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeTarget {
    pub provider_id: String,
    #[serde(default)]
    pub health_url: Option<String>,
    #[serde(default)]
    pub credential_env: Option<String>,
}
