//! The per-task agent loop.
//!
//! Runs one task against one provider for up to a bounded number of
//! request/response rounds. Tool calls are validated, executed, and fed
//! back as messages; failures become error strings the model can react
//! to. Each round's usage is recorded immediately so the mid-loop budget
//! check sees real spend; on exhaustion the loop exits with whatever
//! output has accumulated and a partial flag.
//!
//! The runner never mutates task rows. It returns an outcome and the
//! worker applies it atomically.

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use conductor_db::models::Task;

use crate::budget::{BudgetManager, SpendRecord};
use crate::events::{Event, EventBus, EventKind};
use crate::provider::{
    ChatMessage, GenerateRequest, ProviderError, ProviderRegistry, ToolInvocation,
};
use crate::router::ModelChoice;
use crate::tools::{ToolRegistry, validate_params};

const SYSTEM_PROMPT: &str = "You are an autonomous worker executing one task \
from a larger project plan. Use the provided tools when they help. When the \
task is done, reply with the final deliverable as plain text.";

/// What one agent invocation produced.
#[derive(Debug, Clone, Default)]
pub struct AgentOutcome {
    pub text: String,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub cost: f64,
    /// True when the loop was cut short by budget exhaustion.
    pub partial: bool,
    pub rounds: u32,
}

/// Runner failures, classified for the worker's retry policy.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("provider {provider} is not registered")]
    UnknownProvider { provider: String },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Budget bookkeeping failed (store error). Retryable.
    #[error("usage recording failed: {0}")]
    Recording(#[from] anyhow::Error),
}

impl RunnerError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::UnknownProvider { .. } => false,
            Self::Provider(e) => e.is_transient(),
            Self::Recording(_) => true,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Provider(ProviderError::Cancelled))
    }
}

/// Runner knobs.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub max_tool_rounds: u32,
}

/// Executes one task via one provider, running the tool loop.
#[derive(Clone)]
pub struct AgentRunner {
    providers: Arc<ProviderRegistry>,
    tools: Arc<ToolRegistry>,
    bus: EventBus,
    budget: Arc<BudgetManager>,
    config: RunnerConfig,
}

impl AgentRunner {
    pub fn new(
        providers: Arc<ProviderRegistry>,
        tools: Arc<ToolRegistry>,
        bus: EventBus,
        budget: Arc<BudgetManager>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            providers,
            tools,
            bus,
            budget,
            config,
        }
    }

    /// Run the tool loop for one task attempt.
    pub async fn run(
        &self,
        task: &Task,
        context: &str,
        choice: &ModelChoice,
        cancel: &CancellationToken,
    ) -> Result<AgentOutcome, RunnerError> {
        let provider = self.providers.get(&choice.provider_id).ok_or_else(|| {
            RunnerError::UnknownProvider {
                provider: choice.provider_id.clone(),
            }
        })?;

        let tool_schemas = self.tools.schemas_for(&task.tools_needed.0);
        let mut messages = vec![ChatMessage::user(context)];
        let mut outcome = AgentOutcome::default();

        for round in 0..self.config.max_tool_rounds {
            if cancel.is_cancelled() {
                return Err(ProviderError::Cancelled.into());
            }

            let request = GenerateRequest {
                model: choice.model_id.clone(),
                system: SYSTEM_PROMPT.to_string(),
                messages: messages.clone(),
                tools: tool_schemas.clone(),
            };
            let response = provider.generate(request, cancel).await?;
            outcome.rounds = round + 1;

            let round_cost = choice
                .pricing
                .cost(response.usage.tokens_in, response.usage.tokens_out);
            outcome.tokens_in += response.usage.tokens_in;
            outcome.tokens_out += response.usage.tokens_out;
            outcome.cost += round_cost;

            self.budget
                .record_now(&SpendRecord {
                    project_id: task.project_id,
                    task_id: Some(task.id),
                    provider: choice.provider_id.clone(),
                    model: choice.model_id.clone(),
                    tokens_in: response.usage.tokens_in,
                    tokens_out: response.usage.tokens_out,
                    cost: round_cost,
                })
                .await?;

            if !response.text.is_empty() {
                outcome.text = response.text.clone();
            }

            if response.tool_calls.is_empty() {
                return Ok(outcome);
            }

            let call_names: Vec<&str> =
                response.tool_calls.iter().map(|c| c.name.as_str()).collect();
            messages.push(ChatMessage::assistant(if response.text.is_empty() {
                format!("[calling tools: {}]", call_names.join(", "))
            } else {
                response.text.clone()
            }));

            for call in &response.tool_calls {
                if cancel.is_cancelled() {
                    return Err(ProviderError::Cancelled.into());
                }

                let result = self.execute_tool(call, cancel).await;
                self.bus
                    .publish_logged(
                        Event::task(
                            EventKind::ToolCall,
                            task.project_id,
                            task.id,
                            format!("tool {} invoked", call.name),
                        )
                        .with_extra("tool", serde_json::json!(call.name))
                        .with_extra("round", serde_json::json!(round)),
                    )
                    .await;

                messages.push(ChatMessage::tool(format!("{}: {result}", call.name)));
            }

            if !self.budget.can_continue(task.project_id).await? {
                tracing::warn!(
                    task_id = %task.id,
                    rounds = outcome.rounds,
                    "budget hard stop, ending tool loop with partial output"
                );
                outcome.partial = true;
                return Ok(outcome);
            }
        }

        tracing::debug!(
            task_id = %task.id,
            rounds = outcome.rounds,
            "tool round limit reached, returning latest output"
        );
        Ok(outcome)
    }

    /// Execute one tool call. Every failure mode collapses into a string
    /// handed back to the model.
    async fn execute_tool(&self, call: &ToolInvocation, cancel: &CancellationToken) -> String {
        let Some(tool) = self.tools.get(&call.name) else {
            return format!("tool error: unknown tool {:?}", call.name);
        };

        if let Err(reason) = validate_params(&tool.schema(), &call.arguments) {
            return format!("tool error: {reason}");
        }

        match tool.execute(call.arguments.clone(), cancel).await {
            Ok(result) => result,
            Err(e) => format!("tool error: {e}"),
        }
    }
}
