//! Provider abstraction.
//!
//! The core needs exactly two capabilities from an LLM provider: generate
//! (with tool schemas) and embed. Concrete providers -- a cloud API, a
//! local inference server, an image generator -- implement [`Provider`]
//! and register under the ID the model router emits.

pub mod http;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::tools::ToolSchema;

/// One turn in a conversation.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: content.into(),
        }
    }
}

/// Token counts for one billable call.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    pub tokens_in: i64,
    pub tokens_out: i64,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// A generate request: system prompt, conversation so far, and the tool
/// schemas the model may call.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub model: String,
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSchema>,
}

/// A provider response for one round.
#[derive(Debug, Clone, Default)]
pub struct GenerateResponse {
    pub text: String,
    pub tool_calls: Vec<ToolInvocation>,
    pub usage: TokenUsage,
}

/// Provider failures, split by how the executor should react.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Network hiccups, 5xx. Worth retrying with backoff.
    #[error("transient provider error: {0}")]
    Transient(String),

    /// 429. Also retried with backoff.
    #[error("provider rate limited: {0}")]
    RateLimited(String),

    /// Validation and policy failures. Retrying cannot help.
    #[error("permanent provider error: {0}")]
    Permanent(String),

    /// The caller's cancellation token fired mid-request.
    #[error("request cancelled")]
    Cancelled,
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::RateLimited(_))
    }
}

/// The capability set the core requires from a provider.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable identifier, matched against the model router's choices.
    fn id(&self) -> &str;

    /// One request/response round, honoring cancellation.
    async fn generate(
        &self,
        request: GenerateRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerateResponse, ProviderError>;

    /// Embed a text. Providers without an embedding endpoint keep the
    /// default.
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
        Err(ProviderError::Permanent(
            "embeddings not supported by this provider".to_string(),
        ))
    }
}

/// Provider ID -> implementation. Built once at composition time.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.id().to_string(), provider);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

// Compile-time assertion: Provider must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Provider) {}
};
