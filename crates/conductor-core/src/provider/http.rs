//! OpenAI-compatible chat provider.
//!
//! Serves both the cloud tier and local inference servers, which speak the
//! same wire dialect. One shared `reqwest::Client` per provider, created
//! at startup; per-request timeouts override the client default.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use super::{
    GenerateRequest, GenerateResponse, Provider, ProviderError, TokenUsage, ToolInvocation,
};

/// Configuration for one OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct HttpProviderConfig {
    /// Registry ID, matched against router choices (e.g. "cloud", "local").
    pub id: String,
    /// Base URL up to but excluding `/chat/completions`.
    pub base_url: String,
    pub api_key: Option<String>,
    /// Model used for `embed`. `None` disables embeddings.
    pub embed_model: Option<String>,
    pub request_timeout: Duration,
}

impl HttpProviderConfig {
    pub fn new(id: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            base_url: base_url.into(),
            api_key: None,
            embed_model: None,
            request_timeout: Duration::from_secs(120),
        }
    }
}

/// An OpenAI-compatible chat provider.
pub struct HttpProvider {
    config: HttpProviderConfig,
    client: reqwest::Client,
}

impl HttpProvider {
    pub fn new(config: HttpProviderConfig, client: reqwest::Client) -> Self {
        Self { config, client }
    }

    fn request_body(request: &GenerateRequest) -> Value {
        let mut messages = vec![json!({"role": "system", "content": request.system})];
        for message in &request.messages {
            messages.push(json!({"role": message.role, "content": message.content}));
        }

        let mut body = json!({
            "model": request.model,
            "messages": messages,
        });
        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = Value::Array(tools);
        }
        body
    }

    async fn post(&self, path: &str, body: &Value) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);
        let mut request = self
            .client
            .post(&url)
            .timeout(self.config.request_timeout)
            .json(body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        request.send().await.map_err(|e| {
            // Connect errors and timeouts are worth retrying.
            ProviderError::Transient(format!("request to {url} failed: {e}"))
        })
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn id(&self) -> &str {
        &self.config.id
    }

    async fn generate(
        &self,
        request: GenerateRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerateResponse, ProviderError> {
        let body = Self::request_body(&request);

        let response = tokio::select! {
            response = self.post("/chat/completions", &body) => response?,
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
        };

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::Transient(format!("failed to read response body: {e}")))?;

        if !status.is_success() {
            return Err(classify_status(status.as_u16(), &text));
        }

        parse_chat_completion(&text)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let Some(model) = &self.config.embed_model else {
            return Err(ProviderError::Permanent(format!(
                "provider {} has no embedding model configured",
                self.config.id
            )));
        };

        let body = json!({"model": model, "input": text});
        let response = self.post("/embeddings", &body).await?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::Transient(format!("failed to read response body: {e}")))?;

        if !status.is_success() {
            return Err(classify_status(status.as_u16(), &text));
        }

        parse_embedding(&text)
    }
}

/// Map an HTTP status onto the retry taxonomy.
fn classify_status(status: u16, body: &str) -> ProviderError {
    let snippet: String = body.chars().take(200).collect();
    match status {
        429 => ProviderError::RateLimited(format!("429: {snippet}")),
        408 | 500..=599 => ProviderError::Transient(format!("{status}: {snippet}")),
        _ => ProviderError::Permanent(format!("{status}: {snippet}")),
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    /// Arrives as a JSON-encoded string per the wire dialect.
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: i64,
    #[serde(default)]
    completion_tokens: i64,
}

fn parse_chat_completion(body: &str) -> Result<GenerateResponse, ProviderError> {
    let completion: ChatCompletion = serde_json::from_str(body)
        .map_err(|e| ProviderError::Permanent(format!("malformed completion response: {e}")))?;

    let choice = completion
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::Permanent("completion response had no choices".to_string()))?;

    let tool_calls = choice
        .message
        .tool_calls
        .into_iter()
        .map(|call| {
            let arguments = serde_json::from_str(&call.function.arguments)
                .unwrap_or(Value::String(call.function.arguments));
            ToolInvocation {
                id: call.id,
                name: call.function.name,
                arguments,
            }
        })
        .collect();

    let usage = completion
        .usage
        .map(|u| TokenUsage {
            tokens_in: u.prompt_tokens,
            tokens_out: u.completion_tokens,
        })
        .unwrap_or_default();

    Ok(GenerateResponse {
        text: choice.message.content.unwrap_or_default(),
        tool_calls,
        usage,
    })
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    embedding: Vec<f32>,
}

fn parse_embedding(body: &str) -> Result<Vec<f32>, ProviderError> {
    let response: EmbeddingResponse = serde_json::from_str(body)
        .map_err(|e| ProviderError::Permanent(format!("malformed embedding response: {e}")))?;

    response
        .data
        .into_iter()
        .next()
        .map(|item| item.embedding)
        .ok_or_else(|| ProviderError::Permanent("embedding response had no data".to_string()))
}
