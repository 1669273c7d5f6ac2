//! Shared fixtures for conductor-core integration tests: a manual clock,
//! a scriptable mock provider, mock tools, and a fully wired core.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use conductor_db::Db;
use conductor_core::clock::Clock;
use conductor_core::config::CoreConfig;
use conductor_core::provider::{
    GenerateRequest, GenerateResponse, Provider, ProviderError, ProviderRegistry, TokenUsage,
    ToolInvocation,
};
use conductor_core::router::ModelRouter;
use conductor_core::service::Core;
use conductor_core::tools::{Tool, ToolRegistry, ToolSchema};

pub use conductor_test_utils::create_test_db;

// ---------------------------------------------------------------------------
// Manual clock
// ---------------------------------------------------------------------------

/// A clock tests can advance by hand.
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Noon UTC on a fixed date, well away from period boundaries.
    pub fn default_start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap()
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

// ---------------------------------------------------------------------------
// Mock provider
// ---------------------------------------------------------------------------

/// One scripted provider turn.
pub enum MockStep {
    Text {
        text: String,
        tokens_in: i64,
        tokens_out: i64,
    },
    ToolCall {
        name: String,
        arguments: Value,
    },
    Transient(String),
    RateLimited(String),
    Permanent(String),
    /// Block until [`MockProvider::release`] or cancellation.
    Hang,
}

impl MockStep {
    pub fn text(text: &str) -> Self {
        Self::Text {
            text: text.to_string(),
            tokens_in: 10,
            tokens_out: 1,
        }
    }

    pub fn tool_call(name: &str, arguments: Value) -> Self {
        Self::ToolCall {
            name: name.to_string(),
            arguments,
        }
    }
}

struct MockInner {
    script: Mutex<VecDeque<MockStep>>,
    release: Notify,
    calls: AtomicUsize,
}

/// A scriptable provider. Steps are consumed in order; once the script is
/// empty every call answers "done" with 10 input / 1 output tokens.
/// Clones share the script, so the same instance can serve several
/// registry IDs.
#[derive(Clone)]
pub struct MockProvider {
    id: String,
    inner: Arc<MockInner>,
}

impl MockProvider {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            inner: Arc::new(MockInner {
                script: Mutex::new(VecDeque::new()),
                release: Notify::new(),
                calls: AtomicUsize::new(0),
            }),
        }
    }

    /// The same provider under another registry ID.
    pub fn clone_as(&self, id: &str) -> Self {
        Self {
            id: id.to_string(),
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn push(&self, step: MockStep) {
        self.inner.script.lock().unwrap().push_back(step);
    }

    pub fn script(&self, steps: Vec<MockStep>) {
        self.inner.script.lock().unwrap().extend(steps);
    }

    pub fn calls(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }

    /// Wake one hanging call.
    pub fn release(&self) {
        self.inner.release.notify_one();
    }

    fn default_response() -> GenerateResponse {
        GenerateResponse {
            text: "done".to_string(),
            tool_calls: vec![],
            usage: TokenUsage {
                tokens_in: 10,
                tokens_out: 1,
            },
        }
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn generate(
        &self,
        _request: GenerateRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerateResponse, ProviderError> {
        self.inner.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.inner.script.lock().unwrap().pop_front();

        match step {
            None => Ok(Self::default_response()),
            Some(MockStep::Text {
                text,
                tokens_in,
                tokens_out,
            }) => Ok(GenerateResponse {
                text,
                tool_calls: vec![],
                usage: TokenUsage {
                    tokens_in,
                    tokens_out,
                },
            }),
            Some(MockStep::ToolCall { name, arguments }) => Ok(GenerateResponse {
                text: String::new(),
                tool_calls: vec![ToolInvocation {
                    id: "call_0".to_string(),
                    name,
                    arguments,
                }],
                usage: TokenUsage {
                    tokens_in: 10,
                    tokens_out: 1,
                },
            }),
            Some(MockStep::Transient(message)) => Err(ProviderError::Transient(message)),
            Some(MockStep::RateLimited(message)) => Err(ProviderError::RateLimited(message)),
            Some(MockStep::Permanent(message)) => Err(ProviderError::Permanent(message)),
            Some(MockStep::Hang) => {
                tokio::select! {
                    _ = self.inner.release.notified() => Ok(Self::default_response()),
                    _ = cancel.cancelled() => Err(ProviderError::Cancelled),
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Mock tools
// ---------------------------------------------------------------------------

/// A tool that always answers the same string and counts invocations.
pub struct StaticTool {
    name: String,
    reply: String,
    calls: Arc<AtomicUsize>,
}

impl StaticTool {
    pub fn new(name: &str, reply: &str) -> Self {
        Self {
            name: name.to_string(),
            reply: reply.to_string(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl Tool for StaticTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name.clone(),
            description: format!("Static tool {}", self.name),
            parameters: json!({
                "type": "object",
                "properties": {"query": {"type": "string"}},
                "required": ["query"]
            }),
        }
    }

    async fn execute(
        &self,
        _params: Value,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.reply.clone())
    }
}

/// A tool whose execution always errors.
pub struct FailingTool;

#[async_trait]
impl Tool for FailingTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "broken".to_string(),
            description: "Always fails".to_string(),
            parameters: json!({"type": "object", "properties": {}}),
        }
    }

    async fn execute(
        &self,
        _params: Value,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<String> {
        anyhow::bail!("tool blew up")
    }
}

// ---------------------------------------------------------------------------
// Wired core
// ---------------------------------------------------------------------------

/// A fully wired core over a temp database, with handles on the shared
/// mock provider and the manual clock.
pub struct TestHarness {
    pub core: Core,
    pub provider: MockProvider,
    pub clock: ManualClock,
    pub db: Db,
    _dir: TempDir,
}

/// Wire a core with the mock provider registered for every routed
/// provider ID and one static `lookup` tool.
pub async fn build_harness(config: CoreConfig) -> TestHarness {
    let (db, dir) = create_test_db().await;
    let clock = ManualClock::new(ManualClock::default_start());
    let provider = MockProvider::new("cloud");

    let mut providers = ProviderRegistry::new();
    providers.register(Arc::new(provider.clone()));
    providers.register(Arc::new(provider.clone_as("local")));
    providers.register(Arc::new(provider.clone_as("image")));

    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(StaticTool::new("lookup", "lookup result")));

    let core = Core::new(
        db.clone(),
        providers,
        tools,
        ModelRouter::default(),
        config,
        Arc::new(clock.clone()),
    );

    TestHarness {
        core,
        provider,
        clock,
        db,
        _dir: dir,
    }
}

/// A test config with a fast tick and tame backoff.
pub fn test_config() -> CoreConfig {
    let mut config = CoreConfig::default();
    config.tick_interval_ms = 20;
    config.backoff_base_ms = 10;
    config.backoff_max_ms = 50;
    config.shutdown_grace_ms = 500;
    config
}

/// Plan JSON where every task is research/medium and `deps` are indices.
pub fn plan_json(tasks: &[(&str, &[usize])]) -> String {
    let tasks: Vec<Value> = tasks
        .iter()
        .map(|(title, deps)| {
            json!({
                "title": title,
                "description": format!("do {title}"),
                "task_type": "research",
                "complexity": "medium",
                "depends_on": deps,
                "tools_needed": []
            })
        })
        .collect();
    json!({"summary": "test plan", "tasks": tasks}).to_string()
}

/// Poll a condition every 10 ms, panicking after ~6 s.
pub async fn wait_until<F, Fut>(mut check: F, what: &str)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..600 {
        if check().await {
            return;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Fetch a task's current status straight from the store.
pub async fn task_status(db: &Db, task_id: Uuid) -> conductor_db::models::TaskStatus {
    conductor_db::queries::tasks::get_task(db.read(), task_id)
        .await
        .expect("get task")
        .expect("task exists")
        .status
}
