//! Per-project progress event bus.
//!
//! Every published event is persisted to the store, then fanned out to the
//! project's live subscribers over a bounded broadcast channel. A slow
//! subscriber loses the oldest events and is told how many it missed; it
//! never blocks the publisher or its peers.

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde_json::{Value, json};
use sqlx::{Sqlite, Transaction};
use tokio::sync::broadcast;
use uuid::Uuid;

use conductor_db::Db;
use conductor_db::models::EventRecord;
use conductor_db::queries::events as event_db;

use crate::clock::Clock;
use crate::config::EventBusConfig;
use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// The kinds of progress event the core publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    TaskStart,
    TaskComplete,
    TaskFailed,
    TaskRetry,
    TaskNeedsReview,
    ToolCall,
    BudgetWarning,
    ProjectComplete,
    ProjectFailed,
    Checkpoint,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TaskStart => "task_start",
            Self::TaskComplete => "task_complete",
            Self::TaskFailed => "task_failed",
            Self::TaskRetry => "task_retry",
            Self::TaskNeedsReview => "task_needs_review",
            Self::ToolCall => "tool_call",
            Self::BudgetWarning => "budget_warning",
            Self::ProjectComplete => "project_complete",
            Self::ProjectFailed => "project_failed",
            Self::Checkpoint => "checkpoint",
        };
        f.write_str(s)
    }
}

impl FromStr for EventKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task_start" => Ok(Self::TaskStart),
            "task_complete" => Ok(Self::TaskComplete),
            "task_failed" => Ok(Self::TaskFailed),
            "task_retry" => Ok(Self::TaskRetry),
            "task_needs_review" => Ok(Self::TaskNeedsReview),
            "tool_call" => Ok(Self::ToolCall),
            "budget_warning" => Ok(Self::BudgetWarning),
            "project_complete" => Ok(Self::ProjectComplete),
            "project_failed" => Ok(Self::ProjectFailed),
            "checkpoint" => Ok(Self::Checkpoint),
            _ => Err(()),
        }
    }
}

/// A progress event, as broadcast to live subscribers.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub project_id: Uuid,
    pub task_id: Option<Uuid>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub extras: Value,
}

impl Event {
    pub fn project(kind: EventKind, project_id: Uuid, message: impl Into<String>) -> Self {
        Self {
            kind,
            project_id,
            task_id: None,
            message: message.into(),
            timestamp: DateTime::<Utc>::MIN_UTC,
            extras: json!({}),
        }
    }

    pub fn task(
        kind: EventKind,
        project_id: Uuid,
        task_id: Uuid,
        message: impl Into<String>,
    ) -> Self {
        Self {
            task_id: Some(task_id),
            ..Self::project(kind, project_id, message)
        }
    }

    /// Attach one extra field to the wire payload.
    pub fn with_extra(mut self, key: &str, value: Value) -> Self {
        if let Value::Object(map) = &mut self.extras {
            map.insert(key.to_string(), value);
        }
        self
    }

    /// The wire shape:
    /// `{ type, project_id, task_id, message, timestamp, ...extras }`.
    pub fn wire(&self) -> Value {
        let mut payload = json!({
            "type": self.kind.to_string(),
            "project_id": self.project_id,
            "task_id": self.task_id,
            "message": self.message,
            "timestamp": self.timestamp,
        });
        if let (Value::Object(out), Value::Object(extras)) = (&mut payload, &self.extras) {
            for (k, v) in extras {
                out.insert(k.clone(), v.clone());
            }
        }
        payload
    }
}

/// What a subscriber receives: an event, or notice that `n` events were
/// dropped because it lagged behind.
#[derive(Debug, Clone)]
pub enum BusMessage {
    Event(Event),
    Lagged(u64),
}

/// A live event stream for one project. Dropping it unsubscribes.
pub type EventStream = Pin<Box<dyn Stream<Item = BusMessage> + Send>>;

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

struct ProjectChannel {
    tx: broadcast::Sender<Event>,
    subscribers: usize,
}

struct BusInner {
    db: Db,
    clock: Arc<dyn Clock>,
    config: EventBusConfig,
    channels: Mutex<HashMap<Uuid, ProjectChannel>>,
}

/// Per-project publish/subscribe with persistence.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(db: Db, clock: Arc<dyn Clock>, config: EventBusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                db,
                clock,
                config,
                channels: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Persist an event in its own transaction, then broadcast it.
    pub async fn publish(&self, event: Event) -> Result<EventRecord> {
        let mut event = event;
        event.timestamp = self.inner.clock.now();
        let record = event_db::insert_event(self.inner.db.write(), &new_event(&event)).await?;
        self.broadcast(event);
        Ok(record)
    }

    /// Persist an event inside the caller's ongoing transaction, then
    /// broadcast it. The broadcast goes out before the commit; the worker
    /// commits immediately after, so the window is the commit itself.
    pub async fn publish_in(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        event: Event,
    ) -> Result<EventRecord> {
        let mut event = event;
        event.timestamp = self.inner.clock.now();
        let record = event_db::insert_event(&mut **tx, &new_event(&event)).await?;
        self.broadcast(event);
        Ok(record)
    }

    /// Publish, logging instead of failing. Workers use this: losing one
    /// progress event must not change a task's outcome.
    pub async fn publish_logged(&self, event: Event) {
        let kind = event.kind;
        let project_id = event.project_id;
        if let Err(e) = self.publish(event).await {
            tracing::warn!(
                project_id = %project_id,
                kind = %kind,
                error = %e,
                "failed to publish event (best-effort)"
            );
        }
    }

    /// Subscribe to a project's live events.
    ///
    /// Rejects once the per-project subscriber cap is reached. The stream
    /// yields until dropped; dropping it releases the slot and, when it
    /// was the last subscriber, the project's channel.
    pub fn subscribe(&self, project_id: Uuid) -> Result<EventStream, CoreError> {
        let mut rx = {
            let mut channels = self.inner.channels.lock().expect("event bus lock poisoned");
            let channel = channels.entry(project_id).or_insert_with(|| ProjectChannel {
                tx: broadcast::channel(self.inner.config.queue_capacity).0,
                subscribers: 0,
            });

            if channel.subscribers >= self.inner.config.subscriber_cap {
                return Err(CoreError::conflict(format!(
                    "too many subscribers for project {project_id}"
                )));
            }
            channel.subscribers += 1;
            channel.tx.subscribe()
        };

        let guard = SubscriptionGuard {
            inner: Arc::clone(&self.inner),
            project_id,
        };

        let stream = async_stream::stream! {
            let _guard = guard;
            loop {
                match rx.recv().await {
                    Ok(event) => yield BusMessage::Event(event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(
                            project_id = %project_id,
                            missed,
                            "subscriber lagged, oldest events dropped"
                        );
                        yield BusMessage::Lagged(missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };

        Ok(Box::pin(stream))
    }

    /// Number of live subscribers for a project.
    pub fn subscriber_count(&self, project_id: Uuid) -> usize {
        self.inner
            .channels
            .lock()
            .expect("event bus lock poisoned")
            .get(&project_id)
            .map(|c| c.subscribers)
            .unwrap_or(0)
    }

    fn broadcast(&self, event: Event) {
        let channels = self.inner.channels.lock().expect("event bus lock poisoned");
        if let Some(channel) = channels.get(&event.project_id) {
            // Send fails only when no receiver is listening.
            let _ = channel.tx.send(event);
        }
    }
}

fn new_event(event: &Event) -> event_db::NewEvent {
    event_db::NewEvent {
        project_id: event.project_id,
        task_id: event.task_id,
        kind: event.kind.to_string(),
        message: event.message.clone(),
        payload: event.extras.clone(),
        recorded_at: event.timestamp,
    }
}

struct SubscriptionGuard {
    inner: Arc<BusInner>,
    project_id: Uuid,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        let mut channels = self.inner.channels.lock().expect("event bus lock poisoned");
        if let Some(channel) = channels.get_mut(&self.project_id) {
            channel.subscribers = channel.subscribers.saturating_sub(1);
            if channel.subscribers == 0 {
                channels.remove(&self.project_id);
            }
        }
    }
}
