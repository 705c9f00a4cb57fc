//! Queue manager bridging one generation task to its event consumer.
//!
//! Ownership and stop requests go through the KV store so they survive
//! process boundaries: construction records who the task belongs to, and a
//! stop request only takes effect when the caller identity matches that
//! record. The event channel itself is in-process and unbounded; the
//! listener side layers pings, the wall-clock budget and the external stop
//! flag on top of it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::QueueConfig;
use crate::core::{GraphEngineEvent, StopReason, TimeProvider};
use crate::error::TaskError;

use super::kv::KvStore;

/// Nesting bound for event payloads. Anything deeper is assumed to carry a
/// runaway or self-referential structure and is refused.
const MAX_PAYLOAD_DEPTH: usize = 32;

pub fn task_belong_key(task_id: &str) -> String {
    format!("generate_task_belong:{task_id}")
}

pub fn task_stopped_key(task_id: &str) -> String {
    format!("generate_task_stopped:{task_id}")
}

/// The surface a generation request came in through. Determines the
/// identity prefix recorded as the task owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InvokeFrom {
    ServiceApi,
    WebApp,
    Explore,
    Debugger,
}

impl InvokeFrom {
    pub fn user_prefix(self) -> &'static str {
        match self {
            InvokeFrom::ServiceApi | InvokeFrom::WebApp => "end-user",
            InvokeFrom::Explore | InvokeFrom::Debugger => "account",
        }
    }

    pub fn owner_identity(self, user_id: &str) -> String {
        format!("{}-{}", self.user_prefix(), user_id)
    }
}

/// Which side of the pipeline is publishing. After a stop flag is observed
/// only the task pipeline may still publish, to deliver the closing event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishFrom {
    ApplicationManager,
    TaskPipeline,
}

/// Control events interleaved with engine events on the consumer stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ControlEvent {
    Ping,
    Stop { reason: StopReason },
    Error { error: String },
}

/// One element of the consumer stream. Serializes uniformly: both arms tag
/// themselves with an `event` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueueEvent {
    Control(ControlEvent),
    Graph(GraphEngineEvent),
}

impl QueueEvent {
    pub fn ping() -> Self {
        QueueEvent::Control(ControlEvent::Ping)
    }

    pub fn stop(reason: StopReason) -> Self {
        QueueEvent::Control(ControlEvent::Stop { reason })
    }

    pub fn error(error: impl Into<String>) -> Self {
        QueueEvent::Control(ControlEvent::Error {
            error: error.into(),
        })
    }

    /// Terminal events end the stream; at most one is ever yielded.
    pub fn is_terminal(&self) -> bool {
        match self {
            QueueEvent::Control(ControlEvent::Stop { .. })
            | QueueEvent::Control(ControlEvent::Error { .. }) => true,
            QueueEvent::Control(ControlEvent::Ping) => false,
            QueueEvent::Graph(event) => event.is_terminal(),
        }
    }
}

impl From<GraphEngineEvent> for QueueEvent {
    fn from(event: GraphEngineEvent) -> Self {
        QueueEvent::Graph(event)
    }
}

pub struct AppQueueManager {
    task_id: String,
    kv: Arc<dyn KvStore>,
    config: QueueConfig,
    time_provider: Arc<dyn TimeProvider>,
    tx: mpsc::UnboundedSender<QueueEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<QueueEvent>>>,
    closed: AtomicBool,
}

impl AppQueueManager {
    /// Binds task ownership in the KV store and opens the event channel.
    pub async fn new(
        task_id: impl Into<String>,
        user_id: &str,
        invoke_from: InvokeFrom,
        kv: Arc<dyn KvStore>,
        config: QueueConfig,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Result<Self, TaskError> {
        if user_id.is_empty() {
            return Err(TaskError::MissingUser);
        }
        let task_id = task_id.into();
        kv.set_with_ttl(
            &task_belong_key(&task_id),
            &invoke_from.owner_identity(user_id),
            config.task_belong_ttl_secs,
        )
        .await;
        info!(task_id = %task_id, "task queue opened");

        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Self {
            task_id,
            kv,
            config,
            time_provider,
            tx,
            rx: Mutex::new(Some(rx)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub async fn publish(&self, event: QueueEvent, from: PublishFrom) -> Result<(), TaskError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TaskError::QueueClosed);
        }
        validate_payload(&event)?;
        if from == PublishFrom::ApplicationManager && self.is_stopped().await {
            return Err(TaskError::Stopped);
        }
        let terminal = event.is_terminal();
        self.tx.send(event).map_err(|_| TaskError::QueueClosed)?;
        if terminal {
            self.closed.store(true, Ordering::SeqCst);
            debug!(task_id = %self.task_id, "queue closed by terminal event");
        }
        Ok(())
    }

    /// Hands out the consumer stream. The channel has one consumer; a
    /// second call fails.
    pub fn listen(&self) -> Result<QueueListener, TaskError> {
        let rx = self.rx.lock().take().ok_or(TaskError::QueueClosed)?;
        Ok(QueueListener {
            rx,
            kv: Arc::clone(&self.kv),
            task_id: self.task_id.clone(),
            config: self.config.clone(),
            time_provider: Arc::clone(&self.time_provider),
            started_at: self.time_provider.now(),
            last_ping_at: self.time_provider.now(),
            finished: false,
        })
    }

    pub async fn is_stopped(&self) -> bool {
        Self::stop_flag_set(self.kv.as_ref(), &self.task_id).await
    }

    /// Requests a stop on behalf of `user_id`. A silent no-op unless the
    /// caller identity matches the recorded task owner.
    pub async fn set_stop_flag(
        kv: &dyn KvStore,
        config: &QueueConfig,
        task_id: &str,
        invoke_from: InvokeFrom,
        user_id: &str,
    ) {
        let Some(owner) = kv.get(&task_belong_key(task_id)).await else {
            return;
        };
        if owner != invoke_from.owner_identity(user_id) {
            debug!(%task_id, "stop request ignored, caller is not the task owner");
            return;
        }
        kv.set_with_ttl(&task_stopped_key(task_id), "1", config.stop_flag_ttl_secs)
            .await;
        info!(%task_id, "stop flag set");
    }

    pub async fn stop_flag_set(kv: &dyn KvStore, task_id: &str) -> bool {
        kv.exists(&task_stopped_key(task_id)).await
    }
}

/// Single consumer of one task's event stream.
pub struct QueueListener {
    rx: mpsc::UnboundedReceiver<QueueEvent>,
    kv: Arc<dyn KvStore>,
    task_id: String,
    config: QueueConfig,
    time_provider: Arc<dyn TimeProvider>,
    started_at: DateTime<Utc>,
    last_ping_at: DateTime<Utc>,
    finished: bool,
}

impl QueueListener {
    /// Yields the next event. Between queued events this wakes at the poll
    /// interval to check the stop flag and the wall-clock budget, and
    /// interleaves a `Ping` for every full ping interval spent waiting.
    /// After a terminal event (queued or synthesized) it returns `None`.
    pub async fn next(&mut self) -> Option<QueueEvent> {
        if self.finished {
            return None;
        }
        loop {
            let now = self.time_provider.now();
            if self.time_provider.elapsed_secs(self.started_at)
                > self.config.max_execution_time_secs
            {
                return Some(self.finish(QueueEvent::stop(StopReason::TimeoutExceeded)));
            }
            if AppQueueManager::stop_flag_set(self.kv.as_ref(), &self.task_id).await {
                return Some(self.finish(QueueEvent::stop(StopReason::UserRequested)));
            }
            if self.time_provider.elapsed_secs(self.last_ping_at) >= self.config.ping_interval_secs
            {
                self.last_ping_at = now;
                return Some(QueueEvent::ping());
            }

            let poll = std::time::Duration::from_millis(self.config.poll_interval_ms);
            match tokio::time::timeout(poll, self.rx.recv()).await {
                Ok(Some(event)) => {
                    if event.is_terminal() {
                        self.finished = true;
                    }
                    return Some(event);
                }
                Ok(None) => {
                    self.finished = true;
                    return None;
                }
                Err(_) => continue,
            }
        }
    }

    fn finish(&mut self, event: QueueEvent) -> QueueEvent {
        self.finished = true;
        event
    }
}

fn validate_payload(event: &QueueEvent) -> Result<(), TaskError> {
    let value = serde_json::to_value(event)
        .map_err(|e| TaskError::ResourceSafetyViolation(e.to_string()))?;
    if value_depth(&value) > MAX_PAYLOAD_DEPTH {
        return Err(TaskError::ResourceSafetyViolation(format!(
            "event payload nests deeper than {MAX_PAYLOAD_DEPTH} levels"
        )));
    }
    Ok(())
}

fn value_depth(value: &Value) -> usize {
    match value {
        Value::Array(items) => 1 + items.iter().map(value_depth).max().unwrap_or(0),
        Value::Object(map) => 1 + map.values().map(value_depth).max().unwrap_or(0),
        _ => 1,
    }
}
