//! End-to-end task pipeline: builds a graph from its schema, seeds the
//! variable pool, opens the queue, then drives the engine while pumping
//! its events to the consumer stream.
//!
//! Three tasks cooperate per run. The driver executes the graph and
//! forwards engine events into the queue. The stop watcher polls the
//! KV stop flag and the wall-clock deadline, translating either into the
//! engine's stop signal. The consumer reads through [`QueueListener`],
//! which layers pings and its own stop synthesis on the same flag.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, QueueConfig};
use crate::core::{
    EventEmitter, GraphEngine, RunOutcome, RuntimeContext, StopReason, StopSignal, VariablePool,
};
use crate::error::{PipelineError, TaskError};
use crate::graph::Graph;
use crate::nodes::NodeRegistry;
use crate::queue::{
    AppQueueManager, InMemoryKvStore, InvokeFrom, KvStore, PublishFrom, QueueEvent, QueueListener,
};

/// Builder for one workflow generation task.
pub struct WorkflowTask {
    schema: Value,
    task_id: Option<String>,
    user_id: String,
    invoke_from: InvokeFrom,
    inputs: HashMap<String, Value>,
    system_variables: HashMap<String, Value>,
    environment_variables: HashMap<String, Value>,
    engine_config: EngineConfig,
    queue_config: QueueConfig,
    registry: Arc<NodeRegistry>,
    ctx: RuntimeContext,
    kv: Option<Arc<dyn KvStore>>,
}

impl WorkflowTask {
    pub fn new(schema: Value) -> Self {
        Self {
            schema,
            task_id: None,
            user_id: String::new(),
            invoke_from: InvokeFrom::ServiceApi,
            inputs: HashMap::new(),
            system_variables: HashMap::new(),
            environment_variables: HashMap::new(),
            engine_config: EngineConfig::default(),
            queue_config: QueueConfig::default(),
            registry: Arc::new(NodeRegistry::new()),
            ctx: RuntimeContext::default(),
            kv: None,
        }
    }

    pub fn task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn user(mut self, user_id: impl Into<String>, invoke_from: InvokeFrom) -> Self {
        self.user_id = user_id.into();
        self.invoke_from = invoke_from;
        self
    }

    pub fn input(mut self, name: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(name.into(), value);
        self
    }

    pub fn inputs(mut self, inputs: HashMap<String, Value>) -> Self {
        self.inputs.extend(inputs);
        self
    }

    pub fn system_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.system_variables.insert(name.into(), value);
        self
    }

    pub fn environment_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.environment_variables.insert(name.into(), value);
        self
    }

    pub fn engine_config(mut self, config: EngineConfig) -> Self {
        self.engine_config = config;
        self
    }

    pub fn queue_config(mut self, config: QueueConfig) -> Self {
        self.queue_config = config;
        self
    }

    pub fn registry(mut self, registry: Arc<NodeRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn runtime_context(mut self, ctx: RuntimeContext) -> Self {
        self.ctx = ctx;
        self
    }

    pub fn kv_store(mut self, kv: Arc<dyn KvStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    /// Validates the graph, opens the queue and spawns the run.
    pub async fn start(self) -> Result<WorkflowTaskHandle, PipelineError> {
        let graph = Arc::new(Graph::build(&self.schema)?);
        let task_id = self
            .task_id
            .unwrap_or_else(|| self.ctx.next_id());
        let kv = self
            .kv
            .unwrap_or_else(|| Arc::new(InMemoryKvStore::new()) as Arc<dyn KvStore>);

        let queue = Arc::new(
            AppQueueManager::new(
                task_id.clone(),
                &self.user_id,
                self.invoke_from,
                Arc::clone(&kv),
                self.queue_config.clone(),
                Arc::clone(&self.ctx.time_provider),
            )
            .await?,
        );

        let pool = Arc::new(VariablePool::with_namespaces(
            self.system_variables,
            self.inputs,
            self.environment_variables,
        ));
        let (emitter, mut engine_rx) = EventEmitter::channel();
        let engine = Arc::new(GraphEngine::new(
            graph,
            self.registry,
            self.ctx.clone(),
            self.engine_config,
            emitter,
            StopSignal::new(),
        ));
        let stop = engine.stop_signal();

        let watcher = spawn_stop_watcher(
            Arc::clone(&queue),
            stop.clone(),
            self.ctx.clone(),
            self.queue_config.clone(),
        );

        info!(%task_id, "workflow task started");
        let driver = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                let run = tokio::spawn(engine.run(pool));
                // `run` holds the last engine reference; the channel ends
                // once it completes and the emitter drops with it.
                while let Some(event) = engine_rx.recv().await {
                    // Producer-side publishes are refused once the stop flag
                    // lands; control events below still go through.
                    match queue
                        .publish(QueueEvent::Graph(event), PublishFrom::ApplicationManager)
                        .await
                    {
                        Ok(()) => {}
                        Err(TaskError::Stopped) => {
                            debug!("stop flag set, engine events no longer forwarded");
                            break;
                        }
                        Err(err) => {
                            debug!(error = %err, "event dropped, queue no longer accepts writes");
                        }
                    }
                }
                let outcome = match run.await {
                    Ok(outcome) => outcome,
                    Err(err) => RunOutcome::Failed {
                        error: err.to_string(),
                    },
                };
                if let RunOutcome::Stopped { reason } = &outcome {
                    if let Err(err) = queue
                        .publish(QueueEvent::stop(*reason), PublishFrom::TaskPipeline)
                        .await
                    {
                        warn!(error = %err, "failed to deliver closing stop event");
                    }
                }
                watcher.abort();
                outcome
            })
        };

        Ok(WorkflowTaskHandle {
            task_id,
            queue,
            stop,
            kv,
            queue_config: self.queue_config,
            driver,
        })
    }
}

/// Polls the external stop flag and the run deadline, translating either
/// into the in-process stop signal.
fn spawn_stop_watcher(
    queue: Arc<AppQueueManager>,
    stop: StopSignal,
    ctx: RuntimeContext,
    config: QueueConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let started_at = ctx.now();
        let poll = Duration::from_millis(config.poll_interval_ms);
        loop {
            if stop.is_triggered() {
                return;
            }
            if queue.is_stopped().await {
                stop.trigger(StopReason::UserRequested);
                return;
            }
            if ctx.time_provider.elapsed_secs(started_at) > config.max_execution_time_secs {
                stop.trigger(StopReason::TimeoutExceeded);
                return;
            }
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = tokio::time::sleep(poll) => {}
            }
        }
    })
}

/// Live handle on a started task.
pub struct WorkflowTaskHandle {
    task_id: String,
    queue: Arc<AppQueueManager>,
    stop: StopSignal,
    kv: Arc<dyn KvStore>,
    queue_config: QueueConfig,
    driver: JoinHandle<RunOutcome>,
}

impl WorkflowTaskHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Consumer stream for this task. Single use.
    pub fn listen(&self) -> Result<QueueListener, TaskError> {
        self.queue.listen()
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Requests a stop as `user_id`. Ignored unless the identity matches
    /// the recorded task owner.
    pub async fn request_stop(&self, invoke_from: InvokeFrom, user_id: &str) {
        AppQueueManager::set_stop_flag(
            self.kv.as_ref(),
            &self.queue_config,
            &self.task_id,
            invoke_from,
            user_id,
        )
        .await;
    }

    /// Waits for the run to finish and returns its terminal state.
    pub async fn wait(self) -> RunOutcome {
        match self.driver.await {
            Ok(outcome) => outcome,
            Err(err) => RunOutcome::Failed {
                error: err.to_string(),
            },
        }
    }
}
