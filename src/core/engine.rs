//! The graph execution engine.
//!
//! One engine drives one run: `Running -> {Succeeded, Failed, Stopped}`.
//! Nodes execute strictly sequentially within a scope; a node with several
//! unconditional out-edges forks one scope per branch onto the runtime and
//! joins them as a barrier at the nearest common successor. Container nodes
//! (iteration, loop) run their subgraph inline, one forked scope per pass.
//! The stop signal is consulted only between node dispatches, so a running
//! executor is never preempted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{WorkflowError, WorkflowResult};
use crate::evaluator::{evaluate_case, Case, Condition, LogicalOperator};
use crate::graph::{Graph, IterationErrorPolicy, NodeSpec};
use crate::nodes::{NodeRegistry, NodeRunResult, NodeStreamSink};

use super::context::RuntimeContext;
use super::event::{
    EventEmitter, GraphEngineEvent, IterationScope, NodeEventMeta, NodeRunStatus, ParallelScope,
    RouteNodeState,
};
use super::stop::{StopReason, StopSignal};
use super::variable_pool::{Segment, Selector, VariablePool};

/// Terminal state of one run.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Succeeded { outputs: HashMap<String, Value> },
    Failed { error: String },
    Stopped { reason: StopReason },
}

/// Scope identity threaded through nested branches and iteration passes.
#[derive(Clone, Default)]
struct ScopeCtx {
    parallel: Option<ParallelScope>,
    in_iteration_id: Option<String>,
    /// Terminal node outputs feed the run result only outside container
    /// bodies.
    collect_outputs: bool,
}

/// Shared per-run bookkeeping.
struct RunState {
    started_at: DateTime<Utc>,
    outputs: Mutex<HashMap<String, Value>>,
}

pub struct GraphEngine {
    graph: Arc<Graph>,
    registry: Arc<NodeRegistry>,
    ctx: RuntimeContext,
    config: EngineConfig,
    emitter: EventEmitter,
    stop: StopSignal,
    run_index: AtomicU64,
    node_states: Mutex<Vec<RouteNodeState>>,
}

impl GraphEngine {
    pub fn new(
        graph: Arc<Graph>,
        registry: Arc<NodeRegistry>,
        ctx: RuntimeContext,
        config: EngineConfig,
        emitter: EventEmitter,
        stop: StopSignal,
    ) -> Self {
        Self {
            graph,
            registry,
            ctx,
            config,
            emitter,
            stop,
            run_index: AtomicU64::new(0),
            node_states: Mutex::new(Vec::new()),
        }
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Per-node-execution records, retained for the run's lifetime.
    pub fn node_states(&self) -> Vec<RouteNodeState> {
        self.node_states.lock().clone()
    }

    pub async fn run(self: Arc<Self>, pool: Arc<VariablePool>) -> RunOutcome {
        let state = Arc::new(RunState {
            started_at: self.ctx.now(),
            outputs: Mutex::new(HashMap::new()),
        });
        info!(root = %self.graph.root_node_id(), "graph run started");
        self.emitter.emit(GraphEngineEvent::GraphRunStarted);

        let scope = ScopeCtx {
            collect_outputs: true,
            ..Default::default()
        };
        let result = Arc::clone(&self)
            .run_scope(
                Arc::clone(&self.graph),
                self.graph.root_node_id().to_string(),
                pool,
                scope,
                None,
                Arc::clone(&state),
            )
            .await;

        match result {
            Ok(()) => {
                let outputs = state.outputs.lock().clone();
                info!("graph run succeeded");
                self.emitter.emit(GraphEngineEvent::GraphRunSucceeded {
                    outputs: outputs.clone(),
                });
                RunOutcome::Succeeded { outputs }
            }
            Err(WorkflowError::Stopped(reason)) => {
                info!(%reason, "graph run stopped");
                RunOutcome::Stopped { reason }
            }
            Err(err) => {
                let error = err.to_string();
                warn!(%error, "graph run failed");
                self.emitter
                    .emit(GraphEngineEvent::GraphRunFailed { error: error.clone() });
                RunOutcome::Failed { error }
            }
        }
    }

    /// Executes nodes sequentially from `start` until the scope runs out of
    /// successors or reaches `boundary` (exclusive).
    fn run_scope(
        self: Arc<Self>,
        graph: Arc<Graph>,
        start: String,
        pool: Arc<VariablePool>,
        scope: ScopeCtx,
        boundary: Option<String>,
        state: Arc<RunState>,
    ) -> BoxFuture<'static, WorkflowResult<()>> {
        async move {
            let mut current = Some(start);
            let mut predecessor: Option<String> = None;
            while let Some(node_id) = current.take() {
                if boundary.as_deref() == Some(node_id.as_str()) {
                    return Ok(());
                }
                self.check_limits(&state)?;

                let node = graph.node(&node_id)?.clone();
                let successors = if node.node_type.is_container() {
                    self.clone()
                        .run_container(&graph, &node, &pool, &scope, &state)
                        .await?;
                    graph.unconditional_successors(&node_id)?
                } else {
                    let result = self
                        .execute_node(&node, &pool, &scope, predecessor.take())
                        .await?;
                    self.commit_result(&node, &result, &pool)?;
                    if node.node_type.is_branch() {
                        graph.successors_for_handle(&node_id, &result.edge_source_handle)?
                    } else {
                        graph.unconditional_successors(&node_id)?
                    }
                };

                predecessor = Some(node_id.clone());
                match successors.len() {
                    0 => {
                        if scope.collect_outputs {
                            let mut outputs = state.outputs.lock();
                            for (name, segment) in pool.node_variables(&node_id) {
                                outputs.insert(name, segment.to_value());
                            }
                        }
                        current = None;
                    }
                    1 => {
                        current = successors.into_iter().next();
                    }
                    _ => {
                        current = self
                            .clone()
                            .run_parallel(&graph, &node_id, successors, &pool, &scope, &state)
                            .await?;
                    }
                }
            }
            Ok(())
        }
        .boxed()
    }

    /// Forks one scope per branch head, waits on the barrier and merges
    /// branch pools back on all-success. The first failing branch aborts
    /// its siblings and fails the join; sibling work is discarded.
    async fn run_parallel(
        self: Arc<Self>,
        graph: &Arc<Graph>,
        source_node_id: &str,
        branch_heads: Vec<String>,
        pool: &Arc<VariablePool>,
        scope: &ScopeCtx,
        state: &Arc<RunState>,
    ) -> WorkflowResult<Option<String>> {
        let parallel_id = self.ctx.next_id();
        let join = graph.join_node_for(&branch_heads)?;
        debug!(
            source = source_node_id,
            branches = branch_heads.len(),
            join = join.as_deref().unwrap_or("-"),
            "parallel fan-out"
        );

        let mut set: JoinSet<(ParallelScope, WorkflowResult<Arc<VariablePool>>)> = JoinSet::new();
        for head in branch_heads {
            let branch_scope =
                ParallelScope::child(scope.parallel.as_ref(), parallel_id.clone(), head.clone());
            self.emitter.emit(GraphEngineEvent::ParallelBranchRunStarted {
                scope: branch_scope.clone(),
            });
            let branch_pool = Arc::new(pool.fork());
            let child_ctx = ScopeCtx {
                parallel: Some(branch_scope.clone()),
                in_iteration_id: scope.in_iteration_id.clone(),
                collect_outputs: scope.collect_outputs,
            };
            let engine = Arc::clone(&self);
            let graph = Arc::clone(graph);
            let state = Arc::clone(state);
            let boundary = join.clone();
            set.spawn(async move {
                let result = engine
                    .run_scope(
                        graph,
                        head,
                        Arc::clone(&branch_pool),
                        child_ctx,
                        boundary,
                        state,
                    )
                    .await;
                (branch_scope, result.map(|()| branch_pool))
            });
        }

        let mut first_err: Option<WorkflowError> = None;
        let mut branch_pools: Vec<Arc<VariablePool>> = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((branch_scope, Ok(branch_pool))) => {
                    self.emitter
                        .emit(GraphEngineEvent::ParallelBranchRunSucceeded {
                            scope: branch_scope,
                        });
                    branch_pools.push(branch_pool);
                }
                Ok((branch_scope, Err(err))) => {
                    if !matches!(err, WorkflowError::Stopped(_)) {
                        self.emitter.emit(GraphEngineEvent::ParallelBranchRunFailed {
                            scope: branch_scope,
                            error: err.to_string(),
                        });
                    }
                    if first_err.is_none() {
                        first_err = Some(err);
                        // No further nodes get scheduled on the siblings.
                        set.abort_all();
                    }
                }
                Err(join_err) => {
                    if !join_err.is_cancelled() && first_err.is_none() {
                        first_err = Some(WorkflowError::InternalError(join_err.to_string()));
                    }
                }
            }
        }

        if let Some(err) = first_err {
            return Err(err);
        }
        for branch_pool in branch_pools {
            pool.merge_branch(&branch_pool);
        }
        Ok(join)
    }

    async fn run_container(
        self: Arc<Self>,
        graph: &Arc<Graph>,
        node: &NodeSpec,
        pool: &Arc<VariablePool>,
        scope: &ScopeCtx,
        state: &Arc<RunState>,
    ) -> WorkflowResult<()> {
        if node.node_type == crate::graph::NodeType::Iteration {
            self.run_iteration(graph, node, pool, scope, state).await
        } else {
            self.run_loop(graph, node, pool, scope, state).await
        }
    }

    /// Runs the container body once per element of the input collection.
    /// Each pass gets a fresh fork of the shared pool seeded with the
    /// current element and index under the container's node id.
    async fn run_iteration(
        self: Arc<Self>,
        graph: &Arc<Graph>,
        node: &NodeSpec,
        pool: &Arc<VariablePool>,
        scope: &ScopeCtx,
        state: &Arc<RunState>,
    ) -> WorkflowResult<()> {
        let config: IterationNodeData = serde_json::from_value(node.data.clone())
            .map_err(|e| container_config_error(&node.id, &e))?;
        let subgraph = Arc::new(graph.subgraph_for(&node.id)?);

        let items = match pool.get(&config.iterator_selector) {
            Segment::Array(items) => items,
            Segment::None => Vec::new(),
            _ => {
                return Err(WorkflowError::NodeExecutionError {
                    node_id: node.id.clone(),
                    error: format!(
                        "iterator input `{}` is not an array",
                        config.iterator_selector
                    ),
                })
            }
        };

        let iter_scope = IterationScope {
            iteration_execution_id: self.ctx.next_id(),
            iteration_node_id: node.id.clone(),
            iteration_node_type: node.node_type,
            parallel: scope.parallel.clone(),
        };
        let started_at = self.ctx.now();
        self.emitter.emit(GraphEngineEvent::IterationRunStarted {
            scope: iter_scope.clone(),
            start_at: started_at,
            inputs: Some(json!({ "iterator": Segment::Array(items.clone()) })),
        });

        let mut outputs: Vec<Segment> = Vec::with_capacity(items.len());
        let mut previous_output: Option<Value> = None;
        let total = items.len();
        for (index, item) in items.into_iter().enumerate() {
            self.check_limits(state)?;
            self.emitter.emit(GraphEngineEvent::IterationRunNext {
                scope: iter_scope.clone(),
                index,
                pre_iteration_output: previous_output.take(),
            });

            let pass_pool = Arc::new(pool.fork());
            pass_pool.set(&node.id, "item", item);
            pass_pool.set(&node.id, "index", Segment::Integer(index as i64));
            let pass_ctx = ScopeCtx {
                parallel: scope.parallel.clone(),
                in_iteration_id: Some(node.id.clone()),
                collect_outputs: false,
            };
            let pass_result = self
                .clone()
                .run_scope(
                    Arc::clone(&subgraph),
                    subgraph.root_node_id().to_string(),
                    Arc::clone(&pass_pool),
                    pass_ctx,
                    None,
                    Arc::clone(state),
                )
                .await;

            match pass_result {
                Ok(()) => {
                    let output = pass_pool.get(&config.output_selector);
                    previous_output = Some(output.to_value());
                    outputs.push(output);
                }
                Err(err @ WorkflowError::Stopped(_)) => return Err(err),
                Err(err) => match config.error_policy {
                    IterationErrorPolicy::Abort => {
                        self.emitter.emit(GraphEngineEvent::IterationRunFailed {
                            scope: iter_scope,
                            start_at: started_at,
                            error: err.to_string(),
                            steps: index,
                        });
                        return Err(WorkflowError::NodeExecutionError {
                            node_id: node.id.clone(),
                            error: err.to_string(),
                        });
                    }
                    IterationErrorPolicy::SkipAndContinue => {
                        debug!(node_id = %node.id, index, error = %err, "iteration pass skipped");
                        outputs.push(Segment::None);
                    }
                },
            }
        }

        let aggregated = Segment::Array(outputs);
        pool.set(&node.id, "output", aggregated.clone());
        self.emitter.emit(GraphEngineEvent::IterationRunSucceeded {
            scope: iter_scope,
            start_at: started_at,
            outputs: Some(json!({ "output": aggregated })),
            steps: total,
        });
        Ok(())
    }

    /// Runs the container body up to `loop_count` times over one shared
    /// fork, so each pass observes the previous pass's writes. Break
    /// conditions are checked after every pass.
    async fn run_loop(
        self: Arc<Self>,
        graph: &Arc<Graph>,
        node: &NodeSpec,
        pool: &Arc<VariablePool>,
        scope: &ScopeCtx,
        state: &Arc<RunState>,
    ) -> WorkflowResult<()> {
        let config: LoopNodeData = serde_json::from_value(node.data.clone())
            .map_err(|e| container_config_error(&node.id, &e))?;
        let subgraph = Arc::new(graph.subgraph_for(&node.id)?);

        let iter_scope = IterationScope {
            iteration_execution_id: self.ctx.next_id(),
            iteration_node_id: node.id.clone(),
            iteration_node_type: node.node_type,
            parallel: scope.parallel.clone(),
        };
        let started_at = self.ctx.now();
        self.emitter.emit(GraphEngineEvent::IterationRunStarted {
            scope: iter_scope.clone(),
            start_at: started_at,
            inputs: Some(json!({ "loop_count": config.loop_count })),
        });

        let loop_pool = Arc::new(pool.fork());
        let mut steps = 0usize;
        for index in 0..config.loop_count {
            self.check_limits(state)?;
            self.emitter.emit(GraphEngineEvent::IterationRunNext {
                scope: iter_scope.clone(),
                index,
                pre_iteration_output: None,
            });
            loop_pool.set(&node.id, "index", Segment::Integer(index as i64));

            let pass_ctx = ScopeCtx {
                parallel: scope.parallel.clone(),
                in_iteration_id: Some(node.id.clone()),
                collect_outputs: false,
            };
            let pass_result = self
                .clone()
                .run_scope(
                    Arc::clone(&subgraph),
                    subgraph.root_node_id().to_string(),
                    Arc::clone(&loop_pool),
                    pass_ctx,
                    None,
                    Arc::clone(state),
                )
                .await;

            match pass_result {
                Ok(()) => steps += 1,
                Err(err @ WorkflowError::Stopped(_)) => return Err(err),
                Err(err) => match config.error_policy {
                    IterationErrorPolicy::Abort => {
                        self.emitter.emit(GraphEngineEvent::IterationRunFailed {
                            scope: iter_scope,
                            start_at: started_at,
                            error: err.to_string(),
                            steps,
                        });
                        return Err(WorkflowError::NodeExecutionError {
                            node_id: node.id.clone(),
                            error: err.to_string(),
                        });
                    }
                    IterationErrorPolicy::SkipAndContinue => {
                        steps += 1;
                        continue;
                    }
                },
            }

            if !config.break_conditions.is_empty() {
                let case = Case {
                    case_id: "break".to_string(),
                    logical_operator: config.logical_operator,
                    conditions: config.break_conditions.clone(),
                };
                if evaluate_case(&case, &loop_pool) {
                    break;
                }
            }
        }

        pool.merge_branch(&loop_pool);
        self.emitter.emit(GraphEngineEvent::IterationRunSucceeded {
            scope: iter_scope,
            start_at: started_at,
            outputs: None,
            steps,
        });
        Ok(())
    }

    /// Runs one executor with full event bracketing, returning `Err` on
    /// reported failure so the caller can unwind the scope.
    async fn execute_node(
        &self,
        node: &NodeSpec,
        pool: &VariablePool,
        scope: &ScopeCtx,
        predecessor_node_id: Option<String>,
    ) -> WorkflowResult<NodeRunResult> {
        let run_index = self.run_index.fetch_add(1, Ordering::SeqCst) + 1;
        let start_at = self.ctx.now();
        let meta = NodeEventMeta {
            node_execution_id: self.ctx.next_id(),
            node_id: node.id.clone(),
            node_type: node.node_type,
            start_at,
            parallel: scope.parallel.clone(),
            in_iteration_id: scope.in_iteration_id.clone(),
        };
        debug!(node_id = %node.id, node_type = node.node_type.as_str(), run_index, "node run started");
        self.emitter.emit(GraphEngineEvent::NodeRunStarted {
            meta: meta.clone(),
            predecessor_node_id,
        });

        let executor = self.registry.resolve(node.node_type);
        let resolved_inputs = {
            let mappings = executor.extract_variable_mapping(&node.data);
            if mappings.is_empty() {
                None
            } else {
                Some(Value::Object(
                    mappings
                        .into_iter()
                        .map(|m| (m.variable, pool.get(&m.value_selector).to_value()))
                        .collect(),
                ))
            }
        };
        let sink = NodeStreamSink::new(meta.clone(), self.emitter.clone());

        let outcome = executor.run(node, pool, &self.ctx, &sink).await;
        let finished_at = self.ctx.now();
        match outcome {
            Ok(mut result) if result.status == NodeRunStatus::Succeeded => {
                if result.inputs.is_none() {
                    result.inputs = resolved_inputs;
                }
                let node_state = RouteNodeState {
                    id: meta.node_execution_id.clone(),
                    node_id: node.id.clone(),
                    status: NodeRunStatus::Succeeded,
                    start_at,
                    finished_at: Some(finished_at),
                    inputs: result.inputs.clone(),
                    process_data: result.process_data.clone(),
                    outputs: Some(Value::Object(
                        result
                            .outputs
                            .iter()
                            .map(|(k, v)| (k.clone(), v.to_value()))
                            .collect(),
                    )),
                    metadata: result.metadata.clone(),
                    error: None,
                    run_index,
                };
                self.node_states.lock().push(node_state.clone());
                self.emitter.emit(GraphEngineEvent::NodeRunSucceeded {
                    meta,
                    state: node_state,
                });
                Ok(result)
            }
            Ok(result) => {
                let error = result
                    .error
                    .unwrap_or_else(|| "node reported failure".to_string());
                self.fail_node(node, meta, start_at, finished_at, run_index, error)
            }
            Err(err) => {
                self.fail_node(node, meta, start_at, finished_at, run_index, err.to_string())
            }
        }
    }

    fn fail_node(
        &self,
        node: &NodeSpec,
        meta: NodeEventMeta,
        start_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        run_index: u64,
        error: String,
    ) -> WorkflowResult<NodeRunResult> {
        warn!(node_id = %node.id, %error, "node run failed");
        let node_state = RouteNodeState {
            id: meta.node_execution_id.clone(),
            node_id: node.id.clone(),
            status: NodeRunStatus::Failed,
            start_at,
            finished_at: Some(finished_at),
            inputs: None,
            process_data: None,
            outputs: None,
            metadata: None,
            error: Some(error.clone()),
            run_index,
        };
        self.node_states.lock().push(node_state.clone());
        self.emitter.emit(GraphEngineEvent::NodeRunFailed {
            meta,
            state: node_state,
            error: error.clone(),
        });
        Err(WorkflowError::NodeExecutionError {
            node_id: node.id.clone(),
            error,
        })
    }

    fn commit_result(
        &self,
        node: &NodeSpec,
        result: &NodeRunResult,
        pool: &VariablePool,
    ) -> WorkflowResult<()> {
        pool.set_node_outputs(&node.id, &result.outputs);
        for (selector, segment) in &result.variable_updates {
            let (Some(target), Some(name)) = (selector.node_id(), selector.variable()) else {
                return Err(WorkflowError::InternalError(format!(
                    "node `{}` declared an invalid variable update `{selector}`",
                    node.id
                )));
            };
            pool.set(target, name, segment.clone());
        }
        Ok(())
    }

    /// Stop flag, step budget and wall-clock budget, checked at every
    /// scheduling boundary.
    fn check_limits(&self, state: &RunState) -> WorkflowResult<()> {
        if self.stop.is_triggered() {
            let reason = self.stop.reason().unwrap_or(StopReason::UserRequested);
            return Err(WorkflowError::Stopped(reason));
        }
        let executed = self.run_index.load(Ordering::SeqCst);
        if executed >= self.config.max_steps {
            return Err(WorkflowError::MaxStepsExceeded(self.config.max_steps));
        }
        if self.ctx.time_provider.elapsed_secs(state.started_at) > self.config.max_execution_time_secs
        {
            self.stop.trigger(StopReason::TimeoutExceeded);
            return Err(WorkflowError::Stopped(StopReason::TimeoutExceeded));
        }
        Ok(())
    }
}

fn container_config_error(node_id: &str, err: &serde_json::Error) -> WorkflowError {
    WorkflowError::GraphConfigError(format!("container `{node_id}` config invalid: {err}"))
}

#[derive(Debug, Deserialize)]
struct IterationNodeData {
    iterator_selector: Selector,
    output_selector: Selector,
    error_policy: IterationErrorPolicy,
}

#[derive(Debug, Deserialize)]
struct LoopNodeData {
    loop_count: usize,
    #[serde(default)]
    break_conditions: Vec<Condition>,
    #[serde(default)]
    logical_operator: LogicalOperator,
    error_policy: IterationErrorPolicy,
}
