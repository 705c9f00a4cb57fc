//! End-to-end engine runs over small graphs: branching, iteration,
//! parallel fan-out and cooperative stop.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;

use tideflow::core::{NodeEventMeta, StopReason};
use tideflow::nodes::NodeStreamSink;
use tideflow::{
    EngineConfig, EventEmitter, FakeIdGenerator, FakeTimeProvider, Graph, GraphEngine,
    GraphEngineEvent, NodeError, NodeExecutor, NodeRegistry, NodeRunResult, NodeType,
    RunOutcome, RuntimeContext, Segment, Selector, StopSignal, TimeProvider, VariablePool,
};
use tideflow::graph::NodeSpec;

fn test_context() -> RuntimeContext {
    RuntimeContext::new(
        Arc::new(FakeTimeProvider::new(1_700_000_000)) as Arc<dyn TimeProvider>,
        Arc::new(FakeIdGenerator::new("exec")),
    )
}

fn engine(
    config: Value,
    registry: NodeRegistry,
) -> (Arc<GraphEngine>, UnboundedReceiver<GraphEngineEvent>) {
    let graph = Arc::new(Graph::build(&config).expect("graph builds"));
    let (emitter, rx) = EventEmitter::channel();
    let engine = Arc::new(GraphEngine::new(
        graph,
        Arc::new(registry),
        test_context(),
        EngineConfig::default(),
        emitter,
        StopSignal::new(),
    ));
    (engine, rx)
}

fn drain(rx: &mut UnboundedReceiver<GraphEngineEvent>) -> Vec<GraphEngineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn started_node_ids(events: &[GraphEngineEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            GraphEngineEvent::NodeRunStarted { meta, .. } => Some(meta.node_id.clone()),
            _ => None,
        })
        .collect()
}

fn terminal_count(events: &[GraphEngineEvent]) -> usize {
    events.iter().filter(|e| e.is_terminal()).count()
}

/// Squares the current element of the enclosing iteration.
struct SquareExecutor {
    container_id: &'static str,
}

#[async_trait]
impl NodeExecutor for SquareExecutor {
    async fn run(
        &self,
        _node: &NodeSpec,
        pool: &VariablePool,
        _ctx: &RuntimeContext,
        _sink: &NodeStreamSink,
    ) -> Result<NodeRunResult, NodeError> {
        let item = pool.get(&Selector::new([self.container_id, "item"]));
        let x = item
            .as_f64()
            .ok_or_else(|| NodeError::TypeError("item is not numeric".to_string()))?;
        Ok(NodeRunResult::success(HashMap::from([(
            "result".to_string(),
            Segment::Integer((x * x) as i64),
        )])))
    }
}

/// Writes the configured value, after probing a sibling selector to record
/// whether that write was visible from this branch.
struct ProbeWriteExecutor;

#[async_trait]
impl NodeExecutor for ProbeWriteExecutor {
    async fn run(
        &self,
        node: &NodeSpec,
        pool: &VariablePool,
        _ctx: &RuntimeContext,
        _sink: &NodeStreamSink,
    ) -> Result<NodeRunResult, NodeError> {
        let write = node.data.get("write").cloned().unwrap_or(Value::Null);
        let probe: Vec<String> = serde_json::from_value(
            node.data.get("probe").cloned().unwrap_or(json!([])),
        )?;
        // Give the sibling a chance to run first.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let seen = !probe.is_empty() && pool.has(&Selector::from(probe));
        Ok(NodeRunResult::success(HashMap::from([
            ("value".to_string(), Segment::from_value(&write)),
            ("sibling_seen".to_string(), Segment::Boolean(seen)),
        ])))
    }
}

/// Adds one to its own previous output, starting from zero.
struct CountUpExecutor;

#[async_trait]
impl NodeExecutor for CountUpExecutor {
    async fn run(
        &self,
        node: &NodeSpec,
        pool: &VariablePool,
        _ctx: &RuntimeContext,
        _sink: &NodeStreamSink,
    ) -> Result<NodeRunResult, NodeError> {
        let total = pool
            .get(&Selector::new([node.id.as_str(), "total"]))
            .as_f64()
            .unwrap_or(0.0) as i64;
        Ok(NodeRunResult::success(HashMap::from([(
            "total".to_string(),
            Segment::Integer(total + 1),
        )])))
    }
}

struct FailAfterDelay;

#[async_trait]
impl NodeExecutor for FailAfterDelay {
    async fn run(
        &self,
        _node: &NodeSpec,
        _pool: &VariablePool,
        _ctx: &RuntimeContext,
        _sink: &NodeStreamSink,
    ) -> Result<NodeRunResult, NodeError> {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        Err(NodeError::ExecutionError("upstream service exploded".into()))
    }
}

struct TriggerStopExecutor {
    stop: StopSignal,
}

#[async_trait]
impl NodeExecutor for TriggerStopExecutor {
    async fn run(
        &self,
        _node: &NodeSpec,
        _pool: &VariablePool,
        _ctx: &RuntimeContext,
        _sink: &NodeStreamSink,
    ) -> Result<NodeRunResult, NodeError> {
        self.stop.trigger(StopReason::UserRequested);
        Ok(NodeRunResult::success(HashMap::from([(
            "done".to_string(),
            Segment::Boolean(true),
        )])))
    }
}

#[tokio::test]
async fn branch_selects_true_arm_and_never_starts_the_other() {
    let config = json!({
        "nodes": [
            {"id": "start", "data": {"type": "start"}},
            {"id": "cond", "data": {
                "type": "if-else",
                "cases": [{
                    "case_id": "true",
                    "conditions": [{
                        "variable_selector": ["inputs", "flag"],
                        "comparison_operator": "is",
                        "value": "yes"
                    }]
                }]
            }},
            {"id": "a", "data": {"type": "template-transform", "template": "picked a"}},
            {"id": "b", "data": {"type": "template-transform", "template": "picked b"}},
            {"id": "end-a", "data": {
                "type": "end",
                "outputs": [{"variable": "text", "value_selector": ["a", "output"]}]
            }},
            {"id": "end-b", "data": {
                "type": "end",
                "outputs": [{"variable": "text", "value_selector": ["b", "output"]}]
            }}
        ],
        "edges": [
            {"source": "start", "target": "cond"},
            {"source": "cond", "target": "a", "source_handle": "true"},
            {"source": "cond", "target": "b", "source_handle": "false"},
            {"source": "a", "target": "end-a"},
            {"source": "b", "target": "end-b"}
        ]
    });
    let (engine, mut rx) = engine(config, NodeRegistry::new());
    let pool = Arc::new(VariablePool::new());
    pool.set("inputs", "flag", Segment::String("yes".into()));

    let outcome = engine.run(pool).await;
    let RunOutcome::Succeeded { outputs } = outcome else {
        panic!("expected success, got {outcome:?}");
    };
    assert_eq!(outputs.get("text"), Some(&json!("picked a")));

    let events = drain(&mut rx);
    let started = started_node_ids(&events);
    assert!(started.contains(&"a".to_string()));
    assert!(!started.contains(&"b".to_string()));
    assert_eq!(terminal_count(&events), 1);
    assert!(events.last().is_some_and(|e| e.is_terminal()));

    // a starts only after it was selected, and succeeds before the run ends.
    let a_started = events
        .iter()
        .position(|e| matches!(e, GraphEngineEvent::NodeRunStarted { meta, .. } if meta.node_id == "a"));
    let a_succeeded = events
        .iter()
        .position(|e| matches!(e, GraphEngineEvent::NodeRunSucceeded { meta, .. } if meta.node_id == "a"));
    assert!(a_started < a_succeeded);
}

#[tokio::test]
async fn iteration_squares_each_element_in_order() {
    let config = json!({
        "nodes": [
            {"id": "start", "data": {"type": "start"}},
            {"id": "iter", "data": {
                "type": "iteration",
                "iterator_selector": ["inputs", "items"],
                "output_selector": ["sq", "result"],
                "error_policy": "abort"
            }},
            {"id": "sq", "data": {"type": "code", "iteration_id": "iter"}},
            {"id": "end", "data": {
                "type": "end",
                "outputs": [{"variable": "squares", "value_selector": ["iter", "output"]}]
            }}
        ],
        "edges": [
            {"source": "start", "target": "iter"},
            {"source": "iter", "target": "end"}
        ]
    });
    let registry = NodeRegistry::new().with_executor(
        NodeType::Code,
        Arc::new(SquareExecutor {
            container_id: "iter",
        }),
    );
    let (engine, mut rx) = engine(config, registry);
    let pool = Arc::new(VariablePool::new());
    pool.set(
        "inputs",
        "items",
        Segment::Array(vec![
            Segment::Integer(1),
            Segment::Integer(2),
            Segment::Integer(3),
        ]),
    );

    let outcome = engine.run(Arc::clone(&pool)).await;
    let RunOutcome::Succeeded { outputs } = outcome else {
        panic!("expected success, got {outcome:?}");
    };
    assert_eq!(outputs.get("squares"), Some(&json!([1, 4, 9])));

    let events = drain(&mut rx);
    let indices: Vec<usize> = events
        .iter()
        .filter_map(|e| match e {
            GraphEngineEvent::IterationRunNext { index, .. } => Some(*index),
            _ => None,
        })
        .collect();
    assert_eq!(indices, vec![0, 1, 2]);
    assert!(events
        .iter()
        .any(|e| matches!(e, GraphEngineEvent::IterationRunSucceeded { steps: 3, .. })));
    // Inner node events carry the container id.
    assert!(events.iter().any(|e| matches!(
        e,
        GraphEngineEvent::NodeRunStarted {
            meta: NodeEventMeta {
                node_id,
                in_iteration_id: Some(iter_id),
                ..
            },
            ..
        } if node_id == "sq" && iter_id == "iter"
    )));
}

#[tokio::test]
async fn iteration_skips_failing_elements_when_policy_continues() {
    let config = json!({
        "nodes": [
            {"id": "start", "data": {"type": "start"}},
            {"id": "iter", "data": {
                "type": "iteration",
                "iterator_selector": ["inputs", "items"],
                "output_selector": ["sq", "result"],
                "error_policy": "skip-and-continue"
            }},
            {"id": "sq", "data": {"type": "code", "iteration_id": "iter"}},
            {"id": "end", "data": {
                "type": "end",
                "outputs": [{"variable": "squares", "value_selector": ["iter", "output"]}]
            }}
        ],
        "edges": [
            {"source": "start", "target": "iter"},
            {"source": "iter", "target": "end"}
        ]
    });
    let registry = NodeRegistry::new().with_executor(
        NodeType::Code,
        Arc::new(SquareExecutor {
            container_id: "iter",
        }),
    );
    let (engine, mut rx) = engine(config, registry);
    let pool = Arc::new(VariablePool::new());
    pool.set(
        "inputs",
        "items",
        Segment::Array(vec![
            Segment::Integer(1),
            Segment::String("two".into()),
            Segment::Integer(3),
        ]),
    );

    let outcome = engine.run(pool).await;
    let RunOutcome::Succeeded { outputs } = outcome else {
        panic!("expected success, got {outcome:?}");
    };
    // The failing element leaves a hole; the rest still run.
    assert_eq!(outputs.get("squares"), Some(&json!([1, null, 9])));

    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, GraphEngineEvent::NodeRunFailed { meta, .. } if meta.node_id == "sq")));
    assert!(!events
        .iter()
        .any(|e| matches!(e, GraphEngineEvent::IterationRunFailed { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, GraphEngineEvent::IterationRunSucceeded { steps: 3, .. })));
    assert!(matches!(
        events.last(),
        Some(GraphEngineEvent::GraphRunSucceeded { .. })
    ));
}

#[tokio::test]
async fn loop_breaks_once_its_condition_holds() {
    let config = json!({
        "nodes": [
            {"id": "start", "data": {"type": "start"}},
            {"id": "loop", "data": {
                "type": "loop",
                "loop_count": 10,
                "break_conditions": [{
                    "variable_selector": ["acc", "total"],
                    "comparison_operator": "≥",
                    "value": 3
                }],
                "error_policy": "abort"
            }},
            {"id": "acc", "data": {"type": "code", "iteration_id": "loop"}},
            {"id": "end", "data": {
                "type": "end",
                "outputs": [{"variable": "total", "value_selector": ["acc", "total"]}]
            }}
        ],
        "edges": [
            {"source": "start", "target": "loop"},
            {"source": "loop", "target": "end"}
        ]
    });
    let registry = NodeRegistry::new().with_executor(NodeType::Code, Arc::new(CountUpExecutor));
    let (engine, mut rx) = engine(config, registry);
    let pool = Arc::new(VariablePool::new());

    let outcome = engine.run(Arc::clone(&pool)).await;
    let RunOutcome::Succeeded { outputs } = outcome else {
        panic!("expected success, got {outcome:?}");
    };
    // Three passes carry the counter to the break threshold, well short of
    // the declared count.
    assert_eq!(outputs.get("total"), Some(&json!(3)));
    assert_eq!(pool.get(&Selector::new(["acc", "total"])), Segment::Integer(3));

    let events = drain(&mut rx);
    let indices: Vec<usize> = events
        .iter()
        .filter_map(|e| match e {
            GraphEngineEvent::IterationRunNext { index, .. } => Some(*index),
            _ => None,
        })
        .collect();
    assert_eq!(indices, vec![0, 1, 2]);
    assert!(events
        .iter()
        .any(|e| matches!(e, GraphEngineEvent::IterationRunSucceeded { steps: 3, .. })));
}

#[tokio::test(start_paused = true)]
async fn parallel_branches_are_isolated_until_the_join() {
    let config = json!({
        "nodes": [
            {"id": "start", "data": {"type": "start"}},
            {"id": "x", "data": {"type": "code", "write": "from x", "probe": ["y", "value"]}},
            {"id": "y", "data": {"type": "code", "write": "from y", "probe": ["x", "value"]}},
            {"id": "join", "data": {"type": "template-transform",
                "template": "{{ x }} | {{ y }}",
                "variables": [
                    {"variable": "x", "value_selector": ["x", "value"]},
                    {"variable": "y", "value_selector": ["y", "value"]}
                ]
            }},
            {"id": "end", "data": {
                "type": "end",
                "outputs": [{"variable": "text", "value_selector": ["join", "output"]}]
            }}
        ],
        "edges": [
            {"source": "start", "target": "x"},
            {"source": "start", "target": "y"},
            {"source": "x", "target": "join"},
            {"source": "y", "target": "join"},
            {"source": "join", "target": "end"}
        ]
    });
    let registry = NodeRegistry::new().with_executor(NodeType::Code, Arc::new(ProbeWriteExecutor));
    let (engine, mut rx) = engine(config, registry);
    let pool = Arc::new(VariablePool::new());

    let outcome = engine.run(Arc::clone(&pool)).await;
    let RunOutcome::Succeeded { outputs } = outcome else {
        panic!("expected success, got {outcome:?}");
    };
    // Both branch writes are visible downstream of the join.
    assert_eq!(outputs.get("text"), Some(&json!("from x | from y")));
    // Neither branch saw the sibling's write while running.
    assert_eq!(
        pool.get(&Selector::new(["x", "sibling_seen"])),
        Segment::Boolean(false)
    );
    assert_eq!(
        pool.get(&Selector::new(["y", "sibling_seen"])),
        Segment::Boolean(false)
    );

    let events = drain(&mut rx);
    let branch_starts = events
        .iter()
        .filter(|e| matches!(e, GraphEngineEvent::ParallelBranchRunStarted { .. }))
        .count();
    let branch_successes = events
        .iter()
        .filter(|e| matches!(e, GraphEngineEvent::ParallelBranchRunSucceeded { .. }))
        .count();
    assert_eq!(branch_starts, 2);
    assert_eq!(branch_successes, 2);
    // The join node runs exactly once, after both branches.
    let join_runs = started_node_ids(&events)
        .into_iter()
        .filter(|id| id == "join")
        .count();
    assert_eq!(join_runs, 1);
}

#[tokio::test(start_paused = true)]
async fn failing_branch_aborts_the_fan_out_and_discards_sibling_output() {
    let config = json!({
        "nodes": [
            {"id": "start", "data": {"type": "start"}},
            {"id": "x", "data": {"type": "http-request"}},
            {"id": "y", "data": {"type": "template-transform", "template": "y output"}},
            {"id": "join", "data": {"type": "template-transform", "template": "joined"}},
            {"id": "end", "data": {"type": "end", "outputs": []}}
        ],
        "edges": [
            {"source": "start", "target": "x"},
            {"source": "start", "target": "y"},
            {"source": "x", "target": "join"},
            {"source": "y", "target": "join"},
            {"source": "join", "target": "end"}
        ]
    });
    let registry =
        NodeRegistry::new().with_executor(NodeType::HttpRequest, Arc::new(FailAfterDelay));
    let (engine, mut rx) = engine(config, registry);
    let pool = Arc::new(VariablePool::new());

    let outcome = engine.run(Arc::clone(&pool)).await;
    let RunOutcome::Failed { error } = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert!(error.contains("upstream service exploded"));

    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, GraphEngineEvent::ParallelBranchRunFailed { .. })));
    assert!(matches!(
        events.last(),
        Some(GraphEngineEvent::GraphRunFailed { .. })
    ));
    assert_eq!(terminal_count(&events), 1);
    // y finished before x failed, but its branch pool was never merged.
    assert!(!pool.has(&Selector::new(["y", "output"])));
    assert!(!started_node_ids(&events).contains(&"join".to_string()));
}

#[tokio::test]
async fn stop_between_nodes_lets_the_running_node_finish() {
    let config = json!({
        "nodes": [
            {"id": "start", "data": {"type": "start"}},
            {"id": "n1", "data": {"type": "tool"}},
            {"id": "n2", "data": {"type": "template-transform", "template": "never"}},
            {"id": "end", "data": {"type": "end", "outputs": []}}
        ],
        "edges": [
            {"source": "start", "target": "n1"},
            {"source": "n1", "target": "n2"},
            {"source": "n2", "target": "end"}
        ]
    });
    let graph = Arc::new(Graph::build(&config).expect("graph builds"));
    let (emitter, mut rx) = EventEmitter::channel();
    let stop = StopSignal::new();
    let registry = NodeRegistry::new().with_executor(
        NodeType::Tool,
        Arc::new(TriggerStopExecutor { stop: stop.clone() }),
    );
    let engine = Arc::new(GraphEngine::new(
        graph,
        Arc::new(registry),
        test_context(),
        EngineConfig::default(),
        emitter,
        stop,
    ));

    let outcome = engine.run(Arc::new(VariablePool::new())).await;
    assert!(matches!(
        outcome,
        RunOutcome::Stopped {
            reason: StopReason::UserRequested
        }
    ));

    let events = drain(&mut rx);
    // n1 completed normally despite the stop landing mid-run.
    assert!(events
        .iter()
        .any(|e| matches!(e, GraphEngineEvent::NodeRunSucceeded { meta, .. } if meta.node_id == "n1")));
    assert!(!started_node_ids(&events).contains(&"n2".to_string()));
    // The engine emits no terminal event on a stop; that is the queue's job.
    assert_eq!(terminal_count(&events), 0);
}
