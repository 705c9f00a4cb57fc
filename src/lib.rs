//! # Tideflow — a workflow execution core
//!
//! `tideflow` executes directed-acyclic-graph workflows of the kind an LLM
//! application backend drives: a graph of typed nodes wired by handles,
//! fed from a namespaced variable pool, streamed to a consumer as a
//! tagged event sequence. It implements:
//!
//! - **Graph model**: schema parsing, start-node discovery, branch handles,
//!   container subgraphs for iteration and loop bodies.
//! - **Engine**: sequential scheduling with short-circuit branching,
//!   parallel fan-out with branch-isolated variable scopes and a barrier
//!   join, step and wall-clock budgets, cooperative stop.
//! - **Node executors**: start, end, answer, if-else, template transform,
//!   aggregation, variable assignment, plus stand-ins for the model-backed
//!   node types.
//! - **Task queue**: per-task event streaming with keep-alive pings, a
//!   KV-backed ownership and stop-flag protocol, and payload safety
//!   checks on publication.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use serde_json::json;
//! use tideflow::{InvokeFrom, WorkflowTask};
//!
//! #[tokio::main]
//! async fn main() {
//!     let schema = json!({
//!         "nodes": [
//!             {"id": "start", "data": {"type": "start"}},
//!             {"id": "end", "data": {"type": "end"}}
//!         ],
//!         "edges": [{"source": "start", "target": "end"}]
//!     });
//!     let handle = WorkflowTask::new(schema)
//!         .user("user-1", InvokeFrom::Debugger)
//!         .start()
//!         .await
//!         .unwrap();
//!     let mut events = handle.listen().unwrap();
//!     while let Some(event) = events.next().await {
//!         println!("{}", serde_json::to_string(&event).unwrap());
//!     }
//! }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod evaluator;
pub mod graph;
pub mod nodes;
pub mod pipeline;
pub mod queue;

pub use crate::config::{EngineConfig, QueueConfig};
pub use crate::core::{
    EventEmitter, FakeIdGenerator, FakeTimeProvider, GraphEngine, GraphEngineEvent, IdGenerator,
    RealIdGenerator, RealTimeProvider, RouteNodeState, RunOutcome, RuntimeContext, Segment,
    Selector, StopReason, StopSignal, TimeProvider, VariablePool,
};
pub use crate::error::{NodeError, PipelineError, TaskError, WorkflowError, WorkflowResult};
pub use crate::graph::{Graph, NodeType};
pub use crate::nodes::{NodeExecutor, NodeRegistry, NodeRunResult};
pub use crate::pipeline::{WorkflowTask, WorkflowTaskHandle};
pub use crate::queue::{
    AppQueueManager, ControlEvent, InMemoryKvStore, InvokeFrom, KvStore, PublishFrom, QueueEvent,
    QueueListener,
};
