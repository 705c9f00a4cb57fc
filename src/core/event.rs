//! Engine lifecycle events.
//!
//! One closed sum type covers graph, node, parallel-branch and iteration
//! transitions; consumers match it exhaustively. Every node-scoped event
//! carries [`NodeEventMeta`] so it is self-describing to a remote consumer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::graph::NodeType;

/// Lifecycle of one node execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Stopped,
}

/// Per-node-execution record, finalized on completion and carried by the
/// success/failure events. `run_index` is monotonic across the whole run
/// and orders events causally within a branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteNodeState {
    pub id: String,
    pub node_id: String,
    pub status: NodeRunStatus,
    pub start_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub run_index: u64,
}

/// Identity of one parallel branch, nested via the parent fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelScope {
    pub parallel_id: String,
    pub parallel_start_node_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_parallel_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_parallel_start_node_id: Option<String>,
}

impl ParallelScope {
    /// Scope for a branch forked underneath an existing scope.
    pub fn child(parent: Option<&ParallelScope>, parallel_id: String, start_node_id: String) -> Self {
        Self {
            parallel_id,
            parallel_start_node_id: start_node_id,
            parent_parallel_id: parent.map(|p| p.parallel_id.clone()),
            parent_parallel_start_node_id: parent.map(|p| p.parallel_start_node_id.clone()),
        }
    }
}

/// Required fields for every node-scoped event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEventMeta {
    pub node_execution_id: String,
    pub node_id: String,
    pub node_type: NodeType,
    pub start_at: DateTime<Utc>,
    #[serde(flatten)]
    pub parallel: Option<ParallelScope>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_iteration_id: Option<String>,
}

/// Identity of one iteration (or loop) container execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationScope {
    pub iteration_execution_id: String,
    pub iteration_node_id: String,
    pub iteration_node_type: NodeType,
    #[serde(flatten)]
    pub parallel: Option<ParallelScope>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GraphEngineEvent {
    GraphRunStarted,
    GraphRunSucceeded {
        outputs: HashMap<String, Value>,
    },
    GraphRunFailed {
        error: String,
    },
    NodeRunStarted {
        #[serde(flatten)]
        meta: NodeEventMeta,
        #[serde(skip_serializing_if = "Option::is_none")]
        predecessor_node_id: Option<String>,
    },
    NodeRunStreamChunk {
        #[serde(flatten)]
        meta: NodeEventMeta,
        chunk: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        from_variable_selector: Option<Vec<String>>,
    },
    NodeRunRetrieverResources {
        #[serde(flatten)]
        meta: NodeEventMeta,
        retriever_resources: Vec<Value>,
        context: String,
    },
    NodeRunSucceeded {
        #[serde(flatten)]
        meta: NodeEventMeta,
        state: RouteNodeState,
    },
    NodeRunFailed {
        #[serde(flatten)]
        meta: NodeEventMeta,
        state: RouteNodeState,
        error: String,
    },
    ParallelBranchRunStarted {
        #[serde(flatten)]
        scope: ParallelScope,
    },
    ParallelBranchRunSucceeded {
        #[serde(flatten)]
        scope: ParallelScope,
    },
    ParallelBranchRunFailed {
        #[serde(flatten)]
        scope: ParallelScope,
        error: String,
    },
    IterationRunStarted {
        #[serde(flatten)]
        scope: IterationScope,
        start_at: DateTime<Utc>,
        #[serde(skip_serializing_if = "Option::is_none")]
        inputs: Option<Value>,
    },
    IterationRunNext {
        #[serde(flatten)]
        scope: IterationScope,
        index: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        pre_iteration_output: Option<Value>,
    },
    IterationRunSucceeded {
        #[serde(flatten)]
        scope: IterationScope,
        start_at: DateTime<Utc>,
        #[serde(skip_serializing_if = "Option::is_none")]
        outputs: Option<Value>,
        steps: usize,
    },
    IterationRunFailed {
        #[serde(flatten)]
        scope: IterationScope,
        start_at: DateTime<Utc>,
        error: String,
        steps: usize,
    },
}

impl GraphEngineEvent {
    /// Terminal events end the run; exactly one reaches the consumer.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GraphEngineEvent::GraphRunSucceeded { .. } | GraphEngineEvent::GraphRunFailed { .. }
        )
    }
}

/// Fan-in point for engine events. Cloneable across branch tasks; emission
/// after the consumer side is dropped is silently discarded.
#[derive(Clone)]
pub struct EventEmitter {
    tx: mpsc::UnboundedSender<GraphEngineEvent>,
    active: Arc<AtomicBool>,
}

impl EventEmitter {
    pub fn channel() -> (EventEmitter, mpsc::UnboundedReceiver<GraphEngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            EventEmitter {
                tx,
                active: Arc::new(AtomicBool::new(true)),
            },
            rx,
        )
    }

    pub fn emit(&self, event: GraphEngineEvent) {
        if !self.active.load(Ordering::SeqCst) {
            return;
        }
        if self.tx.send(event).is_err() {
            self.active.store(false, Ordering::SeqCst);
        }
    }
}
