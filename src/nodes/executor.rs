//! The polymorphic node contract.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{
    EventEmitter, GraphEngineEvent, NodeEventMeta, NodeRunStatus, RuntimeContext, Segment,
    Selector, VariablePool,
};
use crate::error::NodeError;
use crate::graph::{NodeSpec, SOURCE_HANDLE_DEFAULT};

/// Declared binding between a local variable name and an upstream selector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableMapping {
    pub variable: String,
    pub value_selector: Selector,
}

/// Parses the conventional `variables` list out of a node config.
pub fn parse_variable_mappings(config: &Value) -> Vec<VariableMapping> {
    config
        .get("variables")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}

/// Outcome of one executor run. Everything the engine wires back into the
/// pool and the event stream comes from here; executors have no other
/// output channel besides the stream sink.
#[derive(Debug, Clone)]
pub struct NodeRunResult {
    pub status: NodeRunStatus,
    pub inputs: Option<Value>,
    pub process_data: Option<Value>,
    pub outputs: HashMap<String, Segment>,
    pub metadata: Option<Value>,
    /// Handle selecting the outbound edge; branching executors overwrite it.
    pub edge_source_handle: String,
    /// Writes outside the node's own namespace, declared for the engine to
    /// apply at commit time (used by assigner nodes).
    pub variable_updates: Vec<(Selector, Segment)>,
    pub error: Option<String>,
}

impl Default for NodeRunResult {
    fn default() -> Self {
        Self {
            status: NodeRunStatus::Succeeded,
            inputs: None,
            process_data: None,
            outputs: HashMap::new(),
            metadata: None,
            edge_source_handle: SOURCE_HANDLE_DEFAULT.to_string(),
            variable_updates: Vec::new(),
            error: None,
        }
    }
}

impl NodeRunResult {
    pub fn success(outputs: HashMap<String, Segment>) -> Self {
        Self {
            outputs,
            ..Default::default()
        }
    }

    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.edge_source_handle = handle.into();
        self
    }
}

/// Emission channel handed to a running executor, pre-stamped with the
/// node's event meta so partial output reaches consumers in real time.
#[derive(Clone)]
pub struct NodeStreamSink {
    meta: NodeEventMeta,
    emitter: EventEmitter,
}

impl NodeStreamSink {
    pub fn new(meta: NodeEventMeta, emitter: EventEmitter) -> Self {
        Self { meta, emitter }
    }

    pub fn chunk(&self, text: impl Into<String>, from_variable_selector: Option<Selector>) {
        self.emitter.emit(GraphEngineEvent::NodeRunStreamChunk {
            meta: self.meta.clone(),
            chunk: text.into(),
            from_variable_selector: from_variable_selector.map(|s| s.0),
        });
    }

    pub fn retriever_resources(&self, retriever_resources: Vec<Value>, context: String) {
        self.emitter.emit(GraphEngineEvent::NodeRunRetrieverResources {
            meta: self.meta.clone(),
            retriever_resources,
            context,
        });
    }
}

/// One implementation per node type tag. Executors read only the pool and
/// their config, and report failure through `Err` or a failed status.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    async fn run(
        &self,
        node: &NodeSpec,
        pool: &VariablePool,
        ctx: &RuntimeContext,
        sink: &NodeStreamSink,
    ) -> Result<NodeRunResult, NodeError>;

    /// Upstream selectors this node reads, keyed by local variable name.
    /// Lets the engine pre-resolve inputs and re-execute a single node.
    fn extract_variable_mapping(&self, config: &Value) -> Vec<VariableMapping> {
        parse_variable_mappings(config)
    }
}
