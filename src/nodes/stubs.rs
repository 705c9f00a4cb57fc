//! Placeholder executors for node types whose business logic lives
//! outside this crate. Real deployments inject their own executors via
//! [`super::NodeRegistry::with_executor`]; the stubs keep graph wiring
//! runnable without them.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::{RuntimeContext, Segment, VariablePool};
use crate::error::NodeError;
use crate::graph::NodeSpec;

use super::executor::{NodeExecutor, NodeRunResult, NodeStreamSink};

/// Succeeds with a fixed placeholder output naming the serviced type.
pub struct StubExecutor {
    type_name: &'static str,
}

impl StubExecutor {
    pub fn new(type_name: &'static str) -> Self {
        Self { type_name }
    }
}

#[async_trait]
impl NodeExecutor for StubExecutor {
    async fn run(
        &self,
        node: &NodeSpec,
        _pool: &VariablePool,
        _ctx: &RuntimeContext,
        _sink: &NodeStreamSink,
    ) -> Result<NodeRunResult, NodeError> {
        tracing::debug!(node_id = %node.id, node_type = self.type_name, "stub executor invoked");
        Ok(NodeRunResult::success(HashMap::from([(
            "result".to_string(),
            Segment::String(format!("[stub:{}]", self.type_name)),
        )])))
    }
}

/// Stub for question-classifier: routes to the first declared class so
/// branch wiring stays exercisable without a model behind it.
pub struct QuestionClassifierStub;

#[async_trait]
impl NodeExecutor for QuestionClassifierStub {
    async fn run(
        &self,
        node: &NodeSpec,
        _pool: &VariablePool,
        _ctx: &RuntimeContext,
        _sink: &NodeStreamSink,
    ) -> Result<NodeRunResult, NodeError> {
        let first_class = node
            .data
            .get("classes")
            .and_then(Value::as_array)
            .and_then(|classes| classes.first())
            .and_then(|class| class.get("id"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                NodeError::ConfigError("question-classifier node requires `classes`".to_string())
            })?;
        let mut result = NodeRunResult::default().with_handle(first_class);
        result.outputs.insert(
            "class_name".to_string(),
            Segment::String(first_class.to_string()),
        );
        Ok(result)
    }
}
