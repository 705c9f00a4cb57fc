//! Compile-time executor factory.
//!
//! Every [`NodeType`] tag resolves through one exhaustive `match`, so a new
//! tag fails to compile until it is wired here. Callers inject real
//! implementations for the externally-serviced types per run.

use std::collections::HashMap;
use std::sync::Arc;

use crate::graph::NodeType;

use super::control_flow::{
    AnswerExecutor, ContainerExecutor, EndExecutor, IfElseExecutor, IterationStartExecutor,
    StartExecutor,
};
use super::executor::NodeExecutor;
use super::stubs::{QuestionClassifierStub, StubExecutor};
use super::transform::{
    ConversationVariableAssignerExecutor, TemplateTransformExecutor, VariableAggregatorExecutor,
};

#[derive(Default)]
pub struct NodeRegistry {
    overrides: HashMap<NodeType, Arc<dyn NodeExecutor>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the executor for one type, typically a collaborator-backed
    /// implementation of llm, http-request, tool and friends.
    pub fn with_executor(mut self, node_type: NodeType, executor: Arc<dyn NodeExecutor>) -> Self {
        self.overrides.insert(node_type, executor);
        self
    }

    pub fn resolve(&self, node_type: NodeType) -> Arc<dyn NodeExecutor> {
        if let Some(executor) = self.overrides.get(&node_type) {
            return Arc::clone(executor);
        }
        Self::builtin(node_type)
    }

    fn builtin(node_type: NodeType) -> Arc<dyn NodeExecutor> {
        match node_type {
            NodeType::Start => Arc::new(StartExecutor),
            NodeType::End => Arc::new(EndExecutor),
            NodeType::Answer => Arc::new(AnswerExecutor),
            NodeType::IfElse => Arc::new(IfElseExecutor),
            NodeType::TemplateTransform => Arc::new(TemplateTransformExecutor),
            NodeType::VariableAggregator | NodeType::VariableAssigner => {
                Arc::new(VariableAggregatorExecutor)
            }
            NodeType::ConversationVariableAssigner => {
                Arc::new(ConversationVariableAssignerExecutor)
            }
            NodeType::IterationStart => Arc::new(IterationStartExecutor),
            NodeType::Iteration | NodeType::Loop => Arc::new(ContainerExecutor),
            NodeType::QuestionClassifier => Arc::new(QuestionClassifierStub),
            NodeType::Llm => Arc::new(StubExecutor::new("llm")),
            NodeType::KnowledgeRetrieval => Arc::new(StubExecutor::new("knowledge-retrieval")),
            NodeType::Code => Arc::new(StubExecutor::new("code")),
            NodeType::HttpRequest => Arc::new(StubExecutor::new("http-request")),
            NodeType::Tool => Arc::new(StubExecutor::new("tool")),
            NodeType::ParameterExtractor => Arc::new(StubExecutor::new("parameter-extractor")),
        }
    }
}
