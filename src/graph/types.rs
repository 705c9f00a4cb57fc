use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed set of node type tags. Adding a tag means touching every
/// exhaustive match, which is the point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeType {
    Start,
    End,
    Answer,
    Llm,
    KnowledgeRetrieval,
    IfElse,
    Code,
    TemplateTransform,
    QuestionClassifier,
    HttpRequest,
    Tool,
    VariableAggregator,
    VariableAssigner,
    Loop,
    Iteration,
    IterationStart,
    ParameterExtractor,
    ConversationVariableAssigner,
}

impl NodeType {
    /// Branching nodes select exactly one outbound edge handle.
    pub fn is_branch(&self) -> bool {
        matches!(self, NodeType::IfElse | NodeType::QuestionClassifier)
    }

    /// Container nodes own an inner subgraph executed by the engine.
    pub fn is_container(&self) -> bool {
        matches!(self, NodeType::Iteration | NodeType::Loop)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Start => "start",
            NodeType::End => "end",
            NodeType::Answer => "answer",
            NodeType::Llm => "llm",
            NodeType::KnowledgeRetrieval => "knowledge-retrieval",
            NodeType::IfElse => "if-else",
            NodeType::Code => "code",
            NodeType::TemplateTransform => "template-transform",
            NodeType::QuestionClassifier => "question-classifier",
            NodeType::HttpRequest => "http-request",
            NodeType::Tool => "tool",
            NodeType::VariableAggregator => "variable-aggregator",
            NodeType::VariableAssigner => "variable-assigner",
            NodeType::Loop => "loop",
            NodeType::Iteration => "iteration",
            NodeType::IterationStart => "iteration-start",
            NodeType::ParameterExtractor => "parameter-extractor",
            NodeType::ConversationVariableAssigner => "conversation-variable-assigner",
        }
    }
}

/// What a container does when one pass of its body fails. Required on
/// every iteration and loop node; there is no implied default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IterationErrorPolicy {
    Abort,
    SkipAndContinue,
}

/// Immutable description of one node, parsed from the run configuration.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub id: String,
    pub node_type: NodeType,
    pub title: String,
    /// Type-specific configuration, interpreted by the node's executor.
    pub data: Value,
    /// Membership in an enclosing iteration or loop container.
    pub iteration_id: Option<String>,
}

/// Default handle for unconditional edges.
pub const SOURCE_HANDLE_DEFAULT: &str = "source";

#[derive(Debug, Clone)]
pub struct Edge {
    pub id: String,
    pub source: String,
    pub target: String,
    /// Conditional handle set by branching source nodes; `None` or
    /// `"source"` means the edge is always taken.
    pub source_handle: Option<String>,
}

impl Edge {
    pub fn is_unconditional(&self) -> bool {
        match self.source_handle.as_deref() {
            None => true,
            Some(handle) => handle == SOURCE_HANDLE_DEFAULT,
        }
    }

    pub fn matches_handle(&self, handle: &str) -> bool {
        self.source_handle.as_deref() == Some(handle)
    }
}
