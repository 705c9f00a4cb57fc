//! Run-level error types.

use super::NodeError;
use crate::core::StopReason;
use thiserror::Error;

/// Errors surfaced by graph construction and the engine run loop.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Graph config error: {0}")]
    GraphConfigError(String),
    #[error("Graph config error: `{0}` is missing or not a list")]
    MissingSection(&'static str),
    #[error("Duplicate node id: {0}")]
    DuplicateNodeId(String),
    #[error("Edge `{edge_id}` references unknown node: {node_id}")]
    DanglingEdge { edge_id: String, node_id: String },
    #[error("Root node not found: {0}")]
    RootNodeNotFound(String),
    #[error("Node not found: {0}")]
    NodeNotFound(String),
    #[error("No start node found")]
    NoStartNode,
    #[error("Multiple start nodes found")]
    MultipleStartNodes,
    #[error("Max steps exceeded: {0}")]
    MaxStepsExceeded(u64),
    #[error("Run stopped: {0}")]
    Stopped(StopReason),
    #[error("Node execution error: node={node_id}, error={error}")]
    NodeExecutionError { node_id: String, error: String },
    #[error("Node error: {0}")]
    NodeError(Box<NodeError>),
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<NodeError> for WorkflowError {
    fn from(value: NodeError) -> Self {
        WorkflowError::NodeError(Box::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_error_display() {
        assert_eq!(
            WorkflowError::MissingSection("nodes").to_string(),
            "Graph config error: `nodes` is missing or not a list"
        );
        assert_eq!(
            WorkflowError::DanglingEdge {
                edge_id: "e1".into(),
                node_id: "ghost".into()
            }
            .to_string(),
            "Edge `e1` references unknown node: ghost"
        );
        assert_eq!(
            WorkflowError::MaxStepsExceeded(500).to_string(),
            "Max steps exceeded: 500"
        );
        assert_eq!(
            WorkflowError::NodeExecutionError {
                node_id: "llm-1".into(),
                error: "boom".into()
            }
            .to_string(),
            "Node execution error: node=llm-1, error=boom"
        );
    }

    #[test]
    fn test_node_error_lift() {
        let err: WorkflowError = NodeError::ConfigError("bad".into()).into();
        assert!(matches!(err, WorkflowError::NodeError(_)));
    }
}
