//! Serde shapes for the run configuration document.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::NodeType;

/// Top-level graph document: a node list and an edge list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSchema {
    pub nodes: Vec<NodeSchema>,
    pub edges: Vec<EdgeSchema>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSchema {
    pub id: String,
    pub data: NodeData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeData {
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub title: String,
    /// Set on nodes living inside an iteration or loop container.
    #[serde(default)]
    pub iteration_id: Option<String>,
    /// Everything type-specific, passed through to the executor.
    #[serde(flatten)]
    pub extra: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeSchema {
    #[serde(default)]
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default, alias = "sourceHandle")]
    pub source_handle: Option<String>,
}
