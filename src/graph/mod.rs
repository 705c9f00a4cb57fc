//! Immutable graph model: configuration schema, node/edge types and the
//! builder with subgraph extraction for container nodes.

mod builder;
mod schema;
mod types;

pub use builder::Graph;
pub use schema::{EdgeSchema, GraphSchema, NodeData, NodeSchema};
pub use types::{Edge, IterationErrorPolicy, NodeSpec, NodeType, SOURCE_HANDLE_DEFAULT};
