//! Error taxonomy: run-level, node-level and queue-contract errors.

mod node_error;
mod pipeline_error;
mod task_error;
mod workflow_error;

pub use node_error::NodeError;
pub use pipeline_error::PipelineError;
pub use task_error::TaskError;
pub use workflow_error::WorkflowError;

pub type WorkflowResult<T> = Result<T, WorkflowError>;
