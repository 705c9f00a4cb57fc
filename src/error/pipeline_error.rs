use thiserror::Error;

use super::{TaskError, WorkflowError};

/// Failures surfaced while assembling or starting a task pipeline, before
/// any event reaches the consumer stream.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
    #[error(transparent)]
    Task(#[from] TaskError),
}
