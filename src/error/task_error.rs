use thiserror::Error;

/// Queue-contract violations raised synchronously to the publisher,
/// unlike node errors which travel as structured events.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Task stopped: publish rejected after stop flag was observed")]
    Stopped,
    #[error("Queue closed: a terminal event was already published")]
    QueueClosed,
    #[error("Resource safety violation: {0}")]
    ResourceSafetyViolation(String),
    #[error("User identity is required to create a task")]
    MissingUser,
}
