//! Core domain errors.

use thiserror::Error;

/// Core domain errors for TaskMesh.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Task not registered in the graph.
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// A local task with the same name is already registered.
    #[error("Task already registered: {0}")]
    DuplicateTask(String),

    /// Malformed task or graph reference.
    #[error("Invalid task definition: {0}")]
    InvalidDefinition(String),

    /// A required incoming property has no value.
    #[error("Task '{task}' is missing required parameter '{parameter}'")]
    MissingParameter { task: String, parameter: String },

    /// Access policy denies the task.
    #[error("Access denied for task: {0}")]
    AccessDenied(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
