use thiserror::Error;

use crate::agent::AgentId;
use crate::core::task::{TaskError, TaskId, TaskStatus, TaskType};
use crate::workflow::WorkflowId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict on task {task_id}: expected {expected}, found {actual}")]
    Conflict {
        task_id: TaskId,
        expected: TaskStatus,
        actual: TaskStatus,
    },

    #[error("No agent available for {0} tasks")]
    AgentUnavailable(TaskType),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Execution error: {message}")]
    Execution { message: String, retryable: bool },

    #[error("Task {task_id} failed permanently: {error}")]
    PermanentFailure { task_id: TaskId, error: TaskError },

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),

    #[error("Agent already registered: {0}")]
    AgentExists(AgentId),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(WorkflowId),

    #[error("Unsupported snapshot version {found} (expected {expected})")]
    UnsupportedSnapshot { found: u32, expected: u32 },

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

impl Error {
    /// Whether the error is a lost compare-and-set race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
