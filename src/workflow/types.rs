//! Core workflow type definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::WorkflowFailurePolicy;
use crate::core::task::{TaskId, TaskStatus};

/// Unique identifier for a workflow instance.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(pub Uuid);

impl WorkflowId {
    /// Create a new unique workflow identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for WorkflowId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// How the members of a workflow relate to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowMode {
    /// Each member depends on the one before it.
    #[default]
    Sequential,
    /// Members share no edges beyond their own dependencies.
    Parallel,
}

impl std::fmt::Display for WorkflowMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowMode::Sequential => write!(f, "sequential"),
            WorkflowMode::Parallel => write!(f, "parallel"),
        }
    }
}

/// Aggregate status of a workflow, derived from its members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Some member is still in progress
    #[default]
    Running,
    /// Every member completed
    Completed,
    /// A member failed
    Failed,
    /// Every member is terminal, none failed, at least one was cancelled
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkflowStatus::Running)
    }

    /// Derive the aggregate status from member statuses.
    pub fn derive(policy: WorkflowFailurePolicy, members: &[TaskStatus]) -> Self {
        let all_terminal = members.iter().all(|s| s.is_terminal());
        let any_failed = members.contains(&TaskStatus::Failed);

        if any_failed && (policy == WorkflowFailurePolicy::FailFast || all_terminal) {
            return WorkflowStatus::Failed;
        }
        if !all_terminal {
            return WorkflowStatus::Running;
        }
        if members.contains(&TaskStatus::Cancelled) {
            WorkflowStatus::Cancelled
        } else {
            WorkflowStatus::Completed
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Running => write!(f, "running"),
            WorkflowStatus::Completed => write!(f, "completed"),
            WorkflowStatus::Failed => write!(f, "failed"),
            WorkflowStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A named group of tasks.
///
/// Status is never stored; only whether the terminal event was published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    pub task_ids: Vec<TaskId>,
    pub mode: WorkflowMode,
    pub failure_policy: WorkflowFailurePolicy,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub(crate) announced: bool,
}

impl Workflow {
    pub fn new(
        name: impl Into<String>,
        mode: WorkflowMode,
        failure_policy: WorkflowFailurePolicy,
    ) -> Self {
        Self {
            id: WorkflowId::new(),
            name: name.into(),
            task_ids: Vec::new(),
            mode,
            failure_policy,
            metadata: serde_json::Value::Null,
            created_at: Utc::now(),
            announced: false,
        }
    }
}

/// Point-in-time view of a workflow with its derived status.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowView {
    pub id: WorkflowId,
    pub name: String,
    pub mode: WorkflowMode,
    pub status: WorkflowStatus,
    pub task_ids: Vec<TaskId>,
    pub member_statuses: Vec<TaskStatus>,
    pub created_at: DateTime<Utc>,
}

impl WorkflowView {
    pub fn completed_count(&self) -> usize {
        self.member_statuses
            .iter()
            .filter(|s| **s == TaskStatus::Completed)
            .count()
    }
}
