//! Task data model for the orchestration engine.
//!
//! Tasks are the atomic units of work assigned to agents. Each task
//! tracks its status, assignment, retry budget, timing, and outcome.

use crate::agent::AgentId;
use crate::workflow::WorkflowId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a task.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Kind of work a task represents.
///
/// Task types double as capability tags: an agent services a task
/// only if it declares the task's type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Analysis,
    CodeGeneration,
    Testing,
    Refactoring,
    Documentation,
    Debugging,
    General,
}

impl TaskType {
    /// Every task type, in declaration order.
    pub const ALL: [TaskType; 7] = [
        TaskType::Analysis,
        TaskType::CodeGeneration,
        TaskType::Testing,
        TaskType::Refactoring,
        TaskType::Documentation,
        TaskType::Debugging,
        TaskType::General,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Analysis => "analysis",
            TaskType::CodeGeneration => "code_generation",
            TaskType::Testing => "testing",
            TaskType::Refactoring => "refactoring",
            TaskType::Documentation => "documentation",
            TaskType::Debugging => "debugging",
            TaskType::General => "general",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        TaskType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown task type: {}", s))
    }
}

/// Scheduling priority. Ordering is `Low < Normal < High < Critical`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

/// Task status in its lifecycle.
///
/// `Pending -> Ready -> Assigned -> Running -> {Completed | Failed | Cancelled}`,
/// with `Running -> Ready` on a retry and `Assigned -> Ready` when the
/// assigned agent disappeared before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting on at least one dependency.
    #[default]
    Pending,
    /// Dependencies satisfied, eligible for assignment.
    Ready,
    /// Claimed by the scheduler for an agent, not yet dispatched.
    Assigned,
    /// Dispatched to the agent's executor.
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Check if the status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether `self -> next` is a legal lifecycle transition.
    ///
    /// `Pending -> Pending` is allowed so a blocked task can be annotated
    /// without changing state.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Pending | Ready | Cancelled) => true,
            (Ready, Assigned | Cancelled) => true,
            (Assigned, Running | Ready | Cancelled) => true,
            (Running, Completed | Failed | Cancelled | Ready) => true,
            _ => false,
        }
    }

    /// Whether an agent is bound to the task in this status.
    pub fn holds_agent(&self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::Running)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Ready => write!(f, "ready"),
            TaskStatus::Assigned => write!(f, "assigned"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Category of a recorded task error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The attempt exceeded its deadline.
    Timeout,
    /// The executor reported a failure.
    Execution,
    /// An ancestor failed or was cancelled.
    DependencyFailed,
    /// Cancelled on request.
    Cancelled,
    /// The engine stopped while the attempt was in flight.
    Interrupted,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::Execution => write!(f, "execution"),
            ErrorKind::DependencyFailed => write!(f, "dependency_failed"),
            ErrorKind::Cancelled => write!(f, "cancelled"),
            ErrorKind::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Error recorded on a task record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// How a single execution attempt ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum AttemptOutcome {
    Succeeded,
    Failed { error: TaskError },
    Cancelled,
    Interrupted,
}

/// One execution attempt of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub agent_id: AgentId,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<AttemptOutcome>,
}

/// A task record as stored in the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// Submission sequence number; breaks `created_at` ties.
    pub seq: u64,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub description: String,
    pub priority: Priority,
    pub dependencies: BTreeSet<TaskId>,
    pub status: TaskStatus,
    pub assigned_agent: Option<AgentId>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Per-task deadline override for each attempt.
    pub timeout: Option<Duration>,
    /// Not eligible for assignment before this instant (retry backoff).
    pub not_before: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// First transition to running.
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<TaskError>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub attempts: Vec<Attempt>,
    pub workflow_id: Option<WorkflowId>,
}

impl Task {
    /// Build a pending record from a validated spec.
    pub(crate) fn from_spec(id: TaskId, seq: u64, spec: TaskSpec, max_retries: u32) -> Self {
        Self {
            id,
            seq,
            task_type: spec.task_type,
            description: spec.description,
            priority: spec.priority,
            dependencies: spec.dependencies,
            status: TaskStatus::Pending,
            assigned_agent: None,
            retry_count: 0,
            max_retries,
            timeout: spec.timeout,
            not_before: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            metadata: spec.metadata,
            attempts: Vec::new(),
            workflow_id: spec.workflow_id,
        }
    }

    /// Check if the task is in a terminal state.
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the retry budget allows another attempt.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Whether the task may be assigned at `now` (ready and past its backoff).
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Ready && self.not_before.map_or(true, |t| t <= now)
    }

    /// Wall time between first start and completion.
    pub fn completion_time(&self) -> Option<Duration> {
        let started = self.started_at?;
        let completed = self.completed_at?;
        (completed - started).to_std().ok()
    }

    /// The attempt currently in flight, if any.
    pub(crate) fn open_attempt_mut(&mut self) -> Option<&mut Attempt> {
        self.attempts
            .last_mut()
            .filter(|attempt| attempt.outcome.is_none())
    }

    /// Close the in-flight attempt with an outcome.
    pub(crate) fn close_attempt(&mut self, outcome: AttemptOutcome) {
        if let Some(attempt) = self.open_attempt_mut() {
            attempt.finished_at = Some(Utc::now());
            attempt.outcome = Some(outcome);
        }
    }
}

/// Submission payload for a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Caller-supplied id; generated when absent.
    pub id: Option<TaskId>,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,
    /// Falls back to the engine's `default_max_retries`.
    pub max_retries: Option<u32>,
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(skip)]
    pub(crate) workflow_id: Option<WorkflowId>,
}

impl TaskSpec {
    pub fn new(task_type: TaskType, description: impl Into<String>) -> Self {
        Self {
            id: None,
            task_type,
            description: description.into(),
            priority: Priority::Normal,
            dependencies: BTreeSet::new(),
            max_retries: None,
            timeout: None,
            metadata: serde_json::Value::Null,
            workflow_id: None,
        }
    }

    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, id: TaskId) -> Self {
        self.dependencies.insert(id);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Filter for listing tasks. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub task_type: Option<TaskType>,
    pub agent: Option<AgentId>,
    pub workflow: Option<WorkflowId>,
}

impl TaskFilter {
    pub fn with_status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn matches(&self, task: &Task) -> bool {
        self.status.map_or(true, |s| task.status == s)
            && self.task_type.map_or(true, |t| task.task_type == t)
            && self
                .agent
                .as_ref()
                .map_or(true, |a| task.assigned_agent.as_ref() == Some(a))
            && self.workflow.map_or(true, |w| task.workflow_id == Some(w))
    }
}
