//! Agent execution contract.
//!
//! The engine never looks at how an agent produces its result. Each
//! registered agent is bound to one `AgentExecutor`, which receives a
//! `TaskDescriptor` and a cancellation token and eventually returns an
//! opaque JSON result or an `ExecutionError`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::agent::AgentId;
use crate::core::task::{Priority, Task, TaskId, TaskType};

/// What an executor gets to see of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub description: String,
    pub priority: Priority,
    /// 1-based attempt number.
    pub attempt: u32,
    pub agent_id: AgentId,
    pub metadata: serde_json::Value,
}

impl TaskDescriptor {
    pub(crate) fn for_attempt(task: &Task, agent_id: AgentId) -> Self {
        Self {
            task_id: task.id,
            task_type: task.task_type,
            description: task.description.clone(),
            priority: task.priority,
            attempt: task.attempts.len() as u32,
            agent_id,
            metadata: task.metadata.clone(),
        }
    }
}

/// Failure reported by an executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub message: String,
    /// Whether another attempt could succeed.
    pub retryable: bool,
}

impl ExecutionError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ExecutionError {}

impl From<ExecutionError> for crate::Error {
    fn from(err: ExecutionError) -> Self {
        crate::Error::Execution {
            message: err.message,
            retryable: err.retryable,
        }
    }
}

/// Trait for agent executors.
///
/// Implementations must be thread-safe (Send + Sync) for use across tasks.
/// The future may be dropped at any await point when the task is cancelled
/// or times out; `cancel` lets long-running work stop cooperatively.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(
        &self,
        task: TaskDescriptor,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value, ExecutionError>;
}

/// Executors bound to agent ids.
#[derive(Default)]
pub struct ExecutorSet {
    executors: RwLock<HashMap<AgentId, Arc<dyn AgentExecutor>>>,
}

impl ExecutorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, agent_id: AgentId, executor: Arc<dyn AgentExecutor>) {
        self.executors.write().insert(agent_id, executor);
    }

    pub fn unbind(&self, agent_id: &AgentId) -> Option<Arc<dyn AgentExecutor>> {
        self.executors.write().remove(agent_id)
    }

    pub fn get(&self, agent_id: &AgentId) -> Option<Arc<dyn AgentExecutor>> {
        self.executors.read().get(agent_id).cloned()
    }
}

/// Executor that sleeps for a fixed latency and returns a canned result.
///
/// The first `fail_attempts` attempts of every task fail with a retryable
/// error, which makes retry paths easy to exercise from plan files.
pub struct SimulatedExecutor {
    latency: Duration,
    fail_attempts: u32,
    permanent: bool,
    seen: Mutex<HashMap<TaskId, u32>>,
}

impl SimulatedExecutor {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            fail_attempts: 0,
            permanent: false,
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn failing_first(mut self, attempts: u32) -> Self {
        self.fail_attempts = attempts;
        self
    }

    /// Make forced failures non-retryable.
    pub fn permanent_failures(mut self) -> Self {
        self.permanent = true;
        self
    }
}

#[async_trait]
impl AgentExecutor for SimulatedExecutor {
    async fn execute(
        &self,
        task: TaskDescriptor,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value, ExecutionError> {
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(ExecutionError::permanent("cancelled"));
            }
            _ = tokio::time::sleep(self.latency) => {}
        }

        let attempt = {
            let mut seen = self.seen.lock();
            let count = seen.entry(task.task_id).or_insert(0);
            *count += 1;
            *count
        };
        if attempt <= self.fail_attempts {
            let message = format!("simulated failure on attempt {}", attempt);
            return Err(if self.permanent {
                ExecutionError::permanent(message)
            } else {
                ExecutionError::retryable(message)
            });
        }
        Ok(serde_json::json!({
            "agent": task.agent_id,
            "task_type": task.task_type,
            "attempt": attempt,
            "summary": format!("{} done", task.description),
        }))
    }
}
