use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::Agent;
use crate::core::task::{AttemptOutcome, ErrorKind, Task, TaskError, TaskStatus};
use crate::workflow::Workflow;
use crate::{Error, Result};

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Serialized engine state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub version: u32,
    pub taken_at: DateTime<Utc>,
    pub tasks: Vec<Task>,
    pub workflows: Vec<Workflow>,
    pub agents: Vec<Agent>,
}

impl EngineSnapshot {
    pub fn new(tasks: Vec<Task>, workflows: Vec<Workflow>, agents: Vec<Agent>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            taken_at: Utc::now(),
            tasks,
            workflows,
            agents,
        }
    }

    pub fn check_version(&self) -> Result<()> {
        if self.version != SNAPSHOT_VERSION {
            return Err(Error::UnsupportedSnapshot {
                found: self.version,
                expected: SNAPSHOT_VERSION,
            });
        }
        Ok(())
    }

    /// Return interrupted work to the ready queue.
    ///
    /// Assigned and running tasks lost their executor with the previous
    /// process. They go back to ready without spending retry budget, and
    /// the open attempt is closed as interrupted. Returns how many tasks
    /// were requeued.
    pub fn requeue_interrupted(&mut self) -> usize {
        let mut requeued = 0;
        for task in &mut self.tasks {
            if !task.status.holds_agent() {
                continue;
            }
            task.close_attempt(AttemptOutcome::Interrupted);
            task.status = TaskStatus::Ready;
            task.assigned_agent = None;
            task.not_before = None;
            task.error = Some(TaskError::new(
                ErrorKind::Interrupted,
                "engine stopped during attempt",
            ));
            requeued += 1;
        }
        requeued
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }
}
