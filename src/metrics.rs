//! Engine metrics.
//!
//! Metrics are computed on demand from registry snapshots; nothing here
//! mutates engine state.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::agent::Agent;
use crate::core::task::{Task, TaskStatus};

/// Point-in-time engine metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineMetrics {
    pub total_tasks: usize,
    pub pending_tasks: usize,
    pub ready_tasks: usize,
    /// Assigned or running.
    pub running_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub cancelled_tasks: usize,
    /// completed / (completed + failed); 0 when neither has happened.
    pub success_rate: f64,
    /// Mean of completed_at - started_at over completed tasks.
    #[serde(with = "duration_millis")]
    pub average_completion_time: Duration,
    /// Mean of load / capacity over registered agents.
    pub agent_utilization: f64,
    pub total_agents: usize,
    /// Agents with at least one task in flight.
    pub active_agents: usize,
    pub total_workflows: usize,
}

impl EngineMetrics {
    pub fn collect(tasks: &[Task], agents: &[Agent], total_workflows: usize) -> Self {
        let count = |status: TaskStatus| tasks.iter().filter(|t| t.status == status).count();
        let completed_tasks = count(TaskStatus::Completed);
        let failed_tasks = count(TaskStatus::Failed);

        let finished = completed_tasks + failed_tasks;
        let success_rate = if finished == 0 {
            0.0
        } else {
            completed_tasks as f64 / finished as f64
        };

        let durations: Vec<Duration> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .filter_map(Task::completion_time)
            .collect();
        let average_completion_time = if durations.is_empty() {
            Duration::ZERO
        } else {
            durations.iter().sum::<Duration>() / durations.len() as u32
        };

        let agent_utilization = if agents.is_empty() {
            0.0
        } else {
            agents.iter().map(Agent::utilization).sum::<f64>() / agents.len() as f64
        };

        Self {
            total_tasks: tasks.len(),
            pending_tasks: count(TaskStatus::Pending),
            ready_tasks: count(TaskStatus::Ready),
            running_tasks: count(TaskStatus::Assigned) + count(TaskStatus::Running),
            completed_tasks,
            failed_tasks,
            cancelled_tasks: count(TaskStatus::Cancelled),
            success_rate,
            average_completion_time,
            agent_utilization,
            total_agents: agents.len(),
            active_agents: agents.iter().filter(|a| a.load > 0).count(),
            total_workflows,
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
