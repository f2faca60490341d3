//! Agent identity, roles and capability matching.
//!
//! Agents are capability-bearing worker identities. The engine never
//! looks inside them: it matches a task's type against the agent's
//! declared capability set and hands the work to the executor bound to
//! the agent's id.

use crate::core::task::TaskType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Caller-chosen agent identifier. Ordering is the final scheduling tie-break.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Closed set of agent roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Orchestrator,
    Planner,
    Implementer,
    Verifier,
    Reviewer,
    Researcher,
}

impl AgentRole {
    /// Capabilities assumed when a descriptor declares none.
    pub fn default_capabilities(&self) -> BTreeSet<TaskType> {
        use TaskType::*;
        let tags: &[TaskType] = match self {
            AgentRole::Orchestrator => &[General],
            AgentRole::Planner => &[Analysis, Documentation],
            AgentRole::Implementer => &[CodeGeneration, Refactoring],
            AgentRole::Verifier => &[Testing, Debugging],
            AgentRole::Reviewer => &[Analysis, Refactoring, Documentation],
            AgentRole::Researcher => &[Analysis, Documentation, General],
        };
        tags.iter().copied().collect()
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentRole::Orchestrator => write!(f, "orchestrator"),
            AgentRole::Planner => write!(f, "planner"),
            AgentRole::Implementer => write!(f, "implementer"),
            AgentRole::Verifier => write!(f, "verifier"),
            AgentRole::Reviewer => write!(f, "reviewer"),
            AgentRole::Researcher => write!(f, "researcher"),
        }
    }
}

/// Agent availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Idle,
    Busy,
    Error,
    Offline,
}

impl AgentStatus {
    /// Whether the agent may receive new work.
    pub fn accepts_work(&self) -> bool {
        matches!(self, AgentStatus::Idle | AgentStatus::Busy)
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Idle => write!(f, "idle"),
            AgentStatus::Busy => write!(f, "busy"),
            AgentStatus::Error => write!(f, "error"),
            AgentStatus::Offline => write!(f, "offline"),
        }
    }
}

/// Registration payload for an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub id: AgentId,
    pub role: AgentRole,
    /// Empty means "use the role's defaults".
    #[serde(default)]
    pub capabilities: BTreeSet<TaskType>,
    #[serde(default = "default_capacity")]
    pub capacity: u32,
}

fn default_capacity() -> u32 {
    1
}

impl AgentDescriptor {
    pub fn new(id: impl Into<String>, role: AgentRole) -> Self {
        Self {
            id: AgentId::new(id),
            role,
            capabilities: BTreeSet::new(),
            capacity: 1,
        }
    }

    pub fn capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn capability(mut self, task_type: TaskType) -> Self {
        self.capabilities.insert(task_type);
        self
    }
}

/// An agent record as held by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub role: AgentRole,
    pub capabilities: BTreeSet<TaskType>,
    pub capacity: u32,
    /// Active task count, maintained by the engine.
    pub load: u32,
    /// Last load the agent itself reported through a heartbeat.
    pub reported_load: Option<u32>,
    pub performance_score: f64,
    pub status: AgentStatus,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub completed_count: u64,
    pub failed_count: u64,
}

impl Agent {
    pub(crate) fn from_descriptor(descriptor: AgentDescriptor, initial_score: f64) -> Self {
        let capabilities = if descriptor.capabilities.is_empty() {
            descriptor.role.default_capabilities()
        } else {
            descriptor.capabilities
        };
        let now = Utc::now();
        Self {
            id: descriptor.id,
            role: descriptor.role,
            capabilities,
            capacity: descriptor.capacity,
            load: 0,
            reported_load: None,
            performance_score: initial_score,
            status: AgentStatus::Idle,
            registered_at: now,
            last_heartbeat: now,
            completed_count: 0,
            failed_count: 0,
        }
    }

    /// Whether the agent declares the task type.
    pub fn services(&self, task_type: TaskType) -> bool {
        self.capabilities.contains(&task_type)
    }

    pub fn has_capacity(&self) -> bool {
        self.load < self.capacity
    }

    /// Whether the agent can take one more task right now.
    pub fn is_available(&self) -> bool {
        self.status.accepts_work() && self.has_capacity()
    }

    /// Fraction of capacity in use.
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        f64::from(self.load) / f64::from(self.capacity)
    }

    /// Fold one attempt outcome into the performance score.
    pub(crate) fn apply_outcome(&mut self, alpha: f64, success: bool) {
        let outcome = if success { 1.0 } else { 0.0 };
        self.performance_score = alpha * outcome + (1.0 - alpha) * self.performance_score;
        if success {
            self.completed_count += 1;
        } else {
            self.failed_count += 1;
        }
    }

    /// Recompute idle/busy from load, leaving error/offline untouched.
    pub(crate) fn refresh_status(&mut self) {
        if self.status.accepts_work() {
            self.status = if self.load == 0 {
                AgentStatus::Idle
            } else {
                AgentStatus::Busy
            };
        }
    }
}
