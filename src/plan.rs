//! TOML plan files.
//!
//! A plan lists agents, each backed by a simulated executor, and tasks that
//! refer to each other by key:
//!
//! ```toml
//! [[agents]]
//! id = "impl-1"
//! role = "implementer"
//! capacity = 2
//! latency_ms = 100
//!
//! [[tasks]]
//! key = "design"
//! type = "analysis"
//! description = "Sketch the module layout"
//!
//! [[tasks]]
//! key = "build"
//! type = "code_generation"
//! description = "Write the code"
//! depends_on = ["design"]
//! priority = "high"
//! ```

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::agent::AgentDescriptor;
use crate::core::dag::DependencyGraph;
use crate::core::task::{Priority, TaskId, TaskSpec, TaskStatus, TaskType};
use crate::engine::Engine;
use crate::metrics::EngineMetrics;
use crate::orchestration::SimulatedExecutor;
use crate::{Error, Result};

fn default_latency_ms() -> u64 {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPlan {
    #[serde(flatten)]
    pub descriptor: AgentDescriptor,
    /// Simulated time per attempt.
    #[serde(default = "default_latency_ms")]
    pub latency_ms: u64,
    /// Attempts of each task that fail before one succeeds.
    #[serde(default)]
    pub fail_attempts: u32,
    /// Make the forced failures non-retryable.
    #[serde(default)]
    pub permanent_failures: bool,
}

impl AgentPlan {
    fn executor(&self) -> SimulatedExecutor {
        let executor = SimulatedExecutor::new(Duration::from_millis(self.latency_ms))
            .failing_first(self.fail_attempts);
        if self.permanent_failures {
            executor.permanent_failures()
        } else {
            executor
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPlan {
    pub key: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub max_retries: Option<u32>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub agents: Vec<AgentPlan>,
    #[serde(default)]
    pub tasks: Vec<TaskPlan>,
}

/// A plan whose keys have been bound to task ids and checked for shape
/// errors and cycles.
#[derive(Debug, Clone)]
pub struct CompiledPlan {
    pub keys: HashMap<TaskId, String>,
    pub specs: Vec<TaskSpec>,
    /// Task keys in a dependency-respecting order.
    pub order: Vec<String>,
}

impl CompiledPlan {
    pub fn key(&self, id: &TaskId) -> &str {
        self.keys.get(id).map(String::as_str).unwrap_or("?")
    }
}

/// Final state of one plan task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcome {
    pub key: String,
    pub id: TaskId,
    pub status: TaskStatus,
    pub attempts: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanReport {
    pub name: Option<String>,
    pub tasks: Vec<TaskOutcome>,
    pub metrics: EngineMetrics,
    /// Whether nothing was left ready or running when the run returned.
    pub settled: bool,
}

impl PlanReport {
    pub fn all_completed(&self) -> bool {
        self.tasks.iter().all(|t| t.status == TaskStatus::Completed)
    }
}

impl Plan {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Bind keys to fresh task ids and check the plan's shape.
    ///
    /// # Errors
    /// `Error::Validation` for an empty plan, duplicate keys or agent ids,
    /// unknown dependency keys, or a dependency cycle.
    pub fn compile(&self) -> Result<CompiledPlan> {
        if self.tasks.is_empty() {
            return Err(Error::Validation("Plan has no tasks".into()));
        }

        let mut agent_ids = HashSet::new();
        for agent in &self.agents {
            if !agent_ids.insert(&agent.descriptor.id) {
                return Err(Error::Validation(format!(
                    "Duplicate agent id '{}'",
                    agent.descriptor.id
                )));
            }
        }

        let mut ids: HashMap<&str, TaskId> = HashMap::new();
        for task in &self.tasks {
            if ids.insert(task.key.as_str(), TaskId::new()).is_some() {
                return Err(Error::Validation(format!(
                    "Duplicate task key '{}'",
                    task.key
                )));
            }
        }

        let mut specs = Vec::with_capacity(self.tasks.len());
        let mut entries = Vec::with_capacity(self.tasks.len());
        for task in &self.tasks {
            let id = ids[task.key.as_str()];
            let mut dependencies = BTreeSet::new();
            for dep in &task.depends_on {
                let dep_id = ids.get(dep.as_str()).ok_or_else(|| {
                    Error::Validation(format!(
                        "Task '{}' depends on unknown key '{}'",
                        task.key, dep
                    ))
                })?;
                dependencies.insert(*dep_id);
            }

            let mut spec = TaskSpec::new(task.task_type, task.description.clone())
                .with_id(id)
                .priority(task.priority)
                .metadata(serde_json::json!({ "key": task.key }));
            spec.dependencies = dependencies.clone();
            if let Some(max_retries) = task.max_retries {
                spec = spec.max_retries(max_retries);
            }
            if let Some(secs) = task.timeout_secs {
                spec = spec.timeout(Duration::from_secs(secs));
            }
            entries.push((id, dependencies));
            specs.push(spec);
        }

        let keys: HashMap<TaskId, String> = ids
            .into_iter()
            .map(|(key, id)| (id, key.to_string()))
            .collect();

        let mut graph = DependencyGraph::new();
        graph.insert_batch(&entries).map_err(|e| match e {
            Error::Validation(msg) => Error::Validation(name_keys(&msg, &keys)),
            other => other,
        })?;
        let order = graph
            .topological_order()?
            .iter()
            .map(|id| keys[id].clone())
            .collect();

        debug!(tasks = specs.len(), agents = self.agents.len(), "plan compiled");
        Ok(CompiledPlan { keys, specs, order })
    }

    /// Register the plan's agents, submit its tasks and wait until nothing
    /// is left to run or `deadline` passes.
    ///
    /// The engine must already be started.
    pub async fn run(&self, engine: &Engine, deadline: Duration) -> Result<PlanReport> {
        let compiled = self.compile()?;
        for agent in &self.agents {
            engine.register_agent(agent.descriptor.clone(), Arc::new(agent.executor()))?;
        }
        let ids = engine.submit_batch(compiled.specs.clone())?;
        info!(
            name = self.name.as_deref().unwrap_or("unnamed"),
            tasks = ids.len(),
            agents = self.agents.len(),
            "plan submitted"
        );

        let settled = tokio::time::timeout(deadline, engine.wait_until_idle())
            .await
            .is_ok();

        let mut tasks = Vec::with_capacity(ids.len());
        for id in &ids {
            let task = engine.get_task(id)?;
            tasks.push(TaskOutcome {
                key: compiled.key(id).to_string(),
                id: *id,
                status: task.status,
                attempts: task.attempts.len(),
                error: task.error.as_ref().map(ToString::to_string),
            });
        }
        Ok(PlanReport {
            name: self.name.clone(),
            tasks,
            metrics: engine.get_metrics(),
            settled,
        })
    }
}

/// Replace task ids in a validation message with their plan keys.
fn name_keys(message: &str, keys: &HashMap<TaskId, String>) -> String {
    keys.iter().fold(message.to_string(), |msg, (id, key)| {
        msg.replace(&id.to_string(), &format!("'{}'", key))
    })
}
