//! Agent registry: capability matching and load accounting.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::agent::{Agent, AgentDescriptor, AgentId, AgentStatus};
use crate::core::task::TaskType;
use crate::util::to_chrono;
use crate::{Error, Result};

/// One unit of an agent's capacity, bound to the registration it was
/// taken from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    agent_id: AgentId,
    generation: u64,
}

impl Lease {
    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }
}

/// A registration. Re-binding an offline id keeps the slot; unregistering
/// drops it, so leases from an earlier registration no longer match.
struct Slot {
    generation: u64,
    agent: Mutex<Agent>,
}

type Record = Arc<Slot>;

pub struct AgentRegistry {
    agents: RwLock<HashMap<AgentId, Record>>,
    generations: AtomicU64,
    alpha: f64,
    initial_score: f64,
}

impl AgentRegistry {
    pub fn new(alpha: f64, initial_score: f64) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            generations: AtomicU64::new(0),
            alpha,
            initial_score,
        }
    }

    /// Register an agent.
    ///
    /// An id that is present but offline (restored from a snapshot, or
    /// dropped by the health check) is re-bound: the descriptor replaces
    /// role, capabilities and capacity. The performance score is kept, and
    /// so is the load of attempts still running from before it went offline.
    pub fn register(&self, descriptor: AgentDescriptor) -> Result<Agent> {
        if descriptor.capacity == 0 {
            return Err(Error::Validation(format!(
                "Agent {} must have capacity of at least 1",
                descriptor.id
            )));
        }
        if descriptor.id.as_str().trim().is_empty() {
            return Err(Error::Validation("Agent id must not be empty".into()));
        }

        let mut agents = self.agents.write();
        if let Some(record) = agents.get(&descriptor.id) {
            let mut agent = record.agent.lock();
            if agent.status != AgentStatus::Offline {
                return Err(Error::AgentExists(descriptor.id));
            }
            let score = agent.performance_score;
            let mut revived = Agent::from_descriptor(descriptor, score);
            revived.registered_at = agent.registered_at;
            revived.completed_count = agent.completed_count;
            revived.failed_count = agent.failed_count;
            revived.load = agent.load;
            revived.refresh_status();
            info!(agent_id = %revived.id, score, load = revived.load, "agent re-registered");
            *agent = revived;
            return Ok(agent.clone());
        }

        let agent = Agent::from_descriptor(descriptor, self.initial_score);
        info!(agent_id = %agent.id, role = %agent.role, capacity = agent.capacity, "agent registered");
        agents.insert(agent.id.clone(), self.slot(agent.clone()));
        Ok(agent)
    }

    pub fn unregister(&self, id: &AgentId) -> Result<Agent> {
        let record = self
            .agents
            .write()
            .remove(id)
            .ok_or_else(|| Error::AgentNotFound(id.clone()))?;
        let agent = record.agent.lock().clone();
        info!(agent_id = %id, load = agent.load, "agent unregistered");
        Ok(agent)
    }

    fn slot(&self, agent: Agent) -> Record {
        Arc::new(Slot {
            generation: self.generations.fetch_add(1, AtomicOrdering::Relaxed),
            agent: Mutex::new(agent),
        })
    }

    fn record(&self, id: &AgentId) -> Option<Record> {
        self.agents.read().get(id).cloned()
    }

    pub fn get(&self, id: &AgentId) -> Option<Agent> {
        self.record(id).map(|r| r.agent.lock().clone())
    }

    /// All agents ordered by id.
    pub fn list(&self) -> Vec<Agent> {
        let records: Vec<Record> = self.agents.read().values().cloned().collect();
        let mut agents: Vec<Agent> = records.iter().map(|r| r.agent.lock().clone()).collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    /// Record a heartbeat.
    ///
    /// The reported load is kept for diagnostics only; the engine's own
    /// count is authoritative. Reporting idle or busy brings an errored or
    /// offline agent back into rotation.
    pub fn heartbeat(&self, id: &AgentId, status: AgentStatus, load: u32) -> Result<()> {
        let record = self
            .record(id)
            .ok_or_else(|| Error::AgentNotFound(id.clone()))?;
        let mut agent = record.agent.lock();
        agent.last_heartbeat = Utc::now();
        agent.reported_load = Some(load);
        if load != agent.load {
            warn!(
                agent_id = %id,
                reported = load,
                tracked = agent.load,
                "heartbeat load differs from tracked load"
            );
        }
        if status.accepts_work() {
            if !agent.status.accepts_work() {
                info!(agent_id = %id, from = %agent.status, "agent back online");
            }
            agent.status = AgentStatus::Idle;
            agent.refresh_status();
        } else {
            agent.status = status;
        }
        Ok(())
    }

    /// Agents able to take a task of `task_type` right now, best first.
    ///
    /// Ordered by performance score (desc), utilization (asc), then id.
    pub fn best_match(&self, task_type: TaskType) -> Vec<AgentId> {
        let mut candidates: Vec<Agent> = self
            .list()
            .into_iter()
            .filter(|a| a.is_available() && a.services(task_type))
            .collect();
        candidates.sort_by(compare_candidates);
        candidates.into_iter().map(|a| a.id).collect()
    }

    /// Take one unit of the agent's capacity. Returns `None` if the agent
    /// is gone, not accepting work, or full.
    pub fn try_acquire(&self, id: &AgentId) -> Option<Lease> {
        let record = self.record(id)?;
        let mut agent = record.agent.lock();
        if !agent.is_available() {
            return None;
        }
        agent.load += 1;
        agent.refresh_status();
        debug!(agent_id = %id, load = agent.load, capacity = agent.capacity, "capacity acquired");
        Some(Lease {
            agent_id: id.clone(),
            generation: record.generation,
        })
    }

    /// Give back one unit of capacity. A no-op when the registration the
    /// lease came from has been unregistered in the meantime, even if the
    /// id has been registered again since.
    ///
    /// # Panics
    /// If the agent's load is already zero.
    pub fn release(&self, lease: &Lease) {
        let id = &lease.agent_id;
        let record = match self.record(id) {
            Some(record) if record.generation == lease.generation => record,
            _ => {
                debug!(agent_id = %id, "release for unregistered agent ignored");
                return;
            }
        };
        let mut agent = record.agent.lock();
        assert!(agent.load > 0, "release below zero load for agent {}", id);
        agent.load -= 1;
        agent.refresh_status();
        debug!(agent_id = %id, load = agent.load, "capacity released");
    }

    /// Fold an attempt outcome into the agent's performance score.
    pub fn record_outcome(&self, id: &AgentId, success: bool) {
        if let Some(record) = self.record(id) {
            let mut agent = record.agent.lock();
            agent.apply_outcome(self.alpha, success);
            debug!(agent_id = %id, success, score = agent.performance_score, "performance updated");
        }
    }

    /// Mark agents whose last heartbeat is older than `timeout` as offline.
    /// Returns the ids that changed.
    pub fn mark_stale(&self, timeout: Duration, now: DateTime<Utc>) -> Vec<AgentId> {
        let cutoff = now - to_chrono(timeout);
        let records: Vec<Record> = self.agents.read().values().cloned().collect();
        let mut stale = Vec::new();
        for record in records {
            let mut agent = record.agent.lock();
            if agent.status.accepts_work() && agent.last_heartbeat < cutoff {
                warn!(
                    agent_id = %agent.id,
                    last_heartbeat = %agent.last_heartbeat,
                    "agent heartbeat stale, marking offline"
                );
                agent.status = AgentStatus::Offline;
                stale.push(agent.id.clone());
            }
        }
        stale.sort();
        stale
    }

    /// Load agents from a snapshot. They come back offline with no load
    /// until re-registered with an executor.
    pub(crate) fn restore(&self, agents: Vec<Agent>) {
        let mut map = self.agents.write();
        map.clear();
        for mut agent in agents {
            agent.status = AgentStatus::Offline;
            agent.load = 0;
            agent.reported_load = None;
            map.insert(agent.id.clone(), self.slot(agent));
        }
    }
}

fn compare_candidates(a: &Agent, b: &Agent) -> Ordering {
    b.performance_score
        .total_cmp(&a.performance_score)
        .then_with(|| {
            // load/capacity compared without floating point
            let lhs = u64::from(a.load) * u64::from(b.capacity);
            let rhs = u64::from(b.load) * u64::from(a.capacity);
            lhs.cmp(&rhs)
        })
        .then_with(|| a.id.cmp(&b.id))
}
