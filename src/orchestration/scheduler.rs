//! Scheduler for ready tasks.
//!
//! A pass walks the ready tasks in priority order and hands each one to the
//! best available agent that services its type. Tasks that find no agent
//! stay ready; that is backpressure, not an error. Between passes the loop
//! sleeps until it is woken (task ready, load released, agent registered,
//! resume) or until the earliest retry backoff expires.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::core::task::{Task, TaskFilter, TaskStatus};
use crate::error::Error;
use crate::orchestration::supervisor::ExecutionSupervisor;
use crate::registry::{AgentRegistry, TaskRegistry};

/// What a single scheduling pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassSummary {
    /// Tasks moved to assigned and dispatched.
    pub assigned: usize,
    /// Ready tasks left waiting for a capable agent.
    pub backlogged: usize,
    /// Earliest instant at which a backed-off task becomes eligible.
    pub next_due: Option<DateTime<Utc>>,
}

/// Matches ready tasks to agents.
pub struct Scheduler {
    tasks: Arc<TaskRegistry>,
    agents: Arc<AgentRegistry>,
    supervisor: Arc<ExecutionSupervisor>,
    wake: Arc<Notify>,
    paused: AtomicBool,
}

impl Scheduler {
    pub fn new(
        tasks: Arc<TaskRegistry>,
        agents: Arc<AgentRegistry>,
        supervisor: Arc<ExecutionSupervisor>,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            tasks,
            agents,
            supervisor,
            wake,
            paused: AtomicBool::new(false),
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, AtomicOrdering::SeqCst);
        info!("scheduling paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, AtomicOrdering::SeqCst);
        info!("scheduling resumed");
        self.wake.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(AtomicOrdering::SeqCst)
    }

    /// Ready tasks in scheduling order: priority desc, created_at asc, seq asc.
    pub fn ready_queue(&self) -> Vec<Task> {
        let mut ready = self.tasks.list(&TaskFilter::with_status(TaskStatus::Ready));
        ready.sort_by(compare_for_dispatch);
        ready
    }

    /// Run one scheduling pass. Must be called from within a tokio runtime.
    pub fn run_pass(&self) -> PassSummary {
        let mut summary = PassSummary::default();
        if self.is_paused() {
            return summary;
        }

        let now = Utc::now();
        for task in self.ready_queue() {
            if !task.is_eligible(now) {
                if let Some(due) = task.not_before {
                    summary.next_due = Some(summary.next_due.map_or(due, |d| d.min(due)));
                }
                continue;
            }

            let candidates = self.agents.best_match(task.task_type);
            let Some(lease) = candidates
                .iter()
                .find_map(|candidate| self.agents.try_acquire(candidate))
            else {
                trace!(task_id = %task.id, reason = %Error::AgentUnavailable(task.task_type), "task backlogged");
                summary.backlogged += 1;
                continue;
            };
            let agent_id = lease.agent_id().clone();

            let assigned = self.tasks.compare_and_set_status(
                &task.id,
                TaskStatus::Ready,
                TaskStatus::Assigned,
                |t| {
                    t.assigned_agent = Some(agent_id.clone());
                    t.not_before = None;
                },
            );
            match assigned {
                Ok(task) => {
                    debug!(task_id = %task.id, agent_id = %agent_id, priority = %task.priority, "task assigned");
                    summary.assigned += 1;
                    self.supervisor.dispatch(task, lease);
                }
                Err(err) => {
                    debug!(task_id = %task.id, error = %err, "assignment lost race");
                    self.agents.release(&lease);
                }
            }
        }
        summary
    }

    /// Run passes until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("scheduler started");
        loop {
            let summary = self.run_pass();
            let sleep = summary.next_due.map(|due| {
                (due - Utc::now())
                    .to_std()
                    .unwrap_or(std::time::Duration::ZERO)
            });
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = sleep_for(sleep) => {}
            }
        }
        info!("scheduler stopped");
    }
}

async fn sleep_for(duration: Option<std::time::Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

fn compare_for_dispatch(a: &Task, b: &Task) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.seq.cmp(&b.seq))
}
