//! Task record store.
//!
//! Every record sits behind its own mutex; the map lock is only held to
//! look a record up or to insert a batch. `compare_and_set_status` is the
//! single mutation primitive and publishes the lifecycle event while the
//! record is still locked, so events for one task are observed in the
//! order the transitions happened.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::core::dag::DependencyGraph;
use crate::core::task::{Task, TaskFilter, TaskId, TaskSpec, TaskStatus};
use crate::events::{EngineEvent, EventBus, EventKind};
use crate::{Error, Result};

type Record = Arc<Mutex<Task>>;

/// Store for task records and the dependency graph over them.
pub struct TaskRegistry {
    graph: RwLock<DependencyGraph>,
    records: RwLock<HashMap<TaskId, Record>>,
    next_seq: AtomicU64,
    bus: EventBus,
    default_max_retries: u32,
    max_retries_limit: u32,
}

impl TaskRegistry {
    pub fn new(bus: EventBus, default_max_retries: u32, max_retries_limit: u32) -> Self {
        Self {
            graph: RwLock::new(DependencyGraph::new()),
            records: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(1),
            bus,
            default_max_retries,
            max_retries_limit,
        }
    }

    /// Validate and store a single task.
    pub fn submit(&self, spec: TaskSpec) -> Result<TaskId> {
        let ids = self.submit_batch(vec![spec])?;
        Ok(ids[0])
    }

    /// Validate and store a batch of tasks atomically.
    ///
    /// Members may depend on each other through caller-supplied ids. On any
    /// validation failure nothing is stored.
    pub fn submit_batch(&self, specs: Vec<TaskSpec>) -> Result<Vec<TaskId>> {
        if specs.is_empty() {
            return Err(Error::Validation("Empty submission".into()));
        }
        for spec in &specs {
            self.validate(spec)?;
        }

        let entries: Vec<(TaskId, _)> = specs
            .iter()
            .map(|spec| (spec.id.unwrap_or_default(), spec.dependencies.clone()))
            .collect();

        let mut graph = self.graph.write();
        graph.insert_batch(&entries)?;
        let mut records = self.records.write();

        let mut ids = Vec::with_capacity(specs.len());
        for ((id, _), spec) in entries.into_iter().zip(specs) {
            let max_retries = spec.max_retries.unwrap_or(self.default_max_retries);
            let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
            let task = Task::from_spec(id, seq, spec, max_retries);
            debug!(task_id = %id, task_type = %task.task_type, priority = %task.priority, "task stored");
            self.bus
                .publish(EngineEvent::task(EventKind::TaskCreated, id, task.status));
            records.insert(id, Arc::new(Mutex::new(task)));
            ids.push(id);
        }
        Ok(ids)
    }

    fn validate(&self, spec: &TaskSpec) -> Result<()> {
        if spec.description.trim().is_empty() {
            return Err(Error::Validation("Task description must not be empty".into()));
        }
        if let Some(max) = spec.max_retries {
            if max > self.max_retries_limit {
                return Err(Error::Validation(format!(
                    "max_retries {} exceeds limit {}",
                    max, self.max_retries_limit
                )));
            }
        }
        if spec.timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::Validation("Task timeout must be positive".into()));
        }
        Ok(())
    }

    fn record(&self, id: &TaskId) -> Option<Record> {
        self.records.read().get(id).cloned()
    }

    pub fn get(&self, id: &TaskId) -> Option<Task> {
        self.record(id).map(|r| r.lock().clone())
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.records.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tasks matching `filter`, in submission order.
    pub fn list(&self, filter: &TaskFilter) -> Vec<Task> {
        let records: Vec<Record> = self.records.read().values().cloned().collect();
        let mut tasks: Vec<Task> = records
            .iter()
            .map(|r| r.lock().clone())
            .filter(|t| filter.matches(t))
            .collect();
        tasks.sort_by_key(|t| t.seq);
        tasks
    }

    /// Atomically move a task from `expected` to `new`, applying `update`
    /// to the record in the same critical section.
    ///
    /// # Errors
    /// `Error::Conflict` if the current status is not `expected`, and
    /// `Error::TaskNotFound` for an unknown id.
    ///
    /// # Panics
    /// On an illegal lifecycle transition, or if `update` leaves the agent
    /// binding or retry counter incoherent.
    pub fn compare_and_set_status<F>(
        &self,
        id: &TaskId,
        expected: TaskStatus,
        new: TaskStatus,
        update: F,
    ) -> Result<Task>
    where
        F: FnOnce(&mut Task),
    {
        let record = self.record(id).ok_or(Error::TaskNotFound(*id))?;
        let mut task = record.lock();
        if task.status != expected {
            return Err(Error::Conflict {
                task_id: *id,
                expected,
                actual: task.status,
            });
        }
        assert!(
            expected.can_transition_to(new),
            "illegal transition {} -> {} for task {}",
            expected,
            new,
            id
        );

        let previous_retries = task.retry_count;
        task.status = new;
        update(&mut task);
        if new.is_terminal() && task.completed_at.is_none() {
            task.completed_at = Some(Utc::now());
        }

        assert_eq!(
            task.assigned_agent.is_some(),
            new.holds_agent(),
            "task {} in {} has assigned_agent {:?}",
            id,
            new,
            task.assigned_agent
        );
        assert!(
            task.retry_count >= previous_retries && task.retry_count <= task.max_retries,
            "task {} retry count {} -> {} (max {})",
            id,
            previous_retries,
            task.retry_count,
            task.max_retries
        );

        if expected != new {
            debug!(task_id = %id, from = %expected, to = %new, "task transition");
            if let Some(event) = transition_event(expected, &task) {
                self.bus.publish(event);
            }
        }
        Ok(task.clone())
    }

    /// Tasks that depend directly on `id`.
    pub fn dependents(&self, id: &TaskId) -> Vec<TaskId> {
        self.graph.read().dependents(id)
    }

    /// Every task that transitively depends on `id`, nearest first.
    pub fn transitive_dependents(&self, id: &TaskId) -> Vec<TaskId> {
        self.graph.read().transitive_dependents(id)
    }

    pub fn topological_order(&self) -> Result<Vec<TaskId>> {
        self.graph.read().topological_order()
    }

    /// Replace the store's contents with records from a snapshot.
    ///
    /// Records are taken as-is; status repair is the caller's job.
    pub(crate) fn restore(&self, tasks: Vec<Task>) -> Result<()> {
        let entries: Vec<_> = tasks
            .iter()
            .map(|t| (t.id, t.dependencies.clone()))
            .collect();
        let mut fresh = DependencyGraph::new();
        fresh.insert_batch(&entries)?;

        let mut graph = self.graph.write();
        let mut records = self.records.write();
        let next_seq = tasks.iter().map(|t| t.seq).max().unwrap_or(0) + 1;
        *graph = fresh;
        *records = tasks
            .into_iter()
            .map(|t| (t.id, Arc::new(Mutex::new(t))))
            .collect();
        self.next_seq.store(next_seq, Ordering::SeqCst);
        Ok(())
    }
}

/// The event announcing the transition that just left `task` in its current status.
fn transition_event(from: TaskStatus, task: &Task) -> Option<EngineEvent> {
    let kind = match task.status {
        TaskStatus::Pending => return None,
        TaskStatus::Ready => EventKind::TaskReady,
        TaskStatus::Assigned => EventKind::TaskAssigned,
        TaskStatus::Running => EventKind::TaskStarted,
        TaskStatus::Completed => EventKind::TaskCompleted,
        TaskStatus::Failed => EventKind::TaskFailed,
        TaskStatus::Cancelled => EventKind::TaskCancelled,
    };
    let event = EngineEvent::task(kind, task.id, task.status);

    let detail = match (from, task.status) {
        (TaskStatus::Running, TaskStatus::Ready) => Some(format!(
            "retry {} of {}",
            task.retry_count, task.max_retries
        )),
        (TaskStatus::Assigned, TaskStatus::Ready) => Some("requeued, agent unavailable".into()),
        (_, TaskStatus::Assigned | TaskStatus::Running) => {
            task.assigned_agent.as_ref().map(|a| format!("agent {}", a))
        }
        (_, TaskStatus::Failed | TaskStatus::Cancelled) => {
            task.error.as_ref().map(|e| e.to_string())
        }
        _ => None,
    };
    Some(match detail {
        Some(detail) => event.with_detail(detail),
        None => event,
    })
}
