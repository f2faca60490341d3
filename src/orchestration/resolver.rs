//! Dependency resolution.
//!
//! The resolver keeps, for every pending task, the set of dependencies
//! that have not completed yet. Removing a completed dependency from a set
//! is idempotent, so a completion that races with the registration of one
//! of its dependents can never be counted twice or missed.
//!
//! Lock order: `remaining` before any task record. Nothing takes
//! `remaining` while holding a record lock.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::CascadePolicy;
use crate::core::task::{ErrorKind, Task, TaskError, TaskId, TaskStatus};
use crate::registry::TaskRegistry;
use crate::workflow::WorkflowComposer;

/// Promotes pending tasks to ready and applies the cascade policy.
pub struct DependencyResolver {
    remaining: Mutex<HashMap<TaskId, HashSet<TaskId>>>,
    tasks: Arc<TaskRegistry>,
    composer: Arc<WorkflowComposer>,
    wake: Arc<Notify>,
    policy: CascadePolicy,
}

impl DependencyResolver {
    pub fn new(
        tasks: Arc<TaskRegistry>,
        composer: Arc<WorkflowComposer>,
        wake: Arc<Notify>,
        policy: CascadePolicy,
    ) -> Self {
        Self {
            remaining: Mutex::new(HashMap::new()),
            tasks,
            composer,
            wake,
            policy,
        }
    }

    pub fn policy(&self) -> CascadePolicy {
        self.policy
    }

    /// Start tracking newly stored tasks.
    ///
    /// Tasks whose dependencies are all completed become ready before this
    /// returns. A task with a dependency that already failed or was
    /// cancelled is handled by the cascade policy right away.
    pub fn register(&self, ids: &[TaskId]) {
        let mut finished = Vec::new();
        let mut promoted = 0;
        {
            let mut remaining = self.remaining.lock();
            for id in ids {
                let Some(task) = self.tasks.get(id) else {
                    continue;
                };
                if task.status != TaskStatus::Pending {
                    continue;
                }

                let mut unsatisfied = HashSet::new();
                let mut blocker = None;
                for dep in &task.dependencies {
                    match self.tasks.get(dep).map(|d| d.status) {
                        Some(TaskStatus::Completed) => {}
                        Some(status @ (TaskStatus::Failed | TaskStatus::Cancelled)) => {
                            blocker.get_or_insert((*dep, status));
                            unsatisfied.insert(*dep);
                        }
                        _ => {
                            unsatisfied.insert(*dep);
                        }
                    }
                }

                if let Some((ancestor, status)) = blocker {
                    remaining.insert(*id, unsatisfied);
                    finished.extend(self.apply_cascade(&mut remaining, &[*id], ancestor, status));
                    finished.extend(self.apply_cascade(
                        &mut remaining,
                        &self.tasks.transitive_dependents(id),
                        ancestor,
                        status,
                    ));
                } else if unsatisfied.is_empty() {
                    if self.promote(id) {
                        promoted += 1;
                    }
                } else {
                    remaining.insert(*id, unsatisfied);
                }
            }
        }
        self.after_update(&finished, promoted);
    }

    /// React to a task reaching a terminal status.
    ///
    /// Completion promotes dependents whose last dependency this was;
    /// failure or cancellation applies the cascade policy to every
    /// transitive dependent. The workflow composer hears about the task
    /// and every task the cascade finished.
    pub fn on_terminal(&self, task: &Task) {
        assert!(
            task.status.is_terminal(),
            "on_terminal called for task {} in {}",
            task.id,
            task.status
        );
        let mut finished = vec![task.clone()];
        let mut promoted = 0;
        {
            let mut remaining = self.remaining.lock();
            remaining.remove(&task.id);
            match task.status {
                TaskStatus::Completed => {
                    for dependent in self.tasks.dependents(&task.id) {
                        let Some(unsatisfied) = remaining.get_mut(&dependent) else {
                            continue;
                        };
                        unsatisfied.remove(&task.id);
                        if unsatisfied.is_empty() {
                            remaining.remove(&dependent);
                            if self.promote(&dependent) {
                                promoted += 1;
                            }
                        }
                    }
                }
                status => {
                    let dependents = self.tasks.transitive_dependents(&task.id);
                    finished.extend(self.apply_cascade(
                        &mut remaining,
                        &dependents,
                        task.id,
                        status,
                    ));
                }
            }
        }
        self.after_update(&finished, promoted);
    }

    fn after_update(&self, finished: &[Task], promoted: usize) {
        for task in finished {
            self.composer.on_member_terminal(task);
        }
        if promoted > 0 {
            self.wake.notify_one();
        }
    }

    fn promote(&self, id: &TaskId) -> bool {
        match self
            .tasks
            .compare_and_set_status(id, TaskStatus::Pending, TaskStatus::Ready, |t| {
                t.error = None;
            }) {
            Ok(_) => {
                debug!(task_id = %id, "dependencies satisfied, task ready");
                true
            }
            Err(err) => {
                debug!(task_id = %id, error = %err, "promotion skipped");
                false
            }
        }
    }

    /// Apply the cascade policy to `targets`, returning the tasks it moved
    /// to a terminal status.
    fn apply_cascade(
        &self,
        remaining: &mut HashMap<TaskId, HashSet<TaskId>>,
        targets: &[TaskId],
        ancestor: TaskId,
        ancestor_status: TaskStatus,
    ) -> Vec<Task> {
        let error = TaskError::new(
            ErrorKind::DependencyFailed,
            format!("dependency {} {}", ancestor, ancestor_status),
        );
        let mut finished = Vec::new();
        for id in targets {
            let next = match self.policy {
                CascadePolicy::Cancel => TaskStatus::Cancelled,
                CascadePolicy::Block => TaskStatus::Pending,
            };
            let result = self
                .tasks
                .compare_and_set_status(id, TaskStatus::Pending, next, |t| {
                    t.error = Some(error.clone());
                });
            match result {
                Ok(task) if task.status.is_terminal() => {
                    remaining.remove(id);
                    info!(task_id = %id, %ancestor, "task cancelled by failed dependency");
                    finished.push(task);
                }
                Ok(_) => {
                    warn!(task_id = %id, %ancestor, "task blocked by failed dependency");
                }
                Err(err) => {
                    debug!(task_id = %id, error = %err, "cascade skipped task");
                }
            }
        }
        finished
    }

    /// Rebuild the unsatisfied sets from the stored task statuses.
    pub(crate) fn rebuild(&self) {
        let pending = self
            .tasks
            .list(&crate::core::task::TaskFilter::with_status(TaskStatus::Pending));
        let ids: Vec<TaskId> = pending.iter().map(|t| t.id).collect();
        self.remaining.lock().clear();
        self.register(&ids);
    }

    /// Number of tasks still waiting on dependencies.
    pub fn waiting(&self) -> usize {
        self.remaining.lock().len()
    }
}
