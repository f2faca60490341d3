//! Workflow composition and status tracking.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::config::WorkflowFailurePolicy;
use crate::core::task::{Task, TaskId, TaskSpec, TaskStatus};
use crate::events::{EngineEvent, EventBus, EventKind};
use crate::registry::TaskRegistry;
use crate::workflow::types::{Workflow, WorkflowId, WorkflowMode, WorkflowStatus, WorkflowView};
use crate::{Error, Result};

/// Groups tasks under named workflows and announces their terminal status.
pub struct WorkflowComposer {
    workflows: RwLock<HashMap<WorkflowId, Workflow>>,
    tasks: Arc<TaskRegistry>,
    bus: EventBus,
    failure_policy: WorkflowFailurePolicy,
}

impl WorkflowComposer {
    pub fn new(tasks: Arc<TaskRegistry>, bus: EventBus, failure_policy: WorkflowFailurePolicy) -> Self {
        Self {
            workflows: RwLock::new(HashMap::new()),
            tasks,
            bus,
            failure_policy,
        }
    }

    /// Store the member tasks of a new workflow.
    ///
    /// In sequential mode each member also depends on the member before it.
    /// Members are stored as one batch, so a validation failure stores
    /// neither the tasks nor the workflow. The caller still has to hand the
    /// returned ids to the dependency resolver.
    pub fn submit_workflow(
        &self,
        name: &str,
        specs: Vec<TaskSpec>,
        mode: WorkflowMode,
        metadata: serde_json::Value,
    ) -> Result<(WorkflowId, Vec<TaskId>)> {
        if name.trim().is_empty() {
            return Err(Error::Validation("Workflow name must not be empty".into()));
        }
        if specs.is_empty() {
            return Err(Error::Validation(format!(
                "Workflow '{}' has no tasks",
                name
            )));
        }

        let mut workflow = Workflow::new(name, mode, self.failure_policy);
        workflow.metadata = metadata;

        let mut previous: Option<TaskId> = None;
        let specs: Vec<TaskSpec> = specs
            .into_iter()
            .map(|mut spec| {
                let id = *spec.id.get_or_insert_with(TaskId::new);
                if let (WorkflowMode::Sequential, Some(prev)) = (mode, previous) {
                    spec.dependencies.insert(prev);
                }
                spec.workflow_id = Some(workflow.id);
                previous = Some(id);
                spec
            })
            .collect();

        let ids = self.tasks.submit_batch(specs)?;
        workflow.task_ids = ids.clone();
        let id = workflow.id;
        info!(workflow_id = %id, name, %mode, tasks = ids.len(), "workflow submitted");
        self.workflows.write().insert(id, workflow);
        Ok((id, ids))
    }

    pub fn get(&self, id: &WorkflowId) -> Option<Workflow> {
        self.workflows.read().get(id).cloned()
    }

    /// The workflow with its status derived from the current member statuses.
    pub fn view(&self, id: &WorkflowId) -> Result<WorkflowView> {
        let workflow = self.get(id).ok_or(Error::WorkflowNotFound(*id))?;
        let member_statuses = self.member_statuses(&workflow);
        Ok(WorkflowView {
            id: workflow.id,
            name: workflow.name,
            mode: workflow.mode,
            status: WorkflowStatus::derive(workflow.failure_policy, &member_statuses),
            task_ids: workflow.task_ids,
            member_statuses,
            created_at: workflow.created_at,
        })
    }

    pub fn list(&self) -> Vec<Workflow> {
        let mut workflows: Vec<Workflow> = self.workflows.read().values().cloned().collect();
        workflows.sort_by_key(|w| w.created_at);
        workflows
    }

    pub fn len(&self) -> usize {
        self.workflows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn member_statuses(&self, workflow: &Workflow) -> Vec<TaskStatus> {
        workflow
            .task_ids
            .iter()
            .filter_map(|id| self.tasks.get(id).map(|t| t.status))
            .collect()
    }

    /// Re-derive the status of the task's workflow after a member reached a
    /// terminal state, publishing the workflow event the first time the
    /// derived status is terminal.
    pub fn on_member_terminal(&self, task: &Task) {
        let Some(workflow_id) = task.workflow_id else {
            return;
        };
        let mut workflows = self.workflows.write();
        let Some(workflow) = workflows.get_mut(&workflow_id) else {
            return;
        };
        if workflow.announced {
            return;
        }

        let statuses = self.member_statuses(workflow);
        let status = WorkflowStatus::derive(workflow.failure_policy, &statuses);
        let kind = match status {
            WorkflowStatus::Running => return,
            WorkflowStatus::Completed => EventKind::WorkflowCompleted,
            WorkflowStatus::Failed => EventKind::WorkflowFailed,
            WorkflowStatus::Cancelled => EventKind::WorkflowCancelled,
        };
        workflow.announced = true;
        info!(workflow_id = %workflow_id, name = %workflow.name, %status, "workflow finished");
        self.bus
            .publish(EngineEvent::workflow(kind, workflow_id, status).with_detail(format!(
                "{} of {} tasks completed",
                statuses.iter().filter(|s| **s == TaskStatus::Completed).count(),
                statuses.len()
            )));
    }

    pub(crate) fn restore(&self, workflows: Vec<Workflow>) {
        *self.workflows.write() = workflows.into_iter().map(|w| (w.id, w)).collect();
    }
}
