//! The engine facade.
//!
//! `Engine` owns the registries and the background loops, and exposes the
//! submission, query and control operations. Every mutation it performs
//! goes through the registries' compare-and-set and acquire/release
//! primitives; the engine itself holds no lock over the whole state.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{Agent, AgentDescriptor, AgentId, AgentStatus};
use crate::config::EngineConfig;
use crate::core::task::{
    AttemptOutcome, ErrorKind, Task, TaskError, TaskFilter, TaskId, TaskSpec, TaskStatus,
};
use crate::events::{EventBus, EventKind, Subscription};
use crate::metrics::EngineMetrics;
use crate::orchestration::{
    AgentExecutor, DependencyResolver, ExecutionSupervisor, ExecutorSet, HealthMonitor,
    PassSummary, RetryPolicy, Scheduler,
};
use crate::registry::{AgentRegistry, TaskRegistry};
use crate::state::{EngineSnapshot, StateStore};
use crate::workflow::{WorkflowComposer, WorkflowId, WorkflowMode, WorkflowView};
use crate::{Error, Result};

/// How often waiters re-read state in case a terminal event was lost to lag.
const WAIT_RECHECK: Duration = Duration::from_millis(250);

const TERMINAL_EVENTS: [EventKind; 3] = [
    EventKind::TaskCompleted,
    EventKind::TaskFailed,
    EventKind::TaskCancelled,
];

pub struct Engine {
    config: EngineConfig,
    bus: EventBus,
    tasks: Arc<TaskRegistry>,
    agents: Arc<AgentRegistry>,
    executors: Arc<ExecutorSet>,
    composer: Arc<WorkflowComposer>,
    resolver: Arc<DependencyResolver>,
    supervisor: Arc<ExecutionSupervisor>,
    scheduler: Arc<Scheduler>,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Build an idle engine. Nothing is scheduled until `start`.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let bus = EventBus::new(config.event_buffer);
        let wake = Arc::new(Notify::new());
        let shutdown = CancellationToken::new();

        let tasks = Arc::new(TaskRegistry::new(
            bus.clone(),
            config.default_max_retries,
            config.max_retries_limit,
        ));
        let agents = Arc::new(AgentRegistry::new(
            config.performance_alpha,
            config.initial_performance_score,
        ));
        let executors = Arc::new(ExecutorSet::new());
        let composer = Arc::new(WorkflowComposer::new(
            tasks.clone(),
            bus.clone(),
            config.workflow_failure_policy,
        ));
        let resolver = Arc::new(DependencyResolver::new(
            tasks.clone(),
            composer.clone(),
            wake.clone(),
            config.cascade_policy,
        ));
        let supervisor = Arc::new(ExecutionSupervisor::new(
            tasks.clone(),
            agents.clone(),
            executors.clone(),
            resolver.clone(),
            wake.clone(),
            RetryPolicy {
                default_timeout: config.task_timeout(),
                backoff_base: config.retry_backoff_base(),
                backoff_max: config.retry_backoff_max(),
            },
            shutdown.child_token(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            tasks.clone(),
            agents.clone(),
            supervisor.clone(),
            wake.clone(),
        ));

        Ok(Self {
            config,
            bus,
            tasks,
            agents,
            executors,
            composer,
            resolver,
            supervisor,
            scheduler,
            wake,
            shutdown,
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Rebuild an engine from a snapshot.
    ///
    /// Interrupted attempts go back to ready with their retry budget intact.
    /// Agents come back offline until they are registered again with an
    /// executor.
    pub fn restore(config: EngineConfig, mut snapshot: EngineSnapshot) -> Result<Self> {
        snapshot.check_version()?;
        let requeued = snapshot.requeue_interrupted();

        let engine = Self::new(config)?;
        engine.tasks.restore(snapshot.tasks)?;
        engine.composer.restore(snapshot.workflows);
        engine.agents.restore(snapshot.agents);
        engine.resolver.rebuild();

        info!(
            tasks = engine.tasks.len(),
            workflows = engine.composer.len(),
            requeued,
            "engine restored from snapshot"
        );
        Ok(engine)
    }

    /// Restore from the configured state file if it exists, else start empty.
    pub async fn open(config: EngineConfig) -> Result<Self> {
        let Some(path) = config.state_file() else {
            return Self::new(config);
        };
        match StateStore::new(path).load().await? {
            Some(snapshot) => Self::restore(config, snapshot),
            None => Self::new(config),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Spawn the scheduler loop, and the health monitor when a heartbeat
    /// timeout is configured. Calling it twice is a no-op. Must be called
    /// from within a tokio runtime.
    pub fn start(&self) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return;
        }
        if self.shutdown.is_cancelled() {
            warn!("start called after shutdown; ignoring");
            return;
        }

        workers.push(tokio::spawn(
            self.scheduler.clone().run(self.shutdown.child_token()),
        ));
        if let Some(timeout) = self.config.heartbeat_timeout() {
            let monitor = HealthMonitor::new(self.agents.clone(), timeout);
            workers.push(tokio::spawn(monitor.run(self.shutdown.child_token())));
        }
        info!(agents = self.agents.list().len(), tasks = self.tasks.len(), "engine started");
    }

    /// Stop the background loops and in-flight attempts, then write a
    /// snapshot if a state file is configured.
    ///
    /// Attempts that were running stay running in the snapshot; a restore
    /// requeues them.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for result in join_all(workers).await {
            if let Err(e) = result {
                warn!(error = %e, "background loop ended abnormally");
            }
        }
        info!("engine stopped");
        self.save_state().await
    }

    /// Write a snapshot to the configured state file. No-op without one.
    pub async fn save_state(&self) -> Result<()> {
        let Some(path) = self.config.state_file() else {
            return Ok(());
        };
        StateStore::new(path).save(self.snapshot()).await
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot::new(
            self.tasks.list(&TaskFilter::default()),
            self.composer.list(),
            self.agents.list(),
        )
    }

    // Agents

    /// Register an agent and bind the executor that runs its attempts.
    pub fn register_agent(
        &self,
        descriptor: AgentDescriptor,
        executor: Arc<dyn AgentExecutor>,
    ) -> Result<Agent> {
        let agent = self.agents.register(descriptor)?;
        self.executors.bind(agent.id.clone(), executor);
        self.wake.notify_one();
        Ok(agent)
    }

    /// Remove an agent. Its in-flight attempts fail as retryable.
    pub fn unregister_agent(&self, id: &AgentId) -> Result<Agent> {
        self.executors.unbind(id);
        let agent = self.agents.unregister(id)?;
        let abandoned = self.supervisor.abandon_agent(id);
        if abandoned > 0 {
            info!(agent_id = %id, abandoned, "in-flight attempts returned for retry");
        }
        self.wake.notify_one();
        Ok(agent)
    }

    pub fn heartbeat(&self, id: &AgentId, status: AgentStatus, load: u32) -> Result<()> {
        self.agents.heartbeat(id, status, load)?;
        self.wake.notify_one();
        Ok(())
    }

    pub fn get_agent(&self, id: &AgentId) -> Result<Agent> {
        self.agents
            .get(id)
            .ok_or_else(|| Error::AgentNotFound(id.clone()))
    }

    pub fn list_agents(&self) -> Vec<Agent> {
        self.agents.list()
    }

    // Submission

    /// Store a task. If it has no unfinished dependencies it is ready
    /// before this returns.
    pub fn submit_task(&self, spec: TaskSpec) -> Result<TaskId> {
        let id = self.tasks.submit(spec)?;
        self.resolver.register(&[id]);
        Ok(id)
    }

    /// Store several tasks atomically; they may depend on each other.
    pub fn submit_batch(&self, specs: Vec<TaskSpec>) -> Result<Vec<TaskId>> {
        let ids = self.tasks.submit_batch(specs)?;
        self.resolver.register(&ids);
        Ok(ids)
    }

    pub fn submit_workflow(
        &self,
        name: &str,
        specs: Vec<TaskSpec>,
        mode: WorkflowMode,
    ) -> Result<WorkflowId> {
        self.submit_workflow_with_metadata(name, specs, mode, serde_json::Value::Null)
    }

    pub fn submit_workflow_with_metadata(
        &self,
        name: &str,
        specs: Vec<TaskSpec>,
        mode: WorkflowMode,
        metadata: serde_json::Value,
    ) -> Result<WorkflowId> {
        let (workflow_id, ids) = self.composer.submit_workflow(name, specs, mode, metadata)?;
        self.resolver.register(&ids);
        Ok(workflow_id)
    }

    // Queries

    pub fn get_task(&self, id: &TaskId) -> Result<Task> {
        self.tasks.get(id).ok_or(Error::TaskNotFound(*id))
    }

    pub fn list_tasks(&self, filter: &TaskFilter) -> Vec<Task> {
        self.tasks.list(filter)
    }

    pub fn get_workflow(&self, id: &WorkflowId) -> Result<WorkflowView> {
        self.composer.view(id)
    }

    pub fn list_workflows(&self) -> Vec<WorkflowView> {
        self.composer
            .list()
            .iter()
            .filter_map(|w| self.composer.view(&w.id).ok())
            .collect()
    }

    pub fn get_metrics(&self) -> EngineMetrics {
        EngineMetrics::collect(
            &self.tasks.list(&TaskFilter::default()),
            &self.agents.list(),
            self.composer.len(),
        )
    }

    /// Ready tasks in the order the scheduler will consider them.
    pub fn ready_queue(&self) -> Vec<Task> {
        self.scheduler.ready_queue()
    }

    pub fn topological_order(&self) -> Result<Vec<TaskId>> {
        self.tasks.topological_order()
    }

    // Control

    /// Cancel a task. Cancelling a task that already finished returns it
    /// unchanged.
    pub fn cancel_task(&self, id: &TaskId) -> Result<Task> {
        loop {
            let task = self.get_task(id)?;
            if task.is_finished() {
                debug!(task_id = %id, status = %task.status, "cancel of finished task ignored");
                return Ok(task);
            }

            let result = self
                .tasks
                .compare_and_set_status(id, task.status, TaskStatus::Cancelled, |t| {
                    t.assigned_agent = None;
                    t.not_before = None;
                    t.error = Some(TaskError::new(ErrorKind::Cancelled, "cancelled by request"));
                    t.close_attempt(AttemptOutcome::Cancelled);
                });
            match result {
                Ok(cancelled) => {
                    info!(task_id = %id, from = %task.status, "task cancelled");
                    self.supervisor.abort(id);
                    self.resolver.on_terminal(&cancelled);
                    return Ok(cancelled);
                }
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Cancel every unfinished member of a workflow.
    pub fn cancel_workflow(&self, id: &WorkflowId) -> Result<WorkflowView> {
        let workflow = self
            .composer
            .get(id)
            .ok_or(Error::WorkflowNotFound(*id))?;
        // Last member first, so each member is cancelled by request rather
        // than by a cascade from the member before it.
        for task_id in workflow.task_ids.iter().rev() {
            self.cancel_task(task_id)?;
        }
        self.composer.view(id)
    }

    pub fn pause(&self) {
        self.scheduler.pause();
    }

    pub fn resume(&self) {
        self.scheduler.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.scheduler.is_paused()
    }

    /// Run one scheduling pass now, outside the background loop.
    pub fn run_pass(&self) -> PassSummary {
        self.scheduler.run_pass()
    }

    // Events

    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }

    pub fn subscribe_to(&self, kinds: &[EventKind]) -> Subscription {
        self.bus.subscribe_to(kinds)
    }

    /// Resolve once the task is terminal. A failed task yields
    /// `PermanentFailure`; a cancelled task is returned as is.
    pub async fn wait_for_task(&self, id: &TaskId) -> Result<Task> {
        let mut events = self.bus.subscribe_to(&TERMINAL_EVENTS);
        loop {
            let task = self.get_task(id)?;
            match task.status {
                TaskStatus::Completed | TaskStatus::Cancelled => return Ok(task),
                TaskStatus::Failed => {
                    let error = task.error.clone().unwrap_or_else(|| {
                        TaskError::new(ErrorKind::Execution, "failed without a recorded error")
                    });
                    return Err(Error::PermanentFailure {
                        task_id: task.id,
                        error,
                    });
                }
                _ => {}
            }
            self.wait_for_event(&mut events).await;
        }
    }

    /// Resolve once the workflow's derived status is terminal.
    pub async fn wait_for_workflow(&self, id: &WorkflowId) -> Result<WorkflowView> {
        let mut events = self.bus.subscribe_to(&TERMINAL_EVENTS);
        loop {
            let view = self.composer.view(id)?;
            if view.status.is_terminal() {
                return Ok(view);
            }
            self.wait_for_event(&mut events).await;
        }
    }

    /// Resolve once no task is ready, assigned or running.
    ///
    /// Ready tasks that no registered agent can serve keep this pending, so
    /// callers usually wrap it in a timeout.
    pub async fn wait_until_idle(&self) {
        let mut events = self.bus.subscribe_to(&TERMINAL_EVENTS);
        loop {
            let metrics = self.get_metrics();
            if metrics.ready_tasks == 0 && metrics.running_tasks == 0 {
                return;
            }
            self.wait_for_event(&mut events).await;
        }
    }

    async fn wait_for_event(&self, events: &mut Subscription) {
        tokio::select! {
            event = events.recv() => {
                if event.is_none() {
                    tokio::time::sleep(WAIT_RECHECK).await;
                }
            }
            _ = tokio::time::sleep(WAIT_RECHECK) => {}
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
