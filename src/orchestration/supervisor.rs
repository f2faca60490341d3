//! Execution supervision.
//!
//! Every dispatched attempt runs in its own tokio task that races the
//! executor future against the attempt deadline and the attempt's
//! cancellation token. The attempt task owns one unit of the agent's load
//! and gives it back exactly once, whatever the outcome.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::AgentId;
use crate::core::task::{Attempt, AttemptOutcome, ErrorKind, Task, TaskError, TaskId, TaskStatus};
use crate::orchestration::executor::{AgentExecutor, ExecutorSet, TaskDescriptor};
use crate::orchestration::resolver::DependencyResolver;
use crate::registry::agents::Lease;
use crate::registry::{AgentRegistry, TaskRegistry};
use crate::util::{retry_backoff, to_chrono, with_deadline};
use crate::Error;

/// Timing knobs for attempts and retries.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub default_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    pub fn backoff(&self, retry: u32) -> Duration {
        retry_backoff(retry, self.backoff_base, self.backoff_max)
    }
}

/// A running attempt. `id` is unique per dispatch, so a finished attempt
/// never clears the entry of a later attempt of the same task.
struct InFlight {
    id: u64,
    lease: Lease,
    token: CancellationToken,
}

/// Dispatches assigned tasks and decides what happens after each attempt.
pub struct ExecutionSupervisor {
    tasks: Arc<TaskRegistry>,
    agents: Arc<AgentRegistry>,
    executors: Arc<ExecutorSet>,
    resolver: Arc<DependencyResolver>,
    wake: Arc<Notify>,
    policy: RetryPolicy,
    in_flight: Mutex<HashMap<TaskId, InFlight>>,
    dispatches: AtomicU64,
    shutdown: CancellationToken,
}

impl ExecutionSupervisor {
    pub fn new(
        tasks: Arc<TaskRegistry>,
        agents: Arc<AgentRegistry>,
        executors: Arc<ExecutorSet>,
        resolver: Arc<DependencyResolver>,
        wake: Arc<Notify>,
        policy: RetryPolicy,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            tasks,
            agents,
            executors,
            resolver,
            wake,
            policy,
            in_flight: Mutex::new(HashMap::new()),
            dispatches: AtomicU64::new(0),
            shutdown,
        }
    }

    /// Start an attempt for a task the scheduler just assigned.
    ///
    /// `lease` is the unit of the agent's load the scheduler acquired for
    /// it; from here on the supervisor is responsible for releasing it.
    /// Must be called from within a tokio runtime.
    pub fn dispatch(self: &Arc<Self>, task: Task, lease: Lease) {
        let agent_id = lease.agent_id().clone();
        assert_eq!(
            task.assigned_agent.as_ref(),
            Some(&agent_id),
            "dispatch of task {} with a lease for another agent",
            task.id
        );

        let Some(executor) = self.executors.get(&agent_id) else {
            self.requeue(&task.id, &lease);
            return;
        };

        let token = self.shutdown.child_token();
        let flight = self.dispatches.fetch_add(1, Ordering::Relaxed);
        self.in_flight.lock().insert(
            task.id,
            InFlight {
                id: flight,
                lease: lease.clone(),
                token: token.clone(),
            },
        );

        let started = self.tasks.compare_and_set_status(
            &task.id,
            TaskStatus::Assigned,
            TaskStatus::Running,
            |t| {
                let now = Utc::now();
                t.started_at.get_or_insert(now);
                t.attempts.push(Attempt {
                    agent_id: agent_id.clone(),
                    started_at: now,
                    finished_at: None,
                    outcome: None,
                });
            },
        );
        let running = match started {
            Ok(running) => running,
            Err(err) => {
                // Cancelled between assignment and dispatch.
                debug!(task_id = %task.id, error = %err, "dispatch abandoned");
                self.forget(&task.id, flight);
                self.release(&lease);
                return;
            }
        };

        let deadline = running.timeout.unwrap_or(self.policy.default_timeout);
        let descriptor = TaskDescriptor::for_attempt(&running, agent_id.clone());
        info!(
            task_id = %running.id,
            agent_id = %agent_id,
            attempt = descriptor.attempt,
            "task started"
        );

        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            supervisor
                .supervise(descriptor, lease, flight, executor, token, deadline)
                .await;
        });
    }

    async fn supervise(
        self: Arc<Self>,
        descriptor: TaskDescriptor,
        lease: Lease,
        flight: u64,
        executor: Arc<dyn AgentExecutor>,
        token: CancellationToken,
        deadline: Duration,
    ) {
        let task_id = descriptor.task_id;
        let agent_id = lease.agent_id().clone();
        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            result = with_deadline(deadline, executor.execute(descriptor, token.clone())) => Some(result),
        };
        self.forget(&task_id, flight);

        match outcome {
            None => {
                debug!(task_id = %task_id, agent_id = %agent_id, "attempt aborted");
                self.release(&lease);
            }
            Some(Ok(Ok(value))) => self.complete(&task_id, &lease, value),
            Some(Ok(Err(err))) => {
                let error = TaskError::new(ErrorKind::Execution, err.message);
                self.fail(&task_id, &lease, error, err.retryable);
            }
            Some(Err(Error::Timeout(limit))) => {
                let error = TaskError::new(
                    ErrorKind::Timeout,
                    format!("attempt exceeded {:?}", limit),
                );
                self.fail(&task_id, &lease, error, true);
            }
            Some(Err(other)) => {
                let error = TaskError::new(ErrorKind::Execution, other.to_string());
                self.fail(&task_id, &lease, error, true);
            }
        }
    }

    fn complete(&self, task_id: &TaskId, lease: &Lease, value: serde_json::Value) {
        let agent_id = lease.agent_id();
        let result = self.tasks.compare_and_set_status(
            task_id,
            TaskStatus::Running,
            TaskStatus::Completed,
            |t| {
                t.result = Some(value);
                t.error = None;
                t.assigned_agent = None;
                t.close_attempt(AttemptOutcome::Succeeded);
            },
        );
        self.release(lease);
        match result {
            Ok(task) => {
                self.agents.record_outcome(agent_id, true);
                info!(
                    task_id = %task_id,
                    agent_id = %agent_id,
                    elapsed_ms = task.completion_time().map(|d| d.as_millis() as u64),
                    "task completed"
                );
                self.resolver.on_terminal(&task);
            }
            Err(err) => debug!(task_id = %task_id, error = %err, "completion discarded"),
        }
    }

    /// Apply the retry policy to a failed attempt.
    fn fail(&self, task_id: &TaskId, lease: &Lease, error: TaskError, retryable: bool) {
        self.retry_or_fail(task_id, lease.agent_id(), error, retryable);
        self.release(lease);
    }

    fn retry_or_fail(&self, task_id: &TaskId, agent_id: &AgentId, error: TaskError, retryable: bool) {
        let Some(current) = self.tasks.get(task_id) else {
            return;
        };
        if current.status != TaskStatus::Running {
            debug!(task_id = %task_id, status = %current.status, "failure discarded");
            return;
        }
        self.agents.record_outcome(agent_id, false);

        let outcome = AttemptOutcome::Failed {
            error: error.clone(),
        };
        if retryable && current.can_retry() {
            let retry = current.retry_count + 1;
            let delay = self.policy.backoff(retry);
            let result = self.tasks.compare_and_set_status(
                task_id,
                TaskStatus::Running,
                TaskStatus::Ready,
                |t| {
                    t.retry_count = retry;
                    t.assigned_agent = None;
                    t.not_before = Some(Utc::now() + to_chrono(delay));
                    t.error = Some(error.clone());
                    t.close_attempt(outcome.clone());
                },
            );
            if result.is_ok() {
                warn!(
                    task_id = %task_id,
                    agent_id = %agent_id,
                    retry,
                    max_retries = current.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "attempt failed, retrying"
                );
                self.wake.notify_one();
            }
            return;
        }

        let result = self.tasks.compare_and_set_status(
            task_id,
            TaskStatus::Running,
            TaskStatus::Failed,
            |t| {
                t.assigned_agent = None;
                t.error = Some(error.clone());
                t.close_attempt(outcome);
            },
        );
        if let Ok(task) = result {
            error!(
                task_id = %task_id,
                agent_id = %agent_id,
                attempts = task.attempts.len(),
                error = %error,
                "task failed permanently"
            );
            self.resolver.on_terminal(&task);
        }
    }

    /// Put an assigned task back to ready because its agent has no executor.
    fn requeue(&self, task_id: &TaskId, lease: &Lease) {
        let agent_id = lease.agent_id();
        let result = self.tasks.compare_and_set_status(
            task_id,
            TaskStatus::Assigned,
            TaskStatus::Ready,
            |t| {
                t.assigned_agent = None;
            },
        );
        if result.is_ok() {
            warn!(task_id = %task_id, agent_id = %agent_id, "agent vanished before dispatch, task requeued");
        }
        self.release(lease);
    }

    fn release(&self, lease: &Lease) {
        self.agents.release(lease);
        self.wake.notify_one();
    }

    /// Drop the in-flight entry of one dispatch, leaving a newer attempt's
    /// entry for the same task alone.
    fn forget(&self, task_id: &TaskId, flight: u64) {
        let mut in_flight = self.in_flight.lock();
        if in_flight.get(task_id).is_some_and(|f| f.id == flight) {
            in_flight.remove(task_id);
        }
    }

    /// Fire the cancellation token of a task's in-flight attempt, if any.
    pub fn abort(&self, task_id: &TaskId) -> bool {
        match self.in_flight.lock().get(task_id) {
            Some(flight) => {
                flight.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Fail every in-flight attempt of an agent that is going away. The
    /// failures are retryable; the attempts' futures are dropped.
    pub fn abandon_agent(&self, agent_id: &AgentId) -> usize {
        let victims: Vec<(TaskId, CancellationToken)> = self
            .in_flight
            .lock()
            .iter()
            .filter(|(_, flight)| flight.lease.agent_id() == agent_id)
            .map(|(id, flight)| (*id, flight.token.clone()))
            .collect();
        for (task_id, token) in &victims {
            token.cancel();
            let error = TaskError::new(
                ErrorKind::Execution,
                format!("agent {} unregistered during attempt", agent_id),
            );
            self.retry_or_fail(task_id, agent_id, error, true);
        }
        victims.len()
    }

    /// Number of attempts currently executing.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }
}
