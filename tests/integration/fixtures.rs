//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Engine configs with short backoffs
//! - Scripted executors (closure-driven, gated, concurrency-probing)
//! - Waiting on task status with a deadline

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use conductor::{
    AgentDescriptor, AgentExecutor, AgentRole, Engine, EngineConfig, ExecutionError,
    TaskDescriptor, TaskId, TaskStatus, TaskType,
};

/// Upper bound for any single wait in these tests.
pub const DEADLINE: Duration = Duration::from_secs(10);

/// Config with millisecond backoffs so retries do not slow the suite down.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        retry_backoff_base_ms: 1,
        retry_backoff_max_ms: 10,
        ..Default::default()
    }
}

pub fn engine() -> Engine {
    Engine::new(fast_config()).expect("valid config")
}

/// An agent that services every task type.
pub fn generalist(id: &str, capacity: u32) -> AgentDescriptor {
    let mut descriptor = AgentDescriptor::new(id, AgentRole::Orchestrator).capacity(capacity);
    for task_type in TaskType::ALL {
        descriptor = descriptor.capability(task_type);
    }
    descriptor
}

type Script = dyn Fn(&TaskDescriptor) -> Result<Value, ExecutionError> + Send + Sync;

/// Executor whose outcome is computed by a closure after a fixed latency.
pub struct ScriptedExecutor {
    latency: Duration,
    script: Box<Script>,
}

impl ScriptedExecutor {
    pub fn new<F>(latency: Duration, script: F) -> Self
    where
        F: Fn(&TaskDescriptor) -> Result<Value, ExecutionError> + Send + Sync + 'static,
    {
        Self {
            latency,
            script: Box::new(script),
        }
    }

    pub fn succeeding(latency: Duration) -> Self {
        Self::new(latency, |task| Ok(json!({ "done": task.description })))
    }

    pub fn always_failing() -> Self {
        Self::new(Duration::from_millis(1), |task| {
            Err(ExecutionError::retryable(format!(
                "attempt {} failed",
                task.attempt
            )))
        })
    }

    /// Fails permanently for tasks whose description matches.
    pub fn failing_on(description: &'static str) -> Self {
        Self::new(Duration::from_millis(2), move |task| {
            if task.description == description {
                Err(ExecutionError::permanent("scripted permanent failure"))
            } else {
                Ok(json!({ "done": task.description }))
            }
        })
    }
}

#[async_trait]
impl AgentExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        task: TaskDescriptor,
        _cancel: CancellationToken,
    ) -> Result<Value, ExecutionError> {
        tokio::time::sleep(self.latency).await;
        (self.script)(&task)
    }
}

/// Executor that holds every attempt until the test opens the gate.
#[derive(Clone)]
pub struct GatedExecutor {
    gate: Arc<Semaphore>,
}

impl GatedExecutor {
    pub fn new() -> Self {
        Self {
            gate: Arc::new(Semaphore::new(0)),
        }
    }

    /// Let `n` waiting (or future) attempts finish.
    pub fn open(&self, n: usize) {
        self.gate.add_permits(n);
    }
}

#[async_trait]
impl AgentExecutor for GatedExecutor {
    async fn execute(
        &self,
        task: TaskDescriptor,
        _cancel: CancellationToken,
    ) -> Result<Value, ExecutionError> {
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| ExecutionError::permanent("gate closed"))?;
        permit.forget();
        Ok(json!({ "done": task.description }))
    }
}

/// Executor that records how many of its attempts overlap.
#[derive(Default)]
pub struct ProbeExecutor {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ProbeExecutor {
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentExecutor for ProbeExecutor {
    async fn execute(
        &self,
        task: TaskDescriptor,
        _cancel: CancellationToken,
    ) -> Result<Value, ExecutionError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(3)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(json!({ "done": task.description }))
    }
}

/// Poll until the task reaches `status`, panicking after `DEADLINE`.
pub async fn wait_status(engine: &Engine, id: &TaskId, status: TaskStatus) {
    let reached = tokio::time::timeout(DEADLINE, async {
        loop {
            if engine.get_task(id).expect("task exists").status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
    assert!(
        reached.is_ok(),
        "task {} never reached {} (now {})",
        id,
        status,
        engine.get_task(id).map(|t| t.status.to_string()).unwrap_or_default()
    );
}

/// Wait for the task to finish and return its final record.
pub async fn finished(engine: &Engine, id: &TaskId) -> conductor::Task {
    tokio::time::timeout(DEADLINE, engine.wait_for_task(id))
        .await
        .expect("task did not finish in time")
        .unwrap_or_else(|_| engine.get_task(id).expect("task exists"))
}
