//! Recovery integration tests.
//!
//! These tests verify snapshot/restore across an engine restart, stale
//! agent detection through heartbeats, attempt timeouts and agent loss.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use conductor::state::{StateStore, SNAPSHOT_VERSION};
use conductor::{
    AgentId, AgentStatus, Engine, EngineConfig, Error, ErrorKind, TaskSpec, TaskStatus, TaskType,
};

use crate::fixtures::{
    engine, fast_config, finished, generalist, wait_status, GatedExecutor, ScriptedExecutor,
    DEADLINE,
};

/// Given an engine stopped while a task is running
/// When a new engine is opened from the state file and the agent returns
/// Then the interrupted task is requeued without spending retry budget and
/// the chain finishes
#[tokio::test]
async fn test_restart_resumes_interrupted_work() {
    let dir = TempDir::new().unwrap();
    let state_path = dir.path().join("state").join("conductor.json");
    let config = EngineConfig {
        state_path: Some(state_path.to_string_lossy().into_owned()),
        ..fast_config()
    };

    let first = Engine::new(config.clone()).unwrap();
    first
        .register_agent(generalist("worker", 1), Arc::new(GatedExecutor::new()))
        .unwrap();
    first.start();
    let build = first
        .submit_task(TaskSpec::new(TaskType::CodeGeneration, "build").max_retries(1))
        .unwrap();
    let test = first
        .submit_task(TaskSpec::new(TaskType::Testing, "test").depends_on(build))
        .unwrap();
    wait_status(&first, &build, TaskStatus::Running).await;
    let registered_at = first
        .get_agent(&AgentId::from("worker"))
        .unwrap()
        .registered_at;
    first.shutdown().await.unwrap();
    drop(first);

    let on_disk = StateStore::new(&state_path).load().await.unwrap().unwrap();
    assert_eq!(on_disk.version, SNAPSHOT_VERSION);
    assert_eq!(on_disk.count(TaskStatus::Running), 1);

    let second = Engine::open(config).await.unwrap();
    let interrupted = second.get_task(&build).unwrap();
    assert_eq!(interrupted.status, TaskStatus::Ready);
    assert_eq!(interrupted.retry_count, 0);
    assert_eq!(interrupted.error.unwrap().kind, ErrorKind::Interrupted);
    assert_eq!(second.get_task(&test).unwrap().status, TaskStatus::Pending);

    let agent = second.get_agent(&AgentId::from("worker")).unwrap();
    assert_eq!(agent.status, AgentStatus::Offline);

    second.start();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(second.get_task(&build).unwrap().status, TaskStatus::Ready);

    let rebound = second
        .register_agent(
            generalist("worker", 1),
            Arc::new(ScriptedExecutor::succeeding(Duration::from_millis(2))),
        )
        .unwrap();
    assert_eq!(rebound.registered_at, registered_at);

    assert_eq!(finished(&second, &test).await.status, TaskStatus::Completed);
    let build = second.get_task(&build).unwrap();
    assert_eq!(build.status, TaskStatus::Completed);
    assert_eq!(build.attempts.len(), 2);
    second.shutdown().await.unwrap();
}

/// Given a snapshot from a newer format
/// When it is restored
/// Then the restore is refused
#[test]
fn test_restore_rejects_unknown_snapshot_version() {
    let source = engine();
    source
        .submit_task(TaskSpec::new(TaskType::General, "x"))
        .unwrap();
    let mut snapshot = source.snapshot();
    snapshot.version = SNAPSHOT_VERSION + 1;

    assert!(matches!(
        Engine::restore(fast_config(), snapshot),
        Err(Error::UnsupportedSnapshot { .. })
    ));
}

/// Given an in-memory snapshot of a mixed engine
/// When it is restored into a fresh engine
/// Then tasks, workflows and agents carry over
#[test]
fn test_snapshot_restore_in_memory() {
    let source = engine();
    source
        .register_agent(
            generalist("idle", 2),
            Arc::new(ScriptedExecutor::succeeding(Duration::ZERO)),
        )
        .unwrap();
    let wf = source
        .submit_workflow(
            "pair",
            vec![
                TaskSpec::new(TaskType::General, "a"),
                TaskSpec::new(TaskType::General, "b"),
            ],
            conductor::WorkflowMode::Sequential,
        )
        .unwrap();

    let restored = Engine::restore(fast_config(), source.snapshot()).unwrap();
    let view = restored.get_workflow(&wf).unwrap();
    assert_eq!(view.member_statuses, vec![TaskStatus::Ready, TaskStatus::Pending]);
    assert_eq!(restored.list_agents().len(), 1);
    assert_eq!(restored.get_metrics().total_tasks, 2);

    // New submissions keep sequence numbers past the restored ones.
    let later = restored
        .submit_task(TaskSpec::new(TaskType::General, "later"))
        .unwrap();
    let later = restored.get_task(&later).unwrap();
    assert!(view
        .task_ids
        .iter()
        .all(|id| restored.get_task(id).unwrap().seq < later.seq));
}

/// Given a heartbeat timeout and an agent that stops reporting
/// When the timeout passes
/// Then the agent goes offline, gets no work, and a heartbeat revives it
#[tokio::test]
async fn test_stale_agent_goes_offline_until_heartbeat() {
    let engine = Engine::new(EngineConfig {
        heartbeat_timeout_secs: Some(1),
        ..fast_config()
    })
    .unwrap();
    let id = AgentId::from("quiet");
    engine
        .register_agent(
            generalist("quiet", 1),
            Arc::new(ScriptedExecutor::succeeding(Duration::from_millis(2))),
        )
        .unwrap();
    engine.start();

    let offline = tokio::time::timeout(DEADLINE, async {
        while engine.get_agent(&id).unwrap().status != AgentStatus::Offline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(offline.is_ok(), "agent never marked offline");

    let task = engine
        .submit_task(TaskSpec::new(TaskType::General, "waiting"))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(engine.get_task(&task).unwrap().status, TaskStatus::Ready);

    engine.heartbeat(&id, AgentStatus::Idle, 0).unwrap();
    assert_eq!(finished(&engine, &task).await.status, TaskStatus::Completed);
    engine.shutdown().await.unwrap();
}

/// Given an agent dropped by the health check while its attempt is running
/// When the same id registers again and more work arrives
/// Then the running attempt still holds its capacity, the new task waits,
/// and the dependent of the running task is promoted once it completes
#[tokio::test]
async fn test_rebind_during_running_attempt_keeps_load() {
    let engine = Engine::new(EngineConfig {
        heartbeat_timeout_secs: Some(1),
        ..fast_config()
    })
    .unwrap();
    let id = AgentId::from("impl");
    let gate = GatedExecutor::new();
    engine
        .register_agent(generalist("impl", 1), Arc::new(gate.clone()))
        .unwrap();
    engine.start();

    let first = engine
        .submit_task(TaskSpec::new(TaskType::CodeGeneration, "first"))
        .unwrap();
    let dependent = engine
        .submit_task(TaskSpec::new(TaskType::Testing, "dependent").depends_on(first))
        .unwrap();
    wait_status(&engine, &first, TaskStatus::Running).await;

    let offline = tokio::time::timeout(DEADLINE, async {
        while engine.get_agent(&id).unwrap().status != AgentStatus::Offline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(offline.is_ok(), "agent never marked offline");
    assert_eq!(engine.get_task(&first).unwrap().status, TaskStatus::Running);

    let revived = engine
        .register_agent(
            generalist("impl", 1),
            Arc::new(ScriptedExecutor::succeeding(Duration::from_millis(2))),
        )
        .unwrap();
    assert_eq!(revived.load, 1);
    assert_eq!(revived.status, AgentStatus::Busy);

    let second = engine
        .submit_task(TaskSpec::new(TaskType::General, "second"))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(engine.get_task(&second).unwrap().status, TaskStatus::Ready);
    assert_eq!(engine.get_agent(&id).unwrap().load, 1);

    gate.open(1);
    assert_eq!(finished(&engine, &first).await.status, TaskStatus::Completed);
    assert_eq!(finished(&engine, &dependent).await.status, TaskStatus::Completed);
    assert_eq!(finished(&engine, &second).await.status, TaskStatus::Completed);
    assert_eq!(engine.get_agent(&id).unwrap().load, 0);
    engine.shutdown().await.unwrap();
}

/// Given an agent unregistered while its attempt is running
/// When the id registers again before the old attempt winds down
/// Then the old attempt's release does not touch the new registration
#[tokio::test]
async fn test_reregister_after_unregister_starts_clean() {
    let engine = engine();
    let id = AgentId::from("impl");
    engine
        .register_agent(generalist("impl", 1), Arc::new(GatedExecutor::new()))
        .unwrap();
    engine.start();

    let stranded = engine
        .submit_task(TaskSpec::new(TaskType::General, "stranded"))
        .unwrap();
    wait_status(&engine, &stranded, TaskStatus::Running).await;

    let gate = GatedExecutor::new();
    engine.unregister_agent(&id).unwrap();
    engine
        .register_agent(generalist("impl", 1), Arc::new(gate.clone()))
        .unwrap();

    // The requeued task lands on the new registration, which holds the
    // only unit of capacity.
    wait_status(&engine, &stranded, TaskStatus::Running).await;
    let extra = engine
        .submit_task(TaskSpec::new(TaskType::General, "extra"))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(engine.get_agent(&id).unwrap().load, 1);
    assert_eq!(engine.get_task(&extra).unwrap().status, TaskStatus::Ready);

    gate.open(2);
    assert_eq!(finished(&engine, &stranded).await.status, TaskStatus::Completed);
    assert_eq!(finished(&engine, &extra).await.status, TaskStatus::Completed);
    assert_eq!(engine.get_agent(&id).unwrap().load, 0);
    engine.shutdown().await.unwrap();
}

/// Given an executor that never returns and a short task timeout
/// When the task runs
/// Then each attempt times out, the retry budget is spent and the task fails
#[tokio::test]
async fn test_attempt_timeout_is_retried_then_fails() {
    let engine = engine();
    engine
        .register_agent(generalist("stuck", 1), Arc::new(GatedExecutor::new()))
        .unwrap();
    engine.start();

    let id = engine
        .submit_task(
            TaskSpec::new(TaskType::General, "hangs")
                .timeout(Duration::from_millis(30))
                .max_retries(1),
        )
        .unwrap();
    let task = finished(&engine, &id).await;

    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempts.len(), 2);
    assert_eq!(task.error.unwrap().kind, ErrorKind::Timeout);
    assert_eq!(engine.get_agent(&AgentId::from("stuck")).unwrap().load, 0);
    assert!(engine.get_agent(&AgentId::from("stuck")).unwrap().performance_score < 0.5);
    engine.shutdown().await.unwrap();
}

/// Given registry lookups for agents that do not exist or already exist
/// When they are attempted
/// Then the matching lookup errors come back
#[test]
fn test_agent_lookup_errors() {
    let engine = engine();
    let executor = Arc::new(ScriptedExecutor::succeeding(Duration::ZERO));
    engine
        .register_agent(generalist("dup", 1), executor.clone())
        .unwrap();

    assert!(matches!(
        engine.register_agent(generalist("dup", 1), executor),
        Err(Error::AgentExists(_))
    ));
    assert!(matches!(
        engine.unregister_agent(&AgentId::from("ghost")),
        Err(Error::AgentNotFound(_))
    ));
    assert!(matches!(
        engine.heartbeat(&AgentId::from("ghost"), AgentStatus::Idle, 0),
        Err(Error::AgentNotFound(_))
    ));
}
