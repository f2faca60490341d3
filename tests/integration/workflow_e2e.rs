//! Workflow composition, failure policies and cancellation, end to end.

use std::sync::Arc;
use std::time::Duration;

use conductor::{
    AgentDescriptor, AgentId, AgentRole, CascadePolicy, Engine, Error, ErrorKind, EventKind,
    TaskFilter, TaskSpec, TaskStatus, TaskType, WorkflowFailurePolicy, WorkflowMode,
    WorkflowStatus,
};

use crate::fixtures::{
    engine, fast_config, finished, generalist, wait_status, GatedExecutor, ScriptedExecutor,
    DEADLINE,
};

/// Given a parallel workflow of three independent tasks
/// When all of them complete
/// Then one workflow.completed event is published with a member summary
#[tokio::test]
async fn test_parallel_workflow_completes() {
    let engine = engine();
    let mut events = engine.subscribe_to(&[
        EventKind::WorkflowCompleted,
        EventKind::WorkflowFailed,
        EventKind::WorkflowCancelled,
    ]);
    engine
        .register_agent(
            generalist("worker", 3),
            Arc::new(ScriptedExecutor::succeeding(Duration::from_millis(5))),
        )
        .unwrap();
    engine.start();

    let wf = engine
        .submit_workflow(
            "fan-out",
            vec![
                TaskSpec::new(TaskType::Analysis, "scan"),
                TaskSpec::new(TaskType::Documentation, "document"),
                TaskSpec::new(TaskType::Testing, "test"),
            ],
            WorkflowMode::Parallel,
        )
        .unwrap();

    // Parallel members share no edges, so all are ready at once.
    let view = engine.get_workflow(&wf).unwrap();
    for id in &view.task_ids {
        let task = engine.get_task(id).unwrap();
        assert!(task.dependencies.is_empty());
        assert_eq!(task.workflow_id, Some(wf));
    }

    let view = tokio::time::timeout(DEADLINE, engine.wait_for_workflow(&wf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(view.status, WorkflowStatus::Completed);
    assert_eq!(view.completed_count(), 3);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let announced = events.drain();
    assert_eq!(announced.len(), 1);
    assert_eq!(announced[0].kind, EventKind::WorkflowCompleted);
    assert_eq!(announced[0].workflow_id, Some(wf));
    assert_eq!(announced[0].detail.as_deref(), Some("3 of 3 tasks completed"));
    assert_eq!(engine.get_metrics().total_workflows, 1);
    engine.shutdown().await.unwrap();
}

/// Given a sequential workflow
/// When it is submitted
/// Then each member depends on the one before it
#[test]
fn test_sequential_workflow_chains_members() {
    let engine = engine();
    let wf = engine
        .submit_workflow(
            "chain",
            vec![
                TaskSpec::new(TaskType::Analysis, "plan"),
                TaskSpec::new(TaskType::CodeGeneration, "build"),
                TaskSpec::new(TaskType::Testing, "verify"),
            ],
            WorkflowMode::Sequential,
        )
        .unwrap();

    let view = engine.get_workflow(&wf).unwrap();
    let members: Vec<_> = view
        .task_ids
        .iter()
        .map(|id| engine.get_task(id).unwrap())
        .collect();
    assert!(members[0].dependencies.is_empty());
    assert!(members[1].dependencies.contains(&members[0].id));
    assert!(members[2].dependencies.contains(&members[1].id));
    assert_eq!(members[0].status, TaskStatus::Ready);
    assert_eq!(members[2].status, TaskStatus::Pending);
    assert_eq!(view.status, WorkflowStatus::Running);

    let order = engine.topological_order().unwrap();
    assert_eq!(order, view.task_ids);
}

/// Given invalid workflow submissions
/// When they are submitted
/// Then they are rejected and nothing is stored
#[test]
fn test_invalid_workflow_stores_nothing() {
    let engine = engine();
    assert!(matches!(
        engine.submit_workflow("", vec![TaskSpec::new(TaskType::General, "x")], WorkflowMode::Parallel),
        Err(Error::Validation(_))
    ));
    assert!(matches!(
        engine.submit_workflow("empty", vec![], WorkflowMode::Sequential),
        Err(Error::Validation(_))
    ));
    assert!(matches!(
        engine.submit_workflow(
            "bad member",
            vec![TaskSpec::new(TaskType::General, "  ")],
            WorkflowMode::Sequential
        ),
        Err(Error::Validation(_))
    ));
    assert!(engine.list_workflows().is_empty());
    assert!(engine.list_tasks(&TaskFilter::default()).is_empty());
}

/// Given a running workflow
/// When it is cancelled
/// Then every member is cancelled, the running attempt is dropped and the
/// agent's load is released
#[tokio::test]
async fn test_cancel_running_workflow() {
    let engine = engine();
    let mut events = engine.subscribe_to(&[EventKind::WorkflowCancelled]);
    let gate = GatedExecutor::new();
    engine
        .register_agent(generalist("worker", 1), Arc::new(gate.clone()))
        .unwrap();
    engine.start();

    let wf = engine
        .submit_workflow(
            "doomed",
            vec![
                TaskSpec::new(TaskType::General, "first"),
                TaskSpec::new(TaskType::General, "second"),
            ],
            WorkflowMode::Sequential,
        )
        .unwrap();
    let first = engine.get_workflow(&wf).unwrap().task_ids[0];
    wait_status(&engine, &first, TaskStatus::Running).await;

    let view = engine.cancel_workflow(&wf).unwrap();
    assert_eq!(view.status, WorkflowStatus::Cancelled);
    for id in &view.task_ids {
        let task = engine.get_task(id).unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_eq!(task.error.unwrap().kind, ErrorKind::Cancelled);
    }

    let released = tokio::time::timeout(DEADLINE, async {
        while engine.get_agent(&AgentId::from("worker")).unwrap().load > 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
    assert!(released.is_ok(), "load never released after cancel");

    // Opening the gate later must not resurrect the cancelled task.
    gate.open(1);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(engine.get_task(&first).unwrap().status, TaskStatus::Cancelled);

    let cancelled = events.drain();
    assert_eq!(cancelled.len(), 1);
    assert_eq!(cancelled[0].workflow_id, Some(wf));
    engine.shutdown().await.unwrap();
}

/// Given the wait-all failure policy and a parallel workflow
/// When one member fails while another is still running
/// Then the workflow stays running until the last member finishes
#[tokio::test]
async fn test_wait_all_policy_defers_failure() {
    let engine = Engine::new(conductor::EngineConfig {
        workflow_failure_policy: WorkflowFailurePolicy::WaitAll,
        ..fast_config()
    })
    .unwrap();
    let gate = GatedExecutor::new();
    engine
        .register_agent(
            AgentDescriptor::new("verifier", AgentRole::Verifier),
            Arc::new(ScriptedExecutor::failing_on("broken")),
        )
        .unwrap();
    engine
        .register_agent(
            AgentDescriptor::new("generalist", AgentRole::Orchestrator),
            Arc::new(gate.clone()),
        )
        .unwrap();
    engine.start();

    let wf = engine
        .submit_workflow(
            "mixed",
            vec![
                TaskSpec::new(TaskType::Testing, "broken"),
                TaskSpec::new(TaskType::General, "slow"),
            ],
            WorkflowMode::Parallel,
        )
        .unwrap();
    let ids = engine.get_workflow(&wf).unwrap().task_ids;

    wait_status(&engine, &ids[0], TaskStatus::Failed).await;
    wait_status(&engine, &ids[1], TaskStatus::Running).await;
    assert_eq!(
        engine.get_workflow(&wf).unwrap().status,
        WorkflowStatus::Running
    );

    gate.open(1);
    let view = tokio::time::timeout(DEADLINE, engine.wait_for_workflow(&wf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(view.status, WorkflowStatus::Failed);
    assert_eq!(view.completed_count(), 1);
    engine.shutdown().await.unwrap();
}

/// Given the block cascade policy
/// When a dependency fails
/// Then its dependents stay pending with the failure recorded until they
/// are cancelled by hand
#[tokio::test]
async fn test_block_policy_leaves_dependents_pending() {
    let engine = Engine::new(conductor::EngineConfig {
        cascade_policy: CascadePolicy::Block,
        ..fast_config()
    })
    .unwrap();
    engine
        .register_agent(
            generalist("worker", 1),
            Arc::new(ScriptedExecutor::failing_on("base")),
        )
        .unwrap();
    engine.start();

    let base = engine
        .submit_task(TaskSpec::new(TaskType::General, "base"))
        .unwrap();
    let child = engine
        .submit_task(TaskSpec::new(TaskType::General, "child").depends_on(base))
        .unwrap();
    let grandchild = engine
        .submit_task(TaskSpec::new(TaskType::General, "grandchild").depends_on(child))
        .unwrap();

    assert_eq!(finished(&engine, &base).await.status, TaskStatus::Failed);
    for id in [child, grandchild] {
        let task = engine.get_task(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.error.unwrap().kind, ErrorKind::DependencyFailed);
    }
    assert_eq!(engine.get_metrics().pending_tasks, 2);

    let cancelled = engine.cancel_task(&child).unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    // Still blocked: the block policy applies to the manual cancel as well.
    assert_eq!(
        engine.get_task(&grandchild).unwrap().status,
        TaskStatus::Pending
    );
    engine.cancel_task(&grandchild).unwrap();
    assert_eq!(engine.get_metrics().pending_tasks, 0);
    engine.shutdown().await.unwrap();
}
