//! Engine invariants checked under concurrent load.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use conductor::{
    Error, EventKind, TaskFilter, TaskId, TaskSpec, TaskStatus, TaskType,
};

use crate::fixtures::{engine, finished, generalist, ProbeExecutor, ScriptedExecutor, DEADLINE};

/// Given a batch whose members depend on each other in a cycle
/// When it is submitted
/// Then it fails validation and nothing is stored
#[tokio::test]
async fn test_cycle_stores_nothing() {
    let engine = engine();
    let mut events = engine.subscribe();
    let a = TaskId::new();
    let b = TaskId::new();
    let c = TaskId::new();

    let result = engine.submit_batch(vec![
        TaskSpec::new(TaskType::General, "a").with_id(a).depends_on(c),
        TaskSpec::new(TaskType::General, "b").with_id(b).depends_on(a),
        TaskSpec::new(TaskType::General, "c").with_id(c).depends_on(b),
    ]);

    assert!(matches!(result, Err(Error::Validation(_))));
    assert!(engine.list_tasks(&TaskFilter::default()).is_empty());
    assert_eq!(engine.get_metrics().total_tasks, 0);
    assert!(events.drain().is_empty());

    // The registry is still usable after the rejected batch.
    let ok = engine
        .submit_task(TaskSpec::new(TaskType::General, "after").depends_on(TaskId::new()));
    assert!(matches!(ok, Err(Error::Validation(_))));
    assert!(engine
        .submit_task(TaskSpec::new(TaskType::General, "fine"))
        .is_ok());
}

/// Given a diamond-shaped DAG run by several agents
/// When every task completes
/// Then no task became ready before all of its dependencies completed
#[tokio::test]
async fn test_ready_only_after_dependencies_complete() {
    let engine = engine();
    let mut events = engine.subscribe_to(&[EventKind::TaskReady, EventKind::TaskCompleted]);
    for i in 0..3 {
        engine
            .register_agent(
                generalist(&format!("worker-{}", i), 2),
                Arc::new(ScriptedExecutor::succeeding(Duration::from_millis(2))),
            )
            .unwrap();
    }
    engine.start();

    let root = engine
        .submit_task(TaskSpec::new(TaskType::Analysis, "root"))
        .unwrap();
    let mut middle = Vec::new();
    for i in 0..6 {
        middle.push(
            engine
                .submit_task(TaskSpec::new(TaskType::General, format!("mid-{}", i)).depends_on(root))
                .unwrap(),
        );
    }
    let mut sink_spec = TaskSpec::new(TaskType::Testing, "sink");
    for id in &middle {
        sink_spec = sink_spec.depends_on(*id);
    }
    let sink = engine.submit_task(sink_spec).unwrap();

    assert_eq!(finished(&engine, &sink).await.status, TaskStatus::Completed);

    let mut completed: HashSet<TaskId> = HashSet::new();
    for event in events.drain() {
        let id = event.task_id.unwrap();
        match event.kind {
            EventKind::TaskCompleted => {
                completed.insert(id);
            }
            EventKind::TaskReady => {
                let task = engine.get_task(&id).unwrap();
                for dep in &task.dependencies {
                    assert!(
                        completed.contains(dep),
                        "task {} ready before dependency {} completed",
                        id,
                        dep
                    );
                }
            }
            _ => unreachable!(),
        }
    }
    assert_eq!(completed.len(), 8);
    engine.shutdown().await.unwrap();
}

/// Given many short tasks and agents with small capacities
/// When they all run
/// Then no agent ever runs more attempts than its capacity
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_load_never_exceeds_capacity() {
    let engine = engine();
    let probes: Vec<(u32, Arc<ProbeExecutor>)> = vec![
        (1, Arc::new(ProbeExecutor::default())),
        (2, Arc::new(ProbeExecutor::default())),
        (3, Arc::new(ProbeExecutor::default())),
    ];
    for (i, (capacity, probe)) in probes.iter().enumerate() {
        engine
            .register_agent(generalist(&format!("agent-{}", i), *capacity), probe.clone())
            .unwrap();
    }
    engine.start();

    let ids = engine
        .submit_batch(
            (0..60)
                .map(|i| TaskSpec::new(TaskType::General, format!("job-{}", i)))
                .collect(),
        )
        .unwrap();

    let watcher = async {
        loop {
            for agent in engine.list_agents() {
                assert!(
                    agent.load <= agent.capacity,
                    "agent {} load {} over capacity {}",
                    agent.id,
                    agent.load,
                    agent.capacity
                );
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    };
    let all_done = async {
        for id in &ids {
            finished(&engine, id).await;
        }
    };
    tokio::select! {
        _ = watcher => unreachable!(),
        _ = tokio::time::timeout(DEADLINE, all_done) => {}
    }

    for (capacity, probe) in &probes {
        assert!(probe.peak() as u32 <= *capacity);
    }
    let metrics = engine.get_metrics();
    assert_eq!(metrics.completed_tasks, 60);
    assert_eq!(metrics.success_rate, 1.0);
    assert!(engine.list_agents().iter().all(|a| a.load == 0));
    engine.shutdown().await.unwrap();
}

/// Given tasks that fail their first attempts
/// When they are retried
/// Then retry_count only grows and never passes max_retries
#[tokio::test]
async fn test_retry_count_is_monotonic_and_bounded() {
    let engine = engine();
    let mut retries = engine.subscribe_to(&[EventKind::TaskReady]);
    engine
        .register_agent(
            generalist("flaky", 2),
            Arc::new(ScriptedExecutor::new(Duration::from_millis(1), |task| {
                if task.attempt < 3 {
                    Err(conductor::ExecutionError::retryable("not yet"))
                } else {
                    Ok(serde_json::json!("ok"))
                }
            })),
        )
        .unwrap();
    engine.start();

    let eventually = engine
        .submit_task(TaskSpec::new(TaskType::General, "third time lucky").max_retries(3))
        .unwrap();
    let never = engine
        .submit_task(TaskSpec::new(TaskType::General, "out of budget").max_retries(1))
        .unwrap();

    let done = finished(&engine, &eventually).await;
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.retry_count, 2);
    assert_eq!(done.attempts.len(), 3);

    let failed = finished(&engine, &never).await;
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.retry_count, 1);

    let mut seen: HashMap<TaskId, u32> = HashMap::new();
    for event in retries.drain() {
        let Some(detail) = event.detail else { continue };
        let n: u32 = detail
            .strip_prefix("retry ")
            .and_then(|rest| rest.split(' ').next())
            .and_then(|n| n.parse().ok())
            .unwrap();
        let previous = seen.insert(event.task_id.unwrap(), n).unwrap_or(0);
        assert_eq!(n, previous + 1);
    }
    assert_eq!(seen[&eventually], 2);
    assert_eq!(seen[&never], 1);

    // A failed task stays failed.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(engine.get_task(&never).unwrap().status, TaskStatus::Failed);
    engine.shutdown().await.unwrap();
}

/// Given several producers submitting concurrently
/// When all their tasks run
/// Then every task completes exactly once with a distinct sequence number
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submission() {
    let engine = Arc::new(engine());
    for i in 0..2 {
        engine
            .register_agent(
                generalist(&format!("worker-{}", i), 4),
                Arc::new(ScriptedExecutor::succeeding(Duration::from_millis(1))),
            )
            .unwrap();
    }
    engine.start();

    let producers: Vec<_> = (0..8)
        .map(|p| {
            let engine = engine.clone();
            tokio::spawn(async move {
                (0..25)
                    .map(|i| {
                        engine
                            .submit_task(TaskSpec::new(TaskType::General, format!("p{}-{}", p, i)))
                            .unwrap()
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut ids = Vec::new();
    for producer in producers {
        ids.extend(producer.await.unwrap());
    }
    for id in &ids {
        assert_eq!(finished(&engine, id).await.status, TaskStatus::Completed);
    }

    let tasks = engine.list_tasks(&TaskFilter::default());
    assert_eq!(tasks.len(), 200);
    let seqs: HashSet<u64> = tasks.iter().map(|t| t.seq).collect();
    assert_eq!(seqs.len(), 200);
    assert!(tasks.iter().all(|t| t.attempts.len() == 1));
    engine.shutdown().await.unwrap();
}
