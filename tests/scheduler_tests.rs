mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use fixtures::ScriptedWorkerFactory;
use taskswarm::channel::MessageServer;
use taskswarm::config::{ChannelConfig, SchedulerConfig, WorkerPoolConfig, WorkspaceConfig};
use taskswarm::graph::TaskSpec;
use taskswarm::scheduler::{Scheduler, SchedulerEvent};
use taskswarm::strategy::StrategyKind;
use taskswarm::{SwarmError, WorkerPool};

fn task(id: &str, deps: &[&str]) -> TaskSpec {
    TaskSpec::new(id, format!("work on {}", id))
        .with_dependencies(deps.iter().map(|s| s.to_string()).collect())
        .with_workspace(format!("/work/{}", id))
}

fn channel_config() -> ChannelConfig {
    ChannelConfig {
        enable_remote_fallback: false,
        ..ChannelConfig::default()
    }
}

struct Harness {
    scheduler: Scheduler,
    factory: Arc<ScriptedWorkerFactory>,
    _server: Arc<MessageServer>,
}

async fn harness(
    tasks: Vec<TaskSpec>,
    scheduler_config: SchedulerConfig,
    max_workers: usize,
    failing: &[&str],
) -> Harness {
    let server = Arc::new(MessageServer::bind(channel_config()).await.unwrap());
    let factory = Arc::new(ScriptedWorkerFactory::new(server.port()).failing(failing));
    let pool = Arc::new(
        WorkerPool::new(
            WorkerPoolConfig {
                max_workers,
                ..WorkerPoolConfig::default()
            },
            factory.clone(),
        )
        .unwrap(),
    );
    let scheduler = Scheduler::new(
        tasks,
        scheduler_config,
        &WorkspaceConfig::default(),
        pool,
        Arc::clone(&server),
    )
    .unwrap();
    Harness {
        scheduler,
        factory,
        _server: server,
    }
}

async fn run_and_collect(harness: &Harness) -> Vec<SchedulerEvent> {
    let mut rx = harness.scheduler.subscribe();
    tokio::time::timeout(Duration::from_secs(30), harness.scheduler.run())
        .await
        .expect("run timed out")
        .unwrap();

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn assigned_ids(events: &[SchedulerEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            SchedulerEvent::TaskAssigned { task_id, .. } => Some(task_id.clone()),
            _ => None,
        })
        .collect()
}

fn position_of(events: &[SchedulerEvent], wanted: &SchedulerEvent) -> Option<usize> {
    events.iter().position(|e| match (e, wanted) {
        (
            SchedulerEvent::TaskAssigned { task_id: a, .. },
            SchedulerEvent::TaskAssigned { task_id: b, .. },
        ) => a == b,
        (SchedulerEvent::TaskCompleted { task_id: a }, SchedulerEvent::TaskCompleted { task_id: b }) => {
            a == b
        }
        _ => false,
    })
}

fn assigned_marker(task_id: &str) -> SchedulerEvent {
    SchedulerEvent::TaskAssigned {
        task_id: task_id.to_string(),
        worker_id: String::new(),
    }
}

fn completed_marker(task_id: &str) -> SchedulerEvent {
    SchedulerEvent::TaskCompleted {
        task_id: task_id.to_string(),
    }
}

#[tokio::test]
async fn test_diamond_dag_completes_in_dependency_order() {
    let harness = harness(
        vec![
            task("a", &[]),
            task("b", &["a"]),
            task("c", &["a"]),
            task("d", &["b", "c"]),
        ],
        SchedulerConfig::default(),
        3,
        &[],
    )
    .await;

    let events = run_and_collect(&harness).await;

    assert!(matches!(events.first(), Some(SchedulerEvent::Started)));
    assert!(matches!(events.last(), Some(SchedulerEvent::Completed)));

    let assigned = assigned_ids(&events);
    assert_eq!(assigned.len(), 4);
    assert_eq!(assigned[0], "a");
    let middle: std::collections::HashSet<&str> =
        [assigned[1].as_str(), assigned[2].as_str()].into();
    assert_eq!(middle, ["b", "c"].into());
    assert_eq!(assigned[3], "d");

    // d only dispatches after both b and c settled.
    let d_assigned = position_of(&events, &assigned_marker("d")).unwrap();
    for dep in ["b", "c"] {
        let dep_done = position_of(&events, &completed_marker(dep)).unwrap();
        assert!(dep_done < d_assigned, "{} completed after d was assigned", dep);
    }
}

#[tokio::test]
async fn test_rate_aware_throttles_first_dispatch() {
    let tasks: Vec<TaskSpec> = (1..=10).map(|i| task(&format!("t{}", i), &[])).collect();
    let harness = harness(
        tasks,
        SchedulerConfig {
            strategy: StrategyKind::RateAware,
            max_rpm: 100,
            estimated_rpm_per_task: 40,
        },
        10,
        &[],
    )
    .await;

    let events = run_and_collect(&harness).await;
    assert!(matches!(events.last(), Some(SchedulerEvent::Completed)));
    assert_eq!(assigned_ids(&events).len(), 10);

    // floor(100 / 40) = 2 tasks fit before the first completion frees
    // headroom.
    let first_completion = events
        .iter()
        .position(|e| matches!(e, SchedulerEvent::TaskCompleted { .. }))
        .unwrap();
    let early_assignments = events[..first_completion]
        .iter()
        .filter(|e| matches!(e, SchedulerEvent::TaskAssigned { .. }))
        .count();
    assert_eq!(early_assignments, 2);
}

#[tokio::test]
async fn test_critical_path_dispatches_path_first() {
    // a -> b -> c is the critical path; d is a side branch off a.
    let harness = harness(
        vec![
            task("a", &[]),
            task("b", &["a"]),
            task("c", &["b"]),
            task("d", &["a"]),
        ],
        SchedulerConfig {
            strategy: StrategyKind::CriticalPath,
            ..SchedulerConfig::default()
        },
        2,
        &[],
    )
    .await;

    let events = run_and_collect(&harness).await;
    assert!(matches!(events.last(), Some(SchedulerEvent::Completed)));

    // After a completes the ready set is {b, d}; the path task b goes
    // out first.
    let b_assigned = position_of(&events, &assigned_marker("b")).unwrap();
    let d_assigned = position_of(&events, &assigned_marker("d")).unwrap();
    assert!(b_assigned < d_assigned);
}

#[tokio::test]
async fn test_workspace_conflict_rejects_construction() {
    let server = Arc::new(MessageServer::bind(channel_config()).await.unwrap());
    let factory = Arc::new(ScriptedWorkerFactory::new(server.port()));
    let pool = Arc::new(WorkerPool::new(WorkerPoolConfig::default(), factory).unwrap());

    let err = Scheduler::new(
        vec![
            TaskSpec::new("a", "a").with_workspace("/src"),
            TaskSpec::new("b", "b").with_workspace("/src/auth"),
        ],
        SchedulerConfig::default(),
        &WorkspaceConfig::default(),
        pool,
        server,
    )
    .unwrap_err();

    match err {
        SwarmError::WorkspaceConflict(conflicts) => assert_eq!(conflicts.len(), 1),
        other => panic!("expected workspace conflict, got {}", other),
    }
}

#[tokio::test]
async fn test_empty_task_list_completes_without_spawns() {
    let harness = harness(Vec::new(), SchedulerConfig::default(), 3, &[]).await;
    let events = run_and_collect(&harness).await;

    assert_eq!(events.len(), 2);
    assert!(matches!(events[0], SchedulerEvent::Started));
    assert!(matches!(events[1], SchedulerEvent::Completed));
    assert_eq!(harness.factory.create_count(), 0);
}

#[tokio::test]
async fn test_failed_task_blocks_dependents_and_withholds_completion() {
    let harness = harness(
        vec![task("a", &[]), task("b", &["a"])],
        SchedulerConfig::default(),
        3,
        &["a"],
    )
    .await;

    let events = run_and_collect(&harness).await;

    assert!(
        events
            .iter()
            .any(|e| matches!(e, SchedulerEvent::TaskFailed { task_id, .. } if task_id == "a"))
    );
    assert!(
        !events.iter().any(|e| matches!(e, SchedulerEvent::Completed)),
        "completed must not fire with a failed task in the graph"
    );
    assert_eq!(assigned_ids(&events), vec!["a"]);

    let stats = harness.scheduler.stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.pending, 1);
}

#[tokio::test]
async fn test_running_tasks_never_exceed_max_workers() {
    let tasks: Vec<TaskSpec> = (1..=8).map(|i| task(&format!("t{}", i), &[])).collect();
    let harness = harness(tasks, SchedulerConfig::default(), 2, &[]).await;

    let events = run_and_collect(&harness).await;
    assert!(matches!(events.last(), Some(SchedulerEvent::Completed)));

    // Replay the serial event stream counting in-flight tasks.
    let mut in_flight = 0usize;
    for event in &events {
        match event {
            SchedulerEvent::TaskAssigned { .. } => {
                in_flight += 1;
                assert!(in_flight <= 2, "more than max_workers tasks in flight");
            }
            SchedulerEvent::TaskCompleted { .. } | SchedulerEvent::TaskFailed { .. } => {
                in_flight -= 1;
            }
            _ => {}
        }
    }
}
