//! End-to-end batch scenarios against the in-memory store and a scripted
//! transport.

use std::sync::Arc;
use std::time::Duration;

use fleetrun_batch::{BatchCoordinator, MemoryStore};
use fleetrun_core::{
    BatchExecution, BatchId, BatchStatus, CoordinatorError, ExecutionPolicy, HostStatus,
    ResolveError, StaticResolver, TargetSelector, Topology,
};
use fleetrun_session::testing::{FakeTransport, ScriptedRun, target};
use fleetrun_session::{ConnectionPool, PoolConfig};

type Coordinator = BatchCoordinator<MemoryStore, StaticResolver>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn setup(hosts: &[&str], config: PoolConfig) -> (Arc<Coordinator>, FakeTransport) {
    init_tracing();
    let transport = FakeTransport::new();
    let mut resolver = StaticResolver::new();
    for host in hosts {
        resolver = resolver.host(target(host), "ops");
    }
    let pool = Arc::new(ConnectionPool::new(Arc::new(transport.clone()), config));
    let coordinator = BatchCoordinator::new(
        Arc::new(MemoryStore::new()),
        Arc::new(resolver),
        pool,
    );
    (coordinator, transport)
}

fn hosts(ids: &[&str]) -> TargetSelector {
    TargetSelector::Hosts(ids.iter().map(ToString::to_string).collect())
}

fn policy(topology: Topology) -> ExecutionPolicy {
    ExecutionPolicy {
        topology,
        timeout_secs: 60,
        retry_count: 0,
        retry_delay_secs: 0,
        stop_on_first_error: false,
    }
}

async fn wait_terminal(coordinator: &Coordinator, batch_id: BatchId) -> BatchExecution {
    loop {
        let batch = coordinator.get_status(batch_id).await.unwrap();
        if batch.status.is_terminal() {
            return batch;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn parallel_batch_completes_every_host() {
    let (coordinator, transport) = setup(&["web1", "web2", "web3"], PoolConfig::default());
    transport.script(
        "web2",
        vec![ScriptedRun::Exit {
            code: 0,
            stdout: "up 12 days".into(),
            stderr: String::new(),
        }],
    );

    let batch_id = coordinator
        .submit(
            "uptime",
            &hosts(&["web1", "web2", "web3"]),
            "ops",
            policy(Topology::Parallel),
        )
        .await
        .unwrap();

    let batch = wait_terminal(&coordinator, batch_id).await;
    assert_eq!(batch.status, BatchStatus::Completed);
    assert_eq!(batch.completed_hosts, 3);
    assert_eq!(batch.failed_hosts, 0);
    assert!(batch.started_at.is_some());
    assert!(batch.finished_at.is_some());

    let rows = coordinator.get_results(batch_id).await.unwrap();
    assert_eq!(rows.len(), 3);
    for row in &rows {
        assert_eq!(row.status, HostStatus::Completed);
        assert_eq!(row.exit_code, Some(0));
        assert!(row.started_at.is_some());
        assert!(row.finished_at.is_some());
    }
    let web2 = rows.iter().find(|r| r.host_id == "web2").unwrap();
    assert_eq!(web2.stdout.as_deref(), Some("up 12 days"));

    // Cancelling a finished batch is a no-op and says so.
    assert!(!coordinator.cancel(batch_id).await.unwrap());
    let batch = coordinator.get_status(batch_id).await.unwrap();
    assert_eq!(batch.status, BatchStatus::Completed);
}

#[tokio::test]
async fn sequential_stop_on_first_error_leaves_later_hosts_pending() {
    let (coordinator, transport) = setup(&["db1", "db2", "db3"], PoolConfig::default());
    let fail = ScriptedRun::Exit {
        code: 1,
        stdout: String::new(),
        stderr: "migration failed".into(),
    };
    transport.script("db2", vec![fail.clone(), fail]);

    let batch_id = coordinator
        .submit(
            "run-migrations",
            &hosts(&["db1", "db2", "db3"]),
            "ops",
            ExecutionPolicy {
                retry_count: 1,
                stop_on_first_error: true,
                ..policy(Topology::Sequential)
            },
        )
        .await
        .unwrap();

    let batch = wait_terminal(&coordinator, batch_id).await;
    // Partial success still counts as completed; db3 was never launched.
    assert_eq!(batch.status, BatchStatus::Completed);
    assert_eq!(batch.completed_hosts, 1);
    assert_eq!(batch.failed_hosts, 1);

    let rows = coordinator.get_results(batch_id).await.unwrap();
    assert_eq!(rows[0].status, HostStatus::Completed);
    assert_eq!(rows[1].status, HostStatus::Failed);
    assert_eq!(rows[1].retry_attempt, 2);
    assert_eq!(rows[1].exit_code, Some(1));
    assert_eq!(rows[1].stderr.as_deref(), Some("migration failed"));
    assert_eq!(rows[2].status, HostStatus::Pending);
    assert!(rows[2].started_at.is_none());
}

#[tokio::test(start_paused = true)]
async fn parallel_stop_on_first_error_cancels_hosts_still_waiting() {
    // One slot forces the siblings to queue behind the pool; the first
    // terminal failure must stop whoever has not started executing yet.
    let (coordinator, transport) = setup(
        &["bad", "hang1", "hang2"],
        PoolConfig {
            max_connections: 1,
            ..PoolConfig::default()
        },
    );
    transport.script(
        "bad",
        vec![ScriptedRun::Exit {
            code: 1,
            stdout: String::new(),
            stderr: "broken host\n".into(),
        }],
    );
    transport.script("hang1", vec![ScriptedRun::Hang]);
    transport.script("hang2", vec![ScriptedRun::Hang]);

    let batch_id = coordinator
        .submit(
            "deploy.sh",
            &hosts(&["bad", "hang1", "hang2"]),
            "ops",
            ExecutionPolicy {
                timeout_secs: 5,
                stop_on_first_error: true,
                ..policy(Topology::Parallel)
            },
        )
        .await
        .unwrap();

    let batch = wait_terminal(&coordinator, batch_id).await;
    assert_eq!(batch.status, BatchStatus::Failed);
    assert_eq!(batch.completed_hosts, 0);

    let rows = coordinator.get_results(batch_id).await.unwrap();
    let failed = rows.iter().filter(|r| r.status == HostStatus::Failed).count();
    let cancelled = rows
        .iter()
        .filter(|r| r.status == HostStatus::Cancelled)
        .count();
    assert_eq!(failed + cancelled, 3);
    assert!(failed >= 1);
    // At least the last host in the pool queue observes the trip and never
    // runs the command.
    assert!(cancelled >= 1, "no sibling was stopped: {rows:?}");
    assert_eq!(batch.failed_hosts, u32::try_from(failed).unwrap());
}

#[tokio::test(start_paused = true)]
async fn timeout_is_retried_then_recorded_as_failure() {
    let (coordinator, transport) = setup(&["slow"], PoolConfig::default());
    transport.script("slow", vec![ScriptedRun::Hang, ScriptedRun::Hang]);

    let batch_id = coordinator
        .submit(
            "sleep 600",
            &hosts(&["slow"]),
            "ops",
            ExecutionPolicy {
                timeout_secs: 2,
                retry_count: 1,
                retry_delay_secs: 1,
                ..policy(Topology::Parallel)
            },
        )
        .await
        .unwrap();

    let batch = wait_terminal(&coordinator, batch_id).await;
    assert_eq!(batch.status, BatchStatus::Failed);
    assert_eq!(batch.completed_hosts, 0);
    assert_eq!(batch.failed_hosts, 1);

    let rows = coordinator.get_results(batch_id).await.unwrap();
    assert_eq!(rows[0].status, HostStatus::Failed);
    assert_eq!(rows[0].retry_attempt, 2);
    assert!(rows[0].exit_code.is_none());
    assert!(rows[0].error.as_deref().unwrap().contains("timed out"));

    // a timed-out session is broken and discarded, so the retry reconnects
    assert_eq!(transport.opened_total(), 2);
}

#[tokio::test]
async fn single_slot_pool_serializes_parallel_hosts() {
    let (coordinator, transport) = setup(
        &["app1", "app2"],
        PoolConfig {
            max_connections: 1,
            ..PoolConfig::default()
        },
    );

    let batch_id = coordinator
        .submit(
            "systemctl reload app",
            &hosts(&["app1", "app2"]),
            "ops",
            policy(Topology::Parallel),
        )
        .await
        .unwrap();

    let batch = wait_terminal(&coordinator, batch_id).await;
    assert_eq!(batch.status, BatchStatus::Completed);
    assert_eq!(batch.completed_hosts, 2);
    assert!(transport.max_open() <= 1);
}

#[tokio::test]
async fn concurrent_sessions_never_exceed_pool_capacity() {
    let ids: Vec<String> = (0..8).map(|i| format!("node{i}")).collect();
    let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    let (coordinator, transport) = setup(
        &id_refs,
        PoolConfig {
            max_connections: 3,
            ..PoolConfig::default()
        },
    );

    let batch_id = coordinator
        .submit("true", &hosts(&id_refs), "ops", policy(Topology::Parallel))
        .await
        .unwrap();

    let batch = wait_terminal(&coordinator, batch_id).await;
    assert_eq!(batch.status, BatchStatus::Completed);
    assert_eq!(batch.completed_hosts, 8);
    assert!(transport.max_open() <= 3);
}

#[tokio::test]
async fn cancel_marks_running_and_pending_hosts_cancelled() {
    let (coordinator, transport) = setup(&["stuck", "later"], PoolConfig::default());
    transport.script("stuck", vec![ScriptedRun::Hang]);

    let batch_id = coordinator
        .submit(
            "tail -f /var/log/syslog",
            &hosts(&["stuck", "later"]),
            "ops",
            policy(Topology::Sequential),
        )
        .await
        .unwrap();

    // wait until the first host is actually executing
    loop {
        let rows = coordinator.get_results(batch_id).await.unwrap();
        if rows[0].status == HostStatus::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(coordinator.cancel(batch_id).await.unwrap());
    assert!(!coordinator.cancel(batch_id).await.unwrap());

    let batch = coordinator.get_status(batch_id).await.unwrap();
    assert_eq!(batch.status, BatchStatus::Cancelled);
    assert_eq!(batch.completed_hosts, 0);
    assert_eq!(batch.failed_hosts, 0);
    assert!(batch.finished_at.is_some());

    let rows = coordinator.get_results(batch_id).await.unwrap();
    assert_eq!(rows[0].status, HostStatus::Cancelled);
    assert!(rows[0].started_at.is_some());
    assert_eq!(rows[1].status, HostStatus::Cancelled);
    assert!(rows[1].started_at.is_none());
    assert!(rows.iter().all(|r| r.status != HostStatus::Running));
}

#[tokio::test]
async fn submit_validates_command_and_targets() {
    let (coordinator, _transport) = setup(&["a"], PoolConfig::default());

    let err = coordinator
        .submit("   ", &hosts(&["a"]), "ops", policy(Topology::Parallel))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::EmptyCommand));

    let err = coordinator
        .submit("uptime", &hosts(&[]), "ops", policy(Topology::Parallel))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::NoTargets));

    let err = coordinator
        .submit("uptime", &hosts(&["a"]), "intruder", policy(Topology::Parallel))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CoordinatorError::Resolve(ResolveError::Unauthorized(_))
    ));
}

#[tokio::test]
async fn unknown_batch_ids_are_rejected() {
    let (coordinator, _transport) = setup(&["a"], PoolConfig::default());
    let missing = uuid::Uuid::new_v4();

    assert!(matches!(
        coordinator.get_status(missing).await.unwrap_err(),
        CoordinatorError::BatchNotFound(_)
    ));
    assert!(matches!(
        coordinator.get_results(missing).await.unwrap_err(),
        CoordinatorError::BatchNotFound(_)
    ));
    assert!(matches!(
        coordinator.cancel(missing).await.unwrap_err(),
        CoordinatorError::BatchNotFound(_)
    ));
}
