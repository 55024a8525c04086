//! Integration tests for a full build session against in-memory slaves.
//!
//! Every test runs under a timeout so a hung teardown or listener fails
//! fast instead of stalling the suite.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;

use distbuild::channel::{CompileRequest, JobOutcome, MockBehavior, MockConnector, SlaveMessage};
use distbuild::error::{DispatchError, Error};
use distbuild::paths::{ProjectDirs, ProjectTree};
use distbuild::slave::WorkerState;
use distbuild::{JobState, Session, SessionConfig};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn config(local: usize) -> SessionConfig {
    SessionConfig {
        local_parallelism: local,
        connect_timeout: Duration::from_millis(500),
        send_timeout: Duration::from_millis(500),
        disconnect_timeout: Duration::from_secs(2),
        signal_disconnect_timeout: Duration::from_millis(200),
        cleanup_timeout: Duration::from_millis(300),
        ..SessionConfig::default()
    }
}

fn session_with(connector: &MockConnector, config: SessionConfig) -> Session {
    let tree = ProjectTree::new().with_project(
        ProjectDirs::new("demo")
            .with_source_dir("src")
            .with_object_dir("obj"),
    );
    Session::new("demo", config, Arc::new(connector.clone()), Arc::new(tree))
}

fn request(n: usize) -> CompileRequest {
    CompileRequest::new("demo", "c", format!("unit{n}.o"), format!("unit{n}.d"))
        .with_options(["-c".to_string(), format!("unit{n}.c")])
}

#[tokio::test]
async fn capacity_formula_tracks_active_transitions() {
    timeout(TEST_TIMEOUT, async {
        let connector = MockConnector::new();
        let alpha = connector.slave("alpha", MockBehavior::healthy());
        connector.slave("beta", MockBehavior::healthy());
        let session = session_with(&connector, config(4));

        session.declare("alpha:4,beta:2").unwrap();
        assert_eq!(session.total_capacity(), 4);

        session.register_all().await.unwrap();
        assert_eq!(session.total_capacity(), 4 + 4 + 2);

        alpha.drop_connection();
        timeout(Duration::from_secs(2), async {
            while session.total_capacity() != 6 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("capacity should drop once alpha is lost");
        assert_eq!(session.worker("alpha").unwrap().state, WorkerState::Unregistered);

        // Re-registering brings it back.
        session.register_all().await.unwrap();
        assert_eq!(session.total_capacity(), 10);
        assert_eq!(alpha.connects(), 2);

        session.unregister_all(false).await;
        assert_eq!(session.total_capacity(), 4);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn fair_dispatch_never_overcommits() {
    timeout(TEST_TIMEOUT, async {
        let connector = MockConnector::new();
        let a = connector.slave("a", MockBehavior::healthy());
        let b = connector.slave("b", MockBehavior::healthy());
        let session = session_with(&connector, config(4));
        session.declare("a:4,b:2").unwrap();
        session.register_all().await.unwrap();

        let mut hosts = Vec::new();
        for n in 0..6 {
            let job_id = session.run(request(n)).await.unwrap();
            let job = session.job(job_id).unwrap();
            assert_eq!(job.state, JobState::Running);
            hosts.push(job.host);
            for worker in session.workers() {
                assert!(worker.outstanding <= worker.slots);
            }
        }
        assert_eq!(hosts, vec!["a", "b", "a", "b", "a", "a"]);
        assert_eq!(a.compile_requests().len(), 4);
        assert_eq!(b.compile_requests().len(), 2);
        assert_eq!(session.capacity().remote_free(), 0);

        // Admission-control violation fails loudly instead of overcommitting.
        let err = session.run(request(6)).await.unwrap_err();
        assert!(matches!(err, DispatchError::NoFreeSlot { active: 2 }));
        assert_eq!(a.compile_requests().len() + b.compile_requests().len(), 6);

        session.unregister_all(false).await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn completions_release_slots_and_publish_events() {
    timeout(TEST_TIMEOUT, async {
        let connector = MockConnector::new();
        let slave = connector.slave("alpha", MockBehavior::healthy());
        let session = session_with(&connector, config(1));
        let mut events = session.take_events().unwrap();
        session.declare("alpha:2").unwrap();
        session.register_all().await.unwrap();

        let ok = session.run(request(1)).await.unwrap();
        let bad = session.run(request(2)).await.unwrap();
        assert_eq!(session.capacity().remote_free(), 0);

        slave.complete(
            ok,
            JobOutcome::Succeeded {
                artifacts: vec!["unit1.o".to_string(), "unit1.d".to_string()],
                output: String::new(),
            },
        );
        slave.complete(
            bad,
            JobOutcome::Failed {
                reason: "exit status 1".to_string(),
                output: "unit2.c:3: error".to_string(),
            },
        );

        let first = events.recv().await.unwrap();
        let second = events.recv().await.unwrap();
        assert_eq!(first.job_id, ok);
        assert_eq!(first.state, JobState::Completed);
        assert_eq!(second.job_id, bad);
        assert_eq!(second.state, JobState::Failed);

        assert_eq!(session.capacity().remote_free(), 2);
        assert_eq!(session.job(bad).unwrap().state, JobState::Failed);

        session.unregister_all(false).await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn partial_registration_degrades_capacity() {
    timeout(TEST_TIMEOUT, async {
        let connector = MockConnector::new();
        connector.slave("one", MockBehavior::healthy());
        connector.slave("two", MockBehavior::rejecting());
        connector.slave("three", MockBehavior::healthy());
        let session = session_with(&connector, config(2));
        session.declare("one:3,two:5,three:1").unwrap();

        let report = session.register_all().await.unwrap();
        assert_eq!(report.activated.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "two");
        assert_eq!(session.total_capacity(), 2 + 3 + 1);
        assert!(session.lookup_channel("two").is_none());
        assert!(session.lookup_channel("one").is_some());
        assert_eq!(session.worker("two").unwrap().state, WorkerState::Unregistered);

        session.unregister_all(false).await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn unknown_and_pending_hosts_have_no_channel() {
    timeout(TEST_TIMEOUT, async {
        let connector = MockConnector::new();
        connector.slave(
            "slow",
            MockBehavior::healthy().with_connect_delay(Duration::from_millis(200)),
        );
        let session = Arc::new(session_with(&connector, config(1)));
        session.declare("slow").unwrap();

        assert!(session.lookup_channel("never-declared").is_none());
        assert!(session.lookup_channel("slow").is_none());

        let registering = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.register_all().await.map(|r| r.activated) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(session.worker("slow").unwrap().state, WorkerState::Registering);
        assert!(session.lookup_channel("slow").is_none());

        let activated = registering.await.unwrap().unwrap();
        assert_eq!(activated, vec!["slow".to_string()]);
        assert!(session.lookup_channel("slow").is_some());

        session.unregister_all(false).await;
        assert!(session.lookup_channel("slow").is_none());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn teardown_is_idempotent() {
    timeout(TEST_TIMEOUT, async {
        let connector = MockConnector::new();
        let alpha = connector.slave("alpha", MockBehavior::healthy());
        connector.slave("beta", MockBehavior::healthy());
        let session = session_with(&connector, config(1));
        session.declare("alpha,beta,gamma").unwrap();
        session.register_all().await.unwrap();

        let first = session.unregister_all(false).await;
        assert!(!first.already_torn_down);
        assert_eq!(first.closed.len(), 2);
        assert!(first.forced.is_empty());
        assert_eq!(alpha.count("disconnect"), 1);
        assert!(alpha.is_closed());

        for _ in 0..3 {
            let again = session.unregister_all(true).await;
            assert!(again.already_torn_down);
            assert!(again.closed.is_empty());
        }

        assert_eq!(alpha.count("disconnect"), 1);
        assert!(session
            .workers()
            .iter()
            .all(|w| w.state == WorkerState::Closed));
        assert_eq!(session.capacity().workers.len(), 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn signal_teardown_is_bounded_by_unresponsive_slave() {
    timeout(TEST_TIMEOUT, async {
        let connector = MockConnector::new();
        let healthy: Vec<_> = (0..4)
            .map(|i| connector.slave(&format!("ok{i}"), MockBehavior::healthy()))
            .collect();
        let hung = connector.slave("hung", MockBehavior::healthy().hanging_on("disconnect"));
        let cfg = config(1);
        let per_worker = cfg.signal_disconnect_timeout;
        let session = session_with(&connector, cfg);
        session.declare("ok0,ok1,hung,ok2,ok3").unwrap();
        session.register_all().await.unwrap();

        let started = Instant::now();
        let report = session.unregister_all(true).await;
        let elapsed = started.elapsed();

        assert!(
            elapsed < per_worker * 3,
            "signal teardown took {elapsed:?}, per-worker bound {per_worker:?}"
        );
        assert_eq!(report.forced, vec!["hung".to_string()]);
        assert_eq!(report.closed.len(), 5);
        for slave in &healthy {
            assert!(slave.is_closed());
            assert_eq!(slave.count("disconnect"), 1);
        }
        assert_eq!(hung.count("disconnect"), 0);
        // Missing the deadline still closes the transport locally.
        assert!(hung.is_closed());
        assert!(session
            .workers()
            .iter()
            .all(|w| w.state == WorkerState::Closed));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn cleanup_is_scoped_and_sent_once_per_slave() {
    timeout(TEST_TIMEOUT, async {
        let connector = MockConnector::new();
        let a = connector.slave("a", MockBehavior::healthy().auto_completing());
        let b = connector.slave("b", MockBehavior::healthy().auto_completing());
        let session = session_with(&connector, config(1));
        let mut events = session.take_events().unwrap();
        session.declare("a:2,b:2").unwrap();
        session.register_all().await.unwrap();

        for n in 0..5 {
            while session.capacity().remote_free() == 0 {
                events.recv().await.unwrap();
            }
            session.run(request(n)).await.unwrap();
        }

        let report = session.clean_up("demo").await;
        assert_eq!(report.delivered, vec!["a".to_string(), "b".to_string()]);
        assert!(report.failed.is_empty());

        for slave in [&a, &b] {
            let cleanups: Vec<SlaveMessage> = slave
                .sent()
                .into_iter()
                .filter(|m| m.kind() == "clean_up")
                .collect();
            assert_eq!(
                cleanups,
                vec![SlaveMessage::CleanUp {
                    project: "demo".to_string()
                }]
            );
        }
        // Cleanup leaves connection state alone.
        assert!(session.lookup_channel("a").is_some());
        assert_eq!(session.total_capacity(), 5);

        session.unregister_all(false).await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn cleanup_failures_are_contained() {
    timeout(TEST_TIMEOUT, async {
        let connector = MockConnector::new();
        connector.slave("a", MockBehavior::healthy());
        connector.slave("stuck", MockBehavior::healthy().hanging_on("clean_up"));
        let session = session_with(&connector, config(1));
        session.declare("a,stuck").unwrap();
        session.register_all().await.unwrap();

        let report = session.clean_up("demo").await;
        assert_eq!(report.delivered, vec!["a".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "stuck");
        assert!(session.lookup_channel("stuck").is_some());

        session.unregister_all(false).await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn dispatch_rejected_once_teardown_began() {
    timeout(TEST_TIMEOUT, async {
        let connector = MockConnector::new();
        connector.slave("a", MockBehavior::healthy());
        let session = session_with(&connector, config(1));

        let err = session.run(request(0)).await.unwrap_err();
        assert!(matches!(err, DispatchError::NotRegistered));

        session.declare("a:2").unwrap();
        session.register_all().await.unwrap();
        session.unregister_all(false).await;

        let err = session.run(request(1)).await.unwrap_err();
        assert!(matches!(err, DispatchError::SessionClosed));
        assert!(matches!(
            session.register_all().await,
            Err(Error::Session(_))
        ));
        assert!(matches!(session.declare("b"), Err(Error::Session(_))));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn teardown_fails_running_jobs_without_losing_them() {
    timeout(TEST_TIMEOUT, async {
        let connector = MockConnector::new();
        connector.slave("a", MockBehavior::healthy());
        let session = session_with(&connector, config(1));
        let mut events = session.take_events().unwrap();
        session.declare("a:2").unwrap();
        session.register_all().await.unwrap();

        let job_id = session.run(request(0)).await.unwrap();
        session.unregister_all(true).await;

        let event = events.recv().await.unwrap();
        assert_eq!(event.job_id, job_id);
        assert_eq!(event.state, JobState::Failed);
        assert_eq!(session.job(job_id).unwrap().state, JobState::Failed);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn send_failure_fails_job_and_drops_slave() {
    timeout(TEST_TIMEOUT, async {
        let connector = MockConnector::new();
        let slave = connector.slave("a", MockBehavior::healthy().hanging_on("compile_request"));
        let session = session_with(&connector, config(1));
        session.declare("a:2").unwrap();
        session.register_all().await.unwrap();

        let err = session.run(request(0)).await.unwrap_err();
        let job_id = match err {
            DispatchError::SendFailed { job_id, ref host, .. } => {
                assert_eq!(host, "a");
                job_id
            }
            other => panic!("unexpected error {other:?}"),
        };
        assert_eq!(session.job(job_id).unwrap().state, JobState::Failed);
        assert!(session.lookup_channel("a").is_none());
        assert_eq!(session.total_capacity(), 1);
        assert!(slave.is_closed());

        session.unregister_all(false).await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn sessions_are_independent() {
    timeout(TEST_TIMEOUT, async {
        let connector = MockConnector::new();
        connector.slave("a", MockBehavior::healthy());
        connector.slave("b", MockBehavior::healthy());
        let first = session_with(&connector, config(1));
        let second = session_with(&connector, config(2));
        first.declare("a:3").unwrap();
        second.declare("b:1").unwrap();
        first.register_all().await.unwrap();
        second.register_all().await.unwrap();

        assert_ne!(first.id(), second.id());
        assert_eq!(first.total_capacity(), 4);
        assert_eq!(second.total_capacity(), 3);

        first.unregister_all(false).await;
        assert_eq!(second.total_capacity(), 3);
        assert!(second.lookup_channel("b").is_some());
        second.unregister_all(false).await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn teardown_during_registration_closes_half_registered_channel() {
    timeout(TEST_TIMEOUT, async {
        let connector = MockConnector::new();
        let stuck = connector.slave("stuck", MockBehavior::healthy().hanging_on("sync_complete"));
        let cfg = SessionConfig {
            connect_timeout: Duration::from_secs(3),
            ..config(1)
        };
        let session = Arc::new(session_with(&connector, cfg));
        session.declare("stuck:2").unwrap();

        let registering = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.register_all().await.map(|r| r.failed.len()) })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(stuck.connects(), 1);

        let started = Instant::now();
        session.unregister_all(true).await;
        let failed = registering.await.unwrap().unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));

        assert_eq!(failed, 1);
        assert!(stuck.is_closed());
        assert_eq!(session.worker("stuck").unwrap().state, WorkerState::Closed);
        assert!(session.lookup_channel("stuck").is_none());
    })
    .await
    .expect("test timed out");
}
