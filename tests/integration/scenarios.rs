//! End-to-end scenarios over the assembled core
//!
//! Everything runs hermetically: memory store and broker, programmable
//! mocks for the render engine, identity provider, and model registry,
//! with real Worker / Supervisor / CoreService instances.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use shootout_broker::{MemoryBroker, QueueBroker};
use shootout_common::{Clock, Error, ManualClock};
use shootout_idp::mock::{MockIdentityProvider, MockRefreshOutcome};
use shootout_registry::mock::MockModelFetcher;
use shootout_render::mock::{MockRenderEngine, MockRenderOutcome};

use shootout_jobs::{
    CoreService, Credential, CredentialService, DiTrack, ErrorKind, JobPatch, JobStatus, JobStore,
    MemoryStore, ProgressEvent, ProgressHub, ShootoutDraft, SignalChain, Stage, StageKind,
    Subscription, Supervisor, SupervisorConfig, Worker, WorkerConfig,
};

struct Harness {
    clock: Arc<ManualClock>,
    store: Arc<MemoryStore>,
    broker: Arc<MemoryBroker>,
    hub: Arc<ProgressHub>,
    core: Arc<CoreService>,
    engine: Arc<MockRenderEngine>,
    fetcher: Arc<MockModelFetcher>,
    idp: Arc<MockIdentityProvider>,
    worker: Arc<Worker>,
    supervisor: Supervisor,
}

fn harness() -> Harness {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let clock_dyn: Arc<dyn Clock> = clock.clone();
    let store = Arc::new(MemoryStore::new());
    let broker = Arc::new(MemoryBroker::new(clock_dyn.clone()));
    let hub = Arc::new(ProgressHub::new(clock_dyn.clone()));
    let core = Arc::new(CoreService::new(
        store.clone(),
        broker.clone(),
        hub.clone(),
        clock_dyn.clone(),
    ));

    let engine = Arc::new(MockRenderEngine::new());
    let root = std::env::temp_dir().join(format!("shootout-scenario-{}", Uuid::new_v4()));
    let fetcher = Arc::new(MockModelFetcher::new(root.join("models")));
    let idp = Arc::new(MockIdentityProvider::new());
    let credentials = Arc::new(CredentialService::new(
        store.clone(),
        idp.clone(),
        clock_dyn.clone(),
    ));

    let mut config = WorkerConfig::new("scenario-worker", root);
    config.lease_wait = Duration::from_millis(50);
    config.heartbeat = Duration::from_millis(50);
    // Instant retries: the manual clock does not advance on its own
    config.backoff_base = Duration::ZERO;

    let worker = Arc::new(Worker::new(
        store.clone(),
        broker.clone(),
        hub.clone(),
        credentials,
        fetcher.clone(),
        engine.clone(),
        clock_dyn.clone(),
        config,
    ));

    let supervisor = Supervisor::new(
        store.clone(),
        broker.clone(),
        hub.clone(),
        clock_dyn,
        SupervisorConfig::default(),
    );

    Harness {
        clock,
        store,
        broker,
        hub,
        core,
        engine,
        fetcher,
        idp,
        worker,
        supervisor,
    }
}

fn draft() -> ShootoutDraft {
    ShootoutDraft {
        title: "A".to_string(),
        description: None,
        di_tracks: vec![DiTrack {
            path: "u/1.wav".to_string(),
            guitar: None,
            pickup: None,
            notes: None,
        }],
        signal_chains: vec![SignalChain {
            name: "c".to_string(),
            description: None,
            stages: vec![
                Stage {
                    kind: StageKind::Model,
                    parameter: "m1".to_string(),
                },
                Stage {
                    kind: StageKind::Ir,
                    parameter: "i1".to_string(),
                },
            ],
        }],
    }
}

fn draft_without_models() -> ShootoutDraft {
    let mut d = draft();
    d.signal_chains[0].stages = vec![Stage {
        kind: StageKind::Gain,
        parameter: "-3".to_string(),
    }];
    d
}

async fn put_credential(h: &Harness, owner_id: Uuid, expired: bool) {
    let now = h.clock.now();
    let access_expires_at = if expired {
        now - chrono::Duration::minutes(5)
    } else {
        now + chrono::Duration::hours(1)
    };
    h.store
        .put_credential(&Credential {
            owner_id,
            access_token: "access-token".to_string(),
            refresh_token: "refresh-token".to_string(),
            access_expires_at,
            refreshed_at: now,
            broken: false,
        })
        .await
        .unwrap();
}

fn spawn_worker(h: &Harness) -> CancellationToken {
    let shutdown = CancellationToken::new();
    let worker = h.worker.clone();
    let token = shutdown.clone();
    tokio::spawn(async move { worker.run(token).await });
    shutdown
}

async fn next_event(subscription: &mut Subscription) -> Option<ProgressEvent> {
    tokio::time::timeout(Duration::from_secs(10), subscription.next())
        .await
        .expect("timed out waiting for a progress event")
}

/// Drain the stream to its terminal event, returning everything seen
async fn drain(subscription: &mut Subscription) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    while let Some(event) = next_event(subscription).await {
        let terminal = event.is_terminal();
        events.push(event);
        if terminal {
            break;
        }
    }
    events
}

#[tokio::test]
async fn s1_happy_path() {
    let h = harness();
    let owner = Uuid::new_v4();
    put_credential(&h, owner, false).await;

    let job_id = h.core.submit_shootout(owner, draft()).await.unwrap();
    let (job, subscription) = h.core.subscribe_job(owner, job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    let mut subscription = subscription.unwrap();

    let shutdown = spawn_worker(&h);
    let events = drain(&mut subscription).await;
    shutdown.cancel();

    // Terminal event carries the artifact
    match events.last().unwrap() {
        ProgressEvent::Terminal {
            status,
            result_path,
            ..
        } => {
            assert_eq!(*status, JobStatus::Succeeded);
            assert!(result_path.as_deref().map_or(false, |p| !p.is_empty()));
        }
        other => panic!("expected terminal event, got {:?}", other),
    }

    let done = h.core.get_job(owner, job_id).await.unwrap();
    assert_eq!(done.status, JobStatus::Succeeded);
    assert_eq!(done.progress, 100);
    assert_eq!(done.attempts, 1);
    assert!(done.result_path.is_some());
    assert!(done.validate().is_ok());

    // Per-subscriber monotone progress within the (single) attempt
    let climbs: Vec<i16> = events
        .iter()
        .filter_map(|event| match event {
            ProgressEvent::Progress { progress, .. } => Some(*progress),
            _ => None,
        })
        .collect();
    assert!(climbs.windows(2).all(|pair| pair[1] >= pair[0]));
}

#[tokio::test]
async fn s2_invalid_admission_writes_nothing() {
    let h = harness();
    let owner = Uuid::new_v4();

    let mut bad = draft();
    bad.signal_chains = vec![];
    let err = h.core.submit_shootout(owner, bad).await.unwrap_err();

    match err {
        Error::InvalidShootout { field, reason } => {
            assert_eq!(field, "signal_chains");
            assert_eq!(reason, "non_empty_required");
        }
        other => panic!("expected InvalidShootout, got {:?}", other),
    }

    // Zero rows written, no broker enqueue
    let jobs = h
        .core
        .list_jobs(owner, Default::default(), Default::default())
        .await
        .unwrap();
    assert!(jobs.is_empty());
    assert_eq!(h.broker.depth(), 0);
}

#[tokio::test]
async fn s3_transient_render_failures_retry_to_success() {
    let h = harness();
    h.engine.behavior().set_outcomes(vec![
        MockRenderOutcome::FailTransient,
        MockRenderOutcome::FailTransient,
        MockRenderOutcome::Complete,
    ]);

    let owner = Uuid::new_v4();
    let job_id = h
        .core
        .submit_shootout(owner, draft_without_models())
        .await
        .unwrap();
    let (_, subscription) = h.core.subscribe_job(owner, job_id).await.unwrap();
    let mut subscription = subscription.unwrap();

    let shutdown = spawn_worker(&h);
    let events = drain(&mut subscription).await;
    shutdown.cancel();

    let done = h.core.get_job(owner, job_id).await.unwrap();
    assert_eq!(done.status, JobStatus::Succeeded);
    assert_eq!(done.attempts, 3);

    // Three progress=0 resets (one per attempt), each followed by a climb,
    // then exactly one terminal
    let resets = events
        .iter()
        .filter(|event| matches!(event, ProgressEvent::Progress { progress: 0, .. }))
        .count();
    assert_eq!(resets, 3);

    let terminals = events.iter().filter(|event| event.is_terminal()).count();
    assert_eq!(terminals, 1);
    assert!(matches!(
        events.last().unwrap(),
        ProgressEvent::Terminal {
            status: JobStatus::Succeeded,
            ..
        }
    ));
}

#[tokio::test]
async fn s4_permanent_auth_failure() {
    let h = harness();
    let owner = Uuid::new_v4();
    // Expired credential whose refresh grant the provider rejects
    put_credential(&h, owner, true).await;
    h.idp.script(vec![MockRefreshOutcome::InvalidGrant]);

    let job_id = h.core.submit_shootout(owner, draft()).await.unwrap();
    let (_, subscription) = h.core.subscribe_job(owner, job_id).await.unwrap();
    let mut subscription = subscription.unwrap();

    let shutdown = spawn_worker(&h);
    let events = drain(&mut subscription).await;
    shutdown.cancel();

    let done = h.core.get_job(owner, job_id).await.unwrap();
    assert_eq!(done.status, JobStatus::Failed);
    assert_eq!(done.error_kind, Some(ErrorKind::Auth));
    // No retries for permanent failures
    assert_eq!(done.attempts, 1);

    assert!(matches!(
        events.last().unwrap(),
        ProgressEvent::Terminal {
            status: JobStatus::Failed,
            error_kind: Some(ErrorKind::Auth),
            ..
        }
    ));

    // Credential flagged broken; artifact cache untouched
    let credential = h.store.get_credential(owner).await.unwrap().unwrap();
    assert!(credential.broken);
    assert!(h.fetcher.recorded_fetches().is_empty());
}

#[tokio::test]
async fn s5_worker_crash_mid_render_recovers() {
    let h = harness();
    let owner = Uuid::new_v4();
    put_credential(&h, owner, false).await;

    let job_id = h.core.submit_shootout(owner, draft()).await.unwrap();
    let (_, subscription) = h.core.subscribe_job(owner, job_id).await.unwrap();
    let mut subscription = subscription.unwrap();

    // A worker claims the job and then dies before any progress
    let lease = h
        .broker
        .lease("doomed-worker", Duration::from_millis(50))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(lease.job_id, job_id);
    h.store
        .transition_job(
            job_id,
            JobStatus::Queued,
            JobStatus::Running,
            JobPatch {
                started_at: Some(h.clock.now()),
                attempts_delta: 1,
                progress: Some(0),
                message: Some(Some("starting".to_string())),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    drop(lease); // never acked, never extended

    // Lease expires; the supervisor repairs the row and the broker redelivers
    h.clock.advance(chrono::Duration::seconds(61));
    h.supervisor.tick().await;
    assert_eq!(
        h.store.job(job_id).unwrap().status,
        JobStatus::Queued
    );

    let shutdown = spawn_worker(&h);
    let events = drain(&mut subscription).await;
    shutdown.cancel();

    let done = h.core.get_job(owner, job_id).await.unwrap();
    assert_eq!(done.status, JobStatus::Succeeded);
    // The lost attempt plus the successful one
    assert_eq!(done.attempts, 2);

    // Terminal delivered exactly once to this subscriber
    let terminals = events.iter().filter(|event| event.is_terminal()).count();
    assert_eq!(terminals, 1);
}

#[tokio::test]
async fn s6_cancellation_while_running() {
    let h = harness();
    h.engine
        .behavior()
        .set_outcomes(vec![MockRenderOutcome::Hang]);
    h.engine.behavior().set_progress_steps(vec![10, 40]);

    let owner = Uuid::new_v4();
    let job_id = h
        .core
        .submit_shootout(owner, draft_without_models())
        .await
        .unwrap();
    let (_, subscription) = h.core.subscribe_job(owner, job_id).await.unwrap();
    let mut subscription = subscription.unwrap();

    let shutdown = spawn_worker(&h);

    // Cancel once rendering has reached 40%
    let mut events = Vec::new();
    loop {
        let event = next_event(&mut subscription)
            .await
            .expect("stream ended before reaching 40%");
        let at_forty = matches!(event, ProgressEvent::Progress { progress: 40, .. });
        events.push(event);
        if at_forty {
            break;
        }
    }
    h.core.cancel_job(owner, job_id).await.unwrap();

    events.extend(drain(&mut subscription).await);
    shutdown.cancel();

    match events.last().unwrap() {
        ProgressEvent::Terminal {
            status,
            result_path,
            error_kind,
            ..
        } => {
            assert_eq!(*status, JobStatus::Cancelled);
            assert_eq!(*error_kind, Some(ErrorKind::Cancelled));
            assert!(result_path.is_none());
        }
        other => panic!("expected terminal event, got {:?}", other),
    }

    let done = h.core.get_job(owner, job_id).await.unwrap();
    assert_eq!(done.status, JobStatus::Cancelled);
    assert!(done.result_path.is_none());
    assert_ne!(done.progress, 100);

    // Cancellation is idempotent: the second call is a clean conflict
    let err = h.core.cancel_job(owner, job_id).await.unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
}

#[tokio::test]
async fn ownership_is_enforced_end_to_end() {
    let h = harness();
    let owner = Uuid::new_v4();
    let stranger = Uuid::new_v4();

    let job_id = h
        .core
        .submit_shootout(owner, draft_without_models())
        .await
        .unwrap();

    assert!(matches!(
        h.core.get_job(stranger, job_id).await.unwrap_err(),
        Error::Forbidden(_)
    ));
    assert!(matches!(
        h.core.cancel_job(stranger, job_id).await.unwrap_err(),
        Error::Forbidden(_)
    ));
    assert!(matches!(
        h.core.subscribe_job(stranger, job_id).await.unwrap_err(),
        Error::Forbidden(_)
    ));
    assert!(matches!(
        h.core.delete_job(stranger, job_id).await.unwrap_err(),
        Error::Forbidden(_)
    ));

    // No state change from the stranger's attempts
    let job = h.core.get_job(owner, job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Queued);
}

#[tokio::test]
async fn terminal_jobs_are_immutable() {
    let h = harness();
    let owner = Uuid::new_v4();

    let job_id = h
        .core
        .submit_shootout(owner, draft_without_models())
        .await
        .unwrap();
    let shutdown = spawn_worker(&h);

    // Wait for completion
    let mut done = None;
    for _ in 0..600 {
        let job = h.core.get_job(owner, job_id).await.unwrap();
        if job.is_terminal() {
            done = Some(job);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown.cancel();
    let done = done.expect("job never finished");
    assert_eq!(done.status, JobStatus::Succeeded);

    // Every further transition attempt is a conflict, from any from-state
    for from in [JobStatus::Queued, JobStatus::Running, JobStatus::Succeeded] {
        let outcome = h
            .store
            .transition_job(job_id, from, JobStatus::Failed, JobPatch::default())
            .await
            .unwrap();
        assert!(!outcome.applied(), "terminal job must not transition");
    }
    assert_eq!(
        h.core.get_job(owner, job_id).await.unwrap().status,
        JobStatus::Succeeded
    );
}
