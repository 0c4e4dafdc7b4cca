//! Worker lease loop
//!
//! A worker hosts N execution slots. Each slot leases one job at a time,
//! claims it with a CAS (queued -> running, attempts + 1), resolves model
//! artifacts, and drives the blocking render engine on the blocking pool.
//! While the render runs, the slot forwards progress (store writes
//! throttled, hub publishes unthrottled), extends the lease on a heartbeat,
//! and watches for progress silence and the wall-clock ceiling.
//!
//! Terminal ordering is deliberate: transition first, then ack, then the
//! terminal event. If the worker dies after the transition, a late reap
//! finds a terminal status and skips the job.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use shootout_broker::{Lease, QueueBroker};
use shootout_common::Clock;
use shootout_registry::ModelFetcher;
use shootout_render::{RenderEngine, RenderError, RenderSpec};

use crate::credentials::{AuthError, CredentialService};
use crate::domain::entities::{ErrorKind, JobStatus, Shootout};
use crate::hub::{ProgressEvent, ProgressHub};
use crate::repository::{JobPatch, JobStore};

/// Minimum spacing between persisted progress writes per job (4/s)
const STORE_WRITE_INTERVAL: Duration = Duration::from_millis(250);

/// Requeue delay when the durable store is unreachable mid-claim
const STORE_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub slots: usize,
    pub max_attempts: i16,
    pub lease_wait: Duration,
    pub lease_ttl: Duration,
    pub heartbeat: Duration,
    pub wall_clock: Duration,
    pub progress_silence: Duration,
    pub backoff_base: Duration,
    pub outputs_root: PathBuf,
}

impl WorkerConfig {
    pub fn new(worker_id: impl Into<String>, outputs_root: PathBuf) -> Self {
        Self {
            worker_id: worker_id.into(),
            slots: 1,
            max_attempts: 3,
            lease_wait: Duration::from_secs(30),
            lease_ttl: Duration::from_secs(60),
            heartbeat: Duration::from_secs(20),
            wall_clock: Duration::from_secs(1800),
            progress_silence: Duration::from_secs(300),
            backoff_base: Duration::from_secs(2),
            outputs_root,
        }
    }
}

/// Why the cancel token tripped, when the worker itself tripped it
#[derive(Debug, Clone, Copy, PartialEq)]
enum TripReason {
    Ceiling,
    Silence,
}

pub struct Worker {
    store: Arc<dyn JobStore>,
    broker: Arc<dyn QueueBroker>,
    hub: Arc<ProgressHub>,
    credentials: Arc<CredentialService>,
    fetcher: Arc<dyn ModelFetcher>,
    engine: Arc<dyn RenderEngine>,
    clock: Arc<dyn Clock>,
    config: WorkerConfig,
}

enum ResolveFailure {
    Transient(String),
    Permanent(ErrorKind, String),
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn JobStore>,
        broker: Arc<dyn QueueBroker>,
        hub: Arc<ProgressHub>,
        credentials: Arc<CredentialService>,
        fetcher: Arc<dyn ModelFetcher>,
        engine: Arc<dyn RenderEngine>,
        clock: Arc<dyn Clock>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            broker,
            hub,
            credentials,
            fetcher,
            engine,
            clock,
            config,
        }
    }

    /// Run all slots until shutdown; in-flight jobs finish first
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut slots = tokio::task::JoinSet::new();
        for slot in 0..self.config.slots.max(1) {
            let worker = self.clone();
            let shutdown = shutdown.clone();
            slots.spawn(async move { worker.run_slot(slot, shutdown).await });
        }
        while slots.join_next().await.is_some() {}
    }

    async fn run_slot(&self, slot: usize, shutdown: CancellationToken) {
        tracing::info!(worker_id = %self.config.worker_id, slot, "worker slot started");
        loop {
            let lease = tokio::select! {
                _ = shutdown.cancelled() => break,
                lease = self.broker.lease(&self.config.worker_id, self.config.lease_wait) => lease,
            };

            match lease {
                Ok(Some(lease)) => self.process(lease).await,
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(slot, error = %err, "broker lease failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        tracing::info!(worker_id = %self.config.worker_id, slot, "worker slot stopped");
    }

    async fn process(&self, lease: Lease) {
        let job_id = lease.job_id;

        let job = match self.store.load_job(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::warn!(%job_id, "leased job does not exist; dropping delivery");
                let _ = self.broker.ack(&lease).await;
                return;
            }
            Err(err) => {
                tracing::warn!(%job_id, error = %err, "store unavailable during claim");
                let _ = self.broker.nack(&lease, STORE_RETRY_DELAY).await;
                return;
            }
        };

        // Stale delivery: a prior attempt already finished this job
        if job.is_terminal() {
            let _ = self.broker.ack(&lease).await;
            return;
        }

        let now = self.clock.now();
        let claimed = self
            .store
            .transition_job(
                job_id,
                JobStatus::Queued,
                JobStatus::Running,
                JobPatch {
                    started_at: Some(now),
                    attempts_delta: 1,
                    progress: Some(0),
                    message: Some(Some("starting".to_string())),
                    ..Default::default()
                },
            )
            .await;

        match claimed {
            Ok(outcome) if outcome.applied() => {}
            Ok(_) => {
                // Another worker won the claim, or the job was cancelled
                let _ = self.broker.ack(&lease).await;
                return;
            }
            Err(err) => {
                tracing::warn!(%job_id, error = %err, "store unavailable during claim");
                let _ = self.broker.nack(&lease, STORE_RETRY_DELAY).await;
                return;
            }
        }

        let attempt = job.attempts + 1;
        tracing::info!(%job_id, attempt, worker_id = %self.config.worker_id, "job claimed");
        self.hub.publish(
            job_id,
            ProgressEvent::Progress {
                progress: 0,
                message: Some("starting".to_string()),
            },
        );

        let shootout = match self.store.load_shootout(job.shootout_id).await {
            Ok(Some(shootout)) => shootout,
            Ok(None) => {
                self.finish_failed(&lease, job_id, ErrorKind::InvalidSpec, "shootout record missing")
                    .await;
                return;
            }
            Err(err) => {
                self.release_with_compensation(&lease, job_id, attempt, &err.to_string())
                    .await;
                return;
            }
        };

        let model_paths = match self.resolve_models(&shootout).await {
            Ok(paths) => paths,
            Err(ResolveFailure::Permanent(kind, detail)) => {
                self.finish_failed(&lease, job_id, kind, &detail).await;
                return;
            }
            Err(ResolveFailure::Transient(detail)) => {
                tracing::warn!(%job_id, detail, "model resolution failed transiently");
                self.release_with_compensation(&lease, job_id, attempt, "retrying model fetch")
                    .await;
                return;
            }
        };

        self.execute_render(lease, job_id, &shootout, model_paths, attempt)
            .await;
    }

    /// Resolve every distinct model reference to a local artifact path
    async fn resolve_models(
        &self,
        shootout: &Shootout,
    ) -> Result<HashMap<String, PathBuf>, ResolveFailure> {
        let refs = shootout.model_refs();
        if refs.is_empty() {
            return Ok(HashMap::new());
        }

        let bearer = self
            .credentials
            .bearer_for(shootout.owner_id)
            .await
            .map_err(|err| match err {
                AuthError::Permanent(detail) => {
                    ResolveFailure::Permanent(ErrorKind::Auth, detail)
                }
                AuthError::Transient(detail) => ResolveFailure::Transient(detail),
            })?;

        let mut paths = HashMap::new();
        for model_ref in refs {
            let path = self
                .fetcher
                .ensure_local(shootout.owner_id, &model_ref, &bearer)
                .await
                .map_err(|err| {
                    if err.is_transient() {
                        ResolveFailure::Transient(err.to_string())
                    } else {
                        ResolveFailure::Permanent(ErrorKind::ModelFetch, err.to_string())
                    }
                })?;
            paths.insert(model_ref, path);
        }
        Ok(paths)
    }

    async fn execute_render(
        &self,
        lease: Lease,
        job_id: Uuid,
        shootout: &Shootout,
        model_paths: HashMap<String, PathBuf>,
        attempt: i16,
    ) {
        let cancel = self.hub.cancel_token(job_id);
        let spec = RenderSpec {
            job_id,
            spec: render_payload(shootout, &model_paths),
            output_path: self
                .config
                .outputs_root
                .join("outputs")
                .join(format!("{}.mp4", job_id)),
        };

        let (progress_tx, mut progress_rx) = mpsc::channel::<(i16, String)>(64);
        let engine = self.engine.clone();
        let render_cancel = cancel.clone();
        let mut render_task = tokio::task::spawn_blocking(move || {
            engine.render(
                &spec,
                &mut |pct, msg| {
                    // Lossy by design: the newest progress wins
                    let _ = progress_tx.try_send((pct, msg.to_string()));
                },
                &render_cancel,
            )
        });

        let mut heartbeat = tokio::time::interval(self.config.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await; // the first tick fires immediately

        let started = tokio::time::Instant::now();
        let mut last_progress = tokio::time::Instant::now();
        let mut last_store_write: Option<tokio::time::Instant> = None;
        let mut progress_closed = false;
        let mut trip: Option<TripReason> = None;

        let render_result = loop {
            tokio::select! {
                result = &mut render_task => break result,

                received = progress_rx.recv(), if !progress_closed => {
                    match received {
                        Some((pct, msg)) => {
                            last_progress = tokio::time::Instant::now();
                            let due = last_store_write
                                .map_or(true, |at| at.elapsed() >= STORE_WRITE_INTERVAL);
                            if due {
                                last_store_write = Some(tokio::time::Instant::now());
                                if let Err(err) = self
                                    .store
                                    .update_job_progress(job_id, pct, Some(msg.clone()))
                                    .await
                                {
                                    tracing::warn!(%job_id, error = %err, "progress write failed");
                                }
                            }
                            self.hub.publish(
                                job_id,
                                ProgressEvent::Progress {
                                    progress: pct,
                                    message: Some(msg),
                                },
                            );
                        }
                        None => progress_closed = true,
                    }
                }

                _ = heartbeat.tick() => {
                    if trip.is_none() && started.elapsed() >= self.config.wall_clock {
                        tracing::warn!(%job_id, "wall-clock ceiling reached; cancelling render");
                        trip = Some(TripReason::Ceiling);
                        cancel.cancel();
                    } else if trip.is_none()
                        && last_progress.elapsed() >= self.config.progress_silence
                    {
                        tracing::warn!(%job_id, "progress silence; cancelling render for requeue");
                        trip = Some(TripReason::Silence);
                        cancel.cancel();
                    }

                    let deadline = self.clock.now()
                        + chrono::Duration::from_std(self.config.lease_ttl)
                            .unwrap_or_else(|_| chrono::Duration::seconds(60));
                    if let Err(err) = self.broker.extend(&lease, deadline).await {
                        // Keep rendering; the terminal CAS arbitrates duplicates
                        tracing::warn!(%job_id, error = %err, "lease extension failed");
                    }
                }
            }
        };

        match render_result {
            Ok(Ok(path)) => self.finish_succeeded(&lease, job_id, &path).await,
            Ok(Err(RenderError::Cancelled)) => match trip {
                Some(TripReason::Ceiling) => {
                    self.finish_failed(&lease, job_id, ErrorKind::Timeout, "job wall clock exceeded")
                        .await
                }
                Some(TripReason::Silence) => {
                    self.retry_or_fail(
                        &lease,
                        job_id,
                        attempt,
                        ErrorKind::Timeout,
                        "render stalled without progress",
                    )
                    .await
                }
                None => self.finish_cancelled(&lease, job_id).await,
            },
            Ok(Err(RenderError::Transient(detail))) => {
                self.retry_or_fail(&lease, job_id, attempt, ErrorKind::Render, &detail)
                    .await
            }
            Ok(Err(RenderError::Invalid(detail))) => {
                self.finish_failed(&lease, job_id, ErrorKind::Render, &detail)
                    .await
            }
            Err(join_err) => {
                tracing::error!(%job_id, error = %join_err, "render task panicked");
                self.retry_or_fail(
                    &lease,
                    job_id,
                    attempt,
                    ErrorKind::Internal,
                    &join_err.to_string(),
                )
                .await
            }
        }
    }

    async fn finish_succeeded(&self, lease: &Lease, job_id: Uuid, path: &std::path::Path) {
        let now = self.clock.now();
        let result_path = path.to_string_lossy().into_owned();
        let outcome = self
            .store
            .transition_job(
                job_id,
                JobStatus::Running,
                JobStatus::Succeeded,
                JobPatch {
                    progress: Some(100),
                    message: Some(Some("done".to_string())),
                    result_path: Some(Some(result_path.clone())),
                    completed_at: Some(now),
                    ..Default::default()
                },
            )
            .await;

        let _ = self.broker.ack(lease).await;

        match outcome {
            Ok(outcome) if outcome.applied() => {
                tracing::info!(%job_id, %result_path, "job succeeded");
                self.hub.publish(
                    job_id,
                    ProgressEvent::Terminal {
                        status: JobStatus::Succeeded,
                        result_path: Some(result_path),
                        error_kind: None,
                        error_detail: None,
                    },
                );
            }
            Ok(_) => {
                tracing::warn!(%job_id, "success transition lost the CAS; another actor finished the job")
            }
            Err(err) => tracing::error!(%job_id, error = %err, "success transition failed"),
        }
    }

    async fn finish_failed(&self, lease: &Lease, job_id: Uuid, kind: ErrorKind, detail: &str) {
        let now = self.clock.now();
        let outcome = self
            .store
            .transition_job(
                job_id,
                JobStatus::Running,
                JobStatus::Failed,
                JobPatch {
                    message: Some(Some(detail.to_string())),
                    completed_at: Some(now),
                    error: Some((kind, Some(detail.to_string()))),
                    ..Default::default()
                },
            )
            .await;

        let _ = self.broker.ack(lease).await;

        match outcome {
            Ok(o) if o.applied() => {
                tracing::warn!(%job_id, kind = kind.as_str(), detail, "job failed");
                self.hub.publish(
                    job_id,
                    ProgressEvent::Terminal {
                        status: JobStatus::Failed,
                        result_path: None,
                        error_kind: Some(kind),
                        error_detail: Some(detail.to_string()),
                    },
                );
            }
            Ok(_) => tracing::warn!(%job_id, "failure transition lost the CAS"),
            Err(err) => tracing::error!(%job_id, error = %err, "failure transition failed"),
        }
    }

    async fn finish_cancelled(&self, lease: &Lease, job_id: Uuid) {
        let now = self.clock.now();
        let outcome = self
            .store
            .transition_job(
                job_id,
                JobStatus::Running,
                JobStatus::Cancelled,
                JobPatch {
                    message: Some(Some("cancelled".to_string())),
                    completed_at: Some(now),
                    error: Some((ErrorKind::Cancelled, Some("cancelled by user".to_string()))),
                    ..Default::default()
                },
            )
            .await;

        let _ = self.broker.ack(lease).await;

        match outcome {
            Ok(o) if o.applied() => {
                tracing::info!(%job_id, "job cancelled");
                self.hub.publish(
                    job_id,
                    ProgressEvent::Terminal {
                        status: JobStatus::Cancelled,
                        result_path: None,
                        error_kind: Some(ErrorKind::Cancelled),
                        error_detail: Some("cancelled by user".to_string()),
                    },
                );
            }
            Ok(_) => tracing::warn!(%job_id, "cancel transition lost the CAS"),
            Err(err) => tracing::error!(%job_id, error = %err, "cancel transition failed"),
        }
    }

    /// Requeue after a render failure, or fail terminally once attempts run out
    async fn retry_or_fail(
        &self,
        lease: &Lease,
        job_id: Uuid,
        attempt: i16,
        kind: ErrorKind,
        detail: &str,
    ) {
        if attempt >= self.config.max_attempts {
            self.finish_failed(lease, job_id, kind, detail).await;
            return;
        }

        let outcome = self
            .store
            .transition_job(
                job_id,
                JobStatus::Running,
                JobStatus::Queued,
                JobPatch {
                    progress: Some(0),
                    message: Some(Some("retrying".to_string())),
                    ..Default::default()
                },
            )
            .await;

        match outcome {
            Ok(o) if o.applied() => {
                let delay = self.backoff(attempt);
                tracing::warn!(%job_id, attempt, delay_ms = delay.as_millis() as u64, detail, "attempt failed; requeued");
                if let Err(err) = self.broker.nack(lease, delay).await {
                    tracing::warn!(%job_id, error = %err, "nack failed after requeue");
                }
            }
            Ok(_) => {
                let _ = self.broker.ack(lease).await;
            }
            Err(err) => {
                tracing::error!(%job_id, error = %err, "requeue transition failed");
                let _ = self.broker.nack(lease, STORE_RETRY_DELAY).await;
            }
        }
    }

    /// Release a claim made moot before rendering (auth/model transients):
    /// the attempt is given back, so it does not count against the budget
    async fn release_with_compensation(
        &self,
        lease: &Lease,
        job_id: Uuid,
        attempt: i16,
        message: &str,
    ) {
        let outcome = self
            .store
            .transition_job(
                job_id,
                JobStatus::Running,
                JobStatus::Queued,
                JobPatch {
                    progress: Some(0),
                    attempts_delta: -1,
                    message: Some(Some(message.to_string())),
                    ..Default::default()
                },
            )
            .await;

        match outcome {
            Ok(o) if o.applied() => {
                if let Err(err) = self.broker.nack(lease, self.backoff(attempt)).await {
                    tracing::warn!(%job_id, error = %err, "nack failed after release");
                }
            }
            Ok(_) => {
                let _ = self.broker.ack(lease).await;
            }
            Err(err) => {
                tracing::error!(%job_id, error = %err, "release transition failed");
                let _ = self.broker.nack(lease, STORE_RETRY_DELAY).await;
            }
        }
    }

    fn backoff(&self, attempt: i16) -> Duration {
        let shift = attempt.saturating_sub(1).clamp(0, 8) as u32;
        let delay = self.config.backoff_base.saturating_mul(1u32 << shift);
        delay.min(Duration::from_secs(60))
    }
}

/// Shootout snapshot handed to the engine, with models resolved locally
fn render_payload(shootout: &Shootout, model_paths: &HashMap<String, PathBuf>) -> serde_json::Value {
    let models: serde_json::Map<String, serde_json::Value> = model_paths
        .iter()
        .map(|(model_ref, path)| {
            (
                model_ref.clone(),
                serde_json::Value::String(path.to_string_lossy().into_owned()),
            )
        })
        .collect();

    serde_json::json!({
        "title": shootout.title,
        "di_tracks": shootout.di_tracks.0,
        "signal_chains": shootout.signal_chains.0,
        "model_paths": models,
    })
}
