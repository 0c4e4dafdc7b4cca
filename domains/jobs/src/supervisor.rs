//! Supervisor: out-of-band repair loop
//!
//! Every tick it reaps expired leases back to `queued`, drains jobs parked
//! in `pending`, enforces the per-job wall-clock ceiling, and garbage
//! collects artifacts past retention. All writes are CAS-guarded, so
//! multiple supervisor instances are tolerated. Storage errors are logged
//! and retried on the next tick.

use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use shootout_broker::QueueBroker;
use shootout_common::Clock;

use crate::domain::entities::{ErrorKind, JobStatus};
use crate::hub::{ProgressEvent, ProgressHub};
use crate::repository::{JobPatch, JobStore};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub tick_interval: Duration,
    /// How long a job may sit in `pending` before the drain picks it up
    pub pending_age: Duration,
    /// Per-attempt wall-clock ceiling
    pub wall_clock: Duration,
    /// Artifact retention for terminal jobs
    pub retention: ChronoDuration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(10),
            pending_age: Duration::from_secs(60),
            wall_clock: Duration::from_secs(1800),
            retention: ChronoDuration::days(14),
        }
    }
}

pub struct Supervisor {
    store: Arc<dyn JobStore>,
    broker: Arc<dyn QueueBroker>,
    hub: Arc<ProgressHub>,
    clock: Arc<dyn Clock>,
    config: SupervisorConfig,
}

impl Supervisor {
    pub fn new(
        store: Arc<dyn JobStore>,
        broker: Arc<dyn QueueBroker>,
        hub: Arc<ProgressHub>,
        clock: Arc<dyn Clock>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            store,
            broker,
            hub,
            clock,
            config,
        }
    }

    /// Tick until shutdown
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval = ?self.config.tick_interval, "supervisor started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }
        tracing::info!("supervisor stopped");
    }

    /// One repair cycle (callable directly from tests)
    pub async fn tick(&self) {
        self.reap_lost_workers().await;
        self.drain_pending().await;
        self.timeout_runaways().await;
        self.sweep_retired_artifacts().await;
    }

    /// Expired leases: the broker already made the jobs deliverable again;
    /// flip their rows back to `queued` so the next claim succeeds
    async fn reap_lost_workers(&self) {
        let reaped = match self.broker.reap_expired().await {
            Ok(reaped) => reaped,
            Err(err) => {
                tracing::warn!(error = %err, "lease reap failed");
                return;
            }
        };

        for job_id in reaped {
            let job = match self.store.load_job(job_id).await {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(%job_id, error = %err, "load failed during reap");
                    continue;
                }
            };

            // A terminal row means the worker finished before its lease
            // lapsed; nothing to repair
            if job.status != JobStatus::Running {
                continue;
            }

            let outcome = self
                .store
                .transition_job(
                    job_id,
                    JobStatus::Running,
                    JobStatus::Queued,
                    JobPatch {
                        message: Some(Some("worker lost".to_string())),
                        ..Default::default()
                    },
                )
                .await;
            match outcome {
                Ok(o) if o.applied() => {
                    tracing::warn!(%job_id, "requeued job from lost worker");
                }
                Ok(_) => {}
                Err(err) => tracing::warn!(%job_id, error = %err, "requeue failed during reap"),
            }
        }
    }

    /// Jobs parked in `pending` (broker was down at admission) re-enter the queue
    async fn drain_pending(&self) {
        let cutoff = self.clock.now()
            - ChronoDuration::from_std(self.config.pending_age)
                .unwrap_or_else(|_| ChronoDuration::seconds(60));
        let pending = match self.store.jobs_pending_since(cutoff).await {
            Ok(pending) => pending,
            Err(err) => {
                tracing::warn!(error = %err, "pending scan failed");
                return;
            }
        };

        for job in pending {
            let outcome = self
                .store
                .transition_job(
                    job.id,
                    JobStatus::Pending,
                    JobStatus::Queued,
                    JobPatch {
                        message: Some(Some("requeued".to_string())),
                        ..Default::default()
                    },
                )
                .await;
            match outcome {
                Ok(o) if o.applied() => {}
                _ => continue,
            }

            if let Err(err) = self.broker.enqueue(job.id, self.clock.now()).await {
                tracing::warn!(job_id = %job.id, error = %err, "enqueue failed during drain; parking again");
                let _ = self
                    .store
                    .transition_job(
                        job.id,
                        JobStatus::Queued,
                        JobStatus::Pending,
                        JobPatch {
                            message: Some(Some("broker unavailable".to_string())),
                            ..Default::default()
                        },
                    )
                    .await;
            } else {
                tracing::info!(job_id = %job.id, "drained pending job into queue");
            }
        }
    }

    /// Enforce the wall-clock ceiling on runaway jobs
    async fn timeout_runaways(&self) {
        let cutoff = self.clock.now()
            - ChronoDuration::from_std(self.config.wall_clock)
                .unwrap_or_else(|_| ChronoDuration::seconds(1800));
        let runaways = match self.store.jobs_running_since(cutoff).await {
            Ok(runaways) => runaways,
            Err(err) => {
                tracing::warn!(error = %err, "runaway scan failed");
                return;
            }
        };

        for job in runaways {
            let now = self.clock.now();
            let outcome = self
                .store
                .transition_job(
                    job.id,
                    JobStatus::Running,
                    JobStatus::Failed,
                    JobPatch {
                        message: Some(Some("job wall clock exceeded".to_string())),
                        completed_at: Some(now),
                        error: Some((
                            ErrorKind::Timeout,
                            Some("job wall clock exceeded".to_string()),
                        )),
                        ..Default::default()
                    },
                )
                .await;

            match outcome {
                Ok(o) if o.applied() => {
                    tracing::warn!(job_id = %job.id, "runaway job timed out");
                    // Best-effort: ask the (possibly wedged) worker to stop
                    self.hub.cancel_token(job.id).cancel();
                    self.hub.publish(
                        job.id,
                        ProgressEvent::Terminal {
                            status: JobStatus::Failed,
                            result_path: None,
                            error_kind: Some(ErrorKind::Timeout),
                            error_detail: Some("job wall clock exceeded".to_string()),
                        },
                    );
                }
                Ok(_) => {}
                Err(err) => tracing::warn!(job_id = %job.id, error = %err, "timeout transition failed"),
            }
        }
    }

    /// Delete artifacts past retention; job rows remain as history
    async fn sweep_retired_artifacts(&self) {
        let cutoff = self.clock.now() - self.config.retention;
        let retired = match self.store.jobs_retired_before(cutoff).await {
            Ok(retired) => retired,
            Err(err) => {
                tracing::warn!(error = %err, "retention scan failed");
                return;
            }
        };

        for job in retired {
            let Some(result_path) = &job.result_path else {
                continue;
            };
            match tokio::fs::remove_file(result_path).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    tracing::warn!(job_id = %job.id, error = %err, "artifact unlink failed; retrying next tick");
                    continue;
                }
            }
            if let Err(err) = self.store.clear_result_path(job.id).await {
                tracing::warn!(job_id = %job.id, error = %err, "clearing result path failed");
            } else {
                tracing::info!(job_id = %job.id, "retired artifact removed");
            }
        }
    }
}
