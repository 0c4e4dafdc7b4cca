//! Public operations the core exposes to the HTTP front door
//!
//! Framework-agnostic: callable from tests and thin HTTP handlers alike.
//! Ownership is enforced on every job-scoped call; a caller that is not the
//! owner is rejected with `Forbidden`.

use std::sync::Arc;
use uuid::Uuid;

use shootout_broker::QueueBroker;
use shootout_common::{Clock, Error, Result};

use crate::admission::Admission;
use crate::domain::entities::{
    Credential, ErrorKind, Job, JobStatus, Shootout, ShootoutDraft,
};
use crate::domain::state::JobEvent;
use crate::hub::{ProgressEvent, ProgressHub, Subscription};
use crate::repository::{JobFilter, JobPatch, JobStore, Page};

/// Current job state sent as the first frame of every subscription
#[derive(Debug, Clone, serde::Serialize)]
pub struct JobSnapshot {
    pub status: JobStatus,
    pub progress: i16,
    pub message: Option<String>,
    pub attempts: i16,
}

impl From<&Job> for JobSnapshot {
    fn from(job: &Job) -> Self {
        Self {
            status: job.status,
            progress: job.progress,
            message: job.message.clone(),
            attempts: job.attempts,
        }
    }
}

/// Credential material supplied by the front door after the user links the
/// external provider
#[derive(Debug, Clone, serde::Deserialize)]
pub struct CredentialGrant {
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: chrono::DateTime<chrono::Utc>,
}

pub struct CoreService {
    store: Arc<dyn JobStore>,
    broker: Arc<dyn QueueBroker>,
    hub: Arc<ProgressHub>,
    clock: Arc<dyn Clock>,
    admission: Admission,
}

impl CoreService {
    pub fn new(
        store: Arc<dyn JobStore>,
        broker: Arc<dyn QueueBroker>,
        hub: Arc<ProgressHub>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let admission = Admission::new(store.clone(), broker.clone(), clock.clone());
        Self {
            store,
            broker,
            hub,
            clock,
            admission,
        }
    }

    pub fn hub(&self) -> &Arc<ProgressHub> {
        &self.hub
    }

    /// Submit a shootout; returns the job id on success
    pub async fn submit_shootout(&self, owner_id: Uuid, draft: ShootoutDraft) -> Result<Uuid> {
        self.admission.submit(owner_id, draft).await
    }

    /// Fetch a job, enforcing ownership
    pub async fn get_job(&self, owner_id: Uuid, job_id: Uuid) -> Result<Job> {
        let job = self
            .store
            .load_job(job_id)
            .await?
            .ok_or_else(|| Error::NotFound("Job not found".to_string()))?;
        if job.owner_id != owner_id {
            return Err(Error::Forbidden(
                "You do not have access to this job".to_string(),
            ));
        }
        Ok(job)
    }

    /// Fetch the shootout backing a job the caller owns
    pub async fn get_shootout(&self, owner_id: Uuid, shootout_id: Uuid) -> Result<Shootout> {
        let shootout = self
            .store
            .load_shootout(shootout_id)
            .await?
            .ok_or_else(|| Error::NotFound("Shootout not found".to_string()))?;
        if shootout.owner_id != owner_id {
            return Err(Error::Forbidden(
                "You do not have access to this shootout".to_string(),
            ));
        }
        Ok(shootout)
    }

    /// List the caller's jobs with optional status filter and paging
    pub async fn list_jobs(
        &self,
        owner_id: Uuid,
        filter: JobFilter,
        page: Page,
    ) -> Result<Vec<Job>> {
        let page = Page {
            limit: page.limit.clamp(1, 100),
            offset: page.offset.max(0),
        };
        self.store.list_jobs(owner_id, &filter, &page).await
    }

    /// Cancel a job
    ///
    /// Pending and queued jobs cancel directly; a running job has its cancel
    /// token tripped and the worker performs the terminal transition.
    /// Cancelling a terminal job is a `Conflict`.
    pub async fn cancel_job(&self, owner_id: Uuid, job_id: Uuid) -> Result<()> {
        // CAS races (a worker picking the job up mid-cancel) are retried
        // against the fresh status rather than surfaced to the caller
        for _ in 0..3 {
            let job = self.get_job(owner_id, job_id).await?;

            if job.is_terminal() {
                return Err(Error::Conflict(format!(
                    "Job is already in terminal state '{}'",
                    job.status.as_str()
                )));
            }

            if job.status == JobStatus::Running {
                self.hub.cancel_token(job_id).cancel();
                tracing::info!(%job_id, "cancel requested for running job");
                return Ok(());
            }

            // pending | queued: cancel directly
            let target = job.next_status(JobEvent::Cancel)?;
            let now = self.clock.now();
            let outcome = self
                .store
                .transition_job(
                    job_id,
                    job.status,
                    target,
                    JobPatch {
                        completed_at: Some(now),
                        message: Some(Some("cancelled".to_string())),
                        error: Some((ErrorKind::Cancelled, Some("cancelled by user".to_string()))),
                        ..Default::default()
                    },
                )
                .await?;

            if outcome.applied() {
                self.hub.cancel_token(job_id).cancel();
                self.hub.publish(
                    job_id,
                    ProgressEvent::Terminal {
                        status: JobStatus::Cancelled,
                        result_path: None,
                        error_kind: Some(ErrorKind::Cancelled),
                        error_detail: Some("cancelled by user".to_string()),
                    },
                );
                tracing::info!(%job_id, "job cancelled");
                return Ok(());
            }
        }

        Err(Error::Conflict(
            "Job state changed repeatedly during cancel".to_string(),
        ))
    }

    /// Delete a terminal job and its artifact
    pub async fn delete_job(&self, owner_id: Uuid, job_id: Uuid) -> Result<()> {
        let job = self.get_job(owner_id, job_id).await?;
        if !job.is_terminal() {
            return Err(Error::Conflict(
                "Only terminal jobs can be deleted".to_string(),
            ));
        }

        if let Some(result_path) = &job.result_path {
            if let Err(err) = tokio::fs::remove_file(result_path).await {
                tracing::warn!(%job_id, error = %err, "failed to remove artifact during delete");
            }
        }

        self.store.delete_job(job_id).await?;
        tracing::info!(%job_id, "job deleted");
        Ok(())
    }

    /// Subscribe to a job's progress
    ///
    /// Returns the job as the snapshot source plus a live stream; the stream
    /// is absent when the job is already terminal. Subscribing before
    /// re-reading the row closes the gap where a terminal event lands in
    /// between.
    pub async fn subscribe_job(
        &self,
        owner_id: Uuid,
        job_id: Uuid,
    ) -> Result<(Job, Option<Subscription>)> {
        // Ownership check up front (also yields NotFound for unknown ids)
        self.get_job(owner_id, job_id).await?;

        let subscription = self.hub.subscribe(job_id);
        let job = self.get_job(owner_id, job_id).await?;

        if job.is_terminal() {
            return Ok((job, None));
        }
        Ok((job, Some(subscription)))
    }

    /// Store (upsert) the caller's external-provider credential
    pub async fn store_credential(&self, owner_id: Uuid, grant: CredentialGrant) -> Result<()> {
        let now = self.clock.now();
        let credential = Credential {
            owner_id,
            access_token: grant.access_token,
            refresh_token: grant.refresh_token,
            access_expires_at: grant.access_expires_at,
            refreshed_at: now,
            broken: false,
        };
        self.store.put_credential(&credential).await?;
        tracing::info!(%owner_id, "credential stored");
        Ok(())
    }

    /// Remove the caller's credential
    pub async fn revoke_credential(&self, owner_id: Uuid) -> Result<()> {
        if !self.store.delete_credential(owner_id).await? {
            return Err(Error::NotFound("No credential on file".to_string()));
        }
        tracing::info!(%owner_id, "credential revoked");
        Ok(())
    }

    /// Broker handle for composition roots wiring workers and supervisors
    pub fn broker(&self) -> &Arc<dyn QueueBroker> {
        &self.broker
    }
}
