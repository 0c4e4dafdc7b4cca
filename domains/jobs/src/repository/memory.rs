//! In-memory durable store for tests and local development
//!
//! CAS semantics match the Postgres backend exactly: a transition applies
//! only when the row is in the expected status, and the patch lands in the
//! same critical section.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use shootout_common::Result;

use crate::domain::entities::{Credential, Job, JobStatus, Shootout};
use crate::repository::{CasOutcome, JobFilter, JobPatch, JobStore, Page};

#[derive(Default)]
struct Inner {
    shootouts: HashMap<Uuid, Shootout>,
    jobs: HashMap<Uuid, Job>,
    credentials: HashMap<Uuid, Credential>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot a job without going through the trait (test helper)
    pub fn job(&self, job_id: Uuid) -> Option<Job> {
        self.inner.lock().unwrap().jobs.get(&job_id).cloned()
    }
}

#[async_trait::async_trait]
impl JobStore for MemoryStore {
    async fn create_shootout_and_job(&self, shootout: &Shootout, job: &Job) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.shootouts.insert(shootout.id, shootout.clone());
        inner.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn load_shootout(&self, shootout_id: Uuid) -> Result<Option<Shootout>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .shootouts
            .get(&shootout_id)
            .cloned())
    }

    async fn load_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        Ok(self.inner.lock().unwrap().jobs.get(&job_id).cloned())
    }

    async fn list_jobs(&self, owner_id: Uuid, filter: &JobFilter, page: &Page) -> Result<Vec<Job>> {
        let inner = self.inner.lock().unwrap();
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|job| job.owner_id == owner_id)
            .filter(|job| filter.status.map_or(true, |status| job.status == status))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let offset = page.offset.max(0) as usize;
        let limit = page.limit.max(0) as usize;
        Ok(jobs.into_iter().skip(offset).take(limit).collect())
    }

    async fn update_job_progress(
        &self,
        job_id: Uuid,
        progress: i16,
        message: Option<String>,
    ) -> Result<CasOutcome> {
        let mut inner = self.inner.lock().unwrap();
        let Some(job) = inner.jobs.get_mut(&job_id) else {
            return Ok(CasOutcome::Conflict);
        };
        if job.status != JobStatus::Running {
            return Ok(CasOutcome::Conflict);
        }
        job.progress = progress;
        if let Some(message) = message {
            job.message = Some(message);
        }
        Ok(CasOutcome::Applied)
    }

    async fn transition_job(
        &self,
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
        patch: JobPatch,
    ) -> Result<CasOutcome> {
        let mut inner = self.inner.lock().unwrap();
        let Some(job) = inner.jobs.get_mut(&job_id) else {
            return Ok(CasOutcome::Conflict);
        };
        // Terminal rows never transition, whatever the caller expected
        if job.status != from || job.status.is_terminal() {
            return Ok(CasOutcome::Conflict);
        }
        job.status = to;
        patch.apply(job);
        Ok(CasOutcome::Applied)
    }

    async fn jobs_pending_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Pending && job.created_at <= cutoff)
            .cloned()
            .collect())
    }

    async fn jobs_running_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .jobs
            .values()
            .filter(|job| {
                job.status == JobStatus::Running
                    && job.started_at.map_or(false, |started| started <= cutoff)
            })
            .cloned()
            .collect())
    }

    async fn jobs_retired_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .jobs
            .values()
            .filter(|job| {
                job.is_terminal()
                    && job.result_path.is_some()
                    && job
                        .completed_at
                        .map_or(false, |completed| completed <= cutoff)
            })
            .cloned()
            .collect())
    }

    async fn clear_result_path(&self, job_id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(job) = inner.jobs.get_mut(&job_id) {
            job.result_path = None;
        }
        Ok(())
    }

    async fn delete_job(&self, job_id: Uuid) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let Some(job) = inner.jobs.remove(&job_id) else {
            return Ok(false);
        };
        let orphaned = !inner
            .jobs
            .values()
            .any(|other| other.shootout_id == job.shootout_id);
        if orphaned {
            inner.shootouts.remove(&job.shootout_id);
        }
        Ok(true)
    }

    async fn get_credential(&self, owner_id: Uuid) -> Result<Option<Credential>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .credentials
            .get(&owner_id)
            .cloned())
    }

    async fn put_credential(&self, credential: &Credential) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .credentials
            .insert(credential.owner_id, credential.clone());
        Ok(())
    }

    async fn delete_credential(&self, owner_id: Uuid) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .credentials
            .remove(&owner_id)
            .is_some())
    }

    async fn mark_credential_broken(&self, owner_id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(credential) = inner.credentials.get_mut(&owner_id) {
            credential.broken = true;
        }
        Ok(())
    }
}
