//! Durable store contract for shootouts, jobs, and credentials
//!
//! Every status change is a compare-and-set against the expected current
//! status; the patch applies in the same commit. Terminal transitions cannot
//! be undone. Postgres backs production; the memory store backs tests and
//! local development with identical CAS semantics.

pub mod memory;
pub mod postgres;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use shootout_common::Result;

use crate::domain::entities::{Credential, ErrorKind, Job, JobStatus, Shootout};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Outcome of a compare-and-set write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Applied,
    /// The row was not in the expected state; nothing changed
    Conflict,
}

impl CasOutcome {
    pub fn applied(&self) -> bool {
        matches!(self, CasOutcome::Applied)
    }
}

/// Merge patch applied together with a status transition
///
/// `None` leaves a column untouched; nested options distinguish
/// "leave" from "clear".
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub progress: Option<i16>,
    pub message: Option<Option<String>>,
    pub attempts_delta: i16,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result_path: Option<Option<String>>,
    pub error: Option<(ErrorKind, Option<String>)>,
}

impl JobPatch {
    /// Apply this patch to an in-memory job (shared semantics for backends)
    pub fn apply(&self, job: &mut Job) {
        if let Some(progress) = self.progress {
            job.progress = progress;
        }
        if let Some(message) = &self.message {
            job.message = message.clone();
        }
        job.attempts += self.attempts_delta;
        if let Some(started_at) = self.started_at {
            job.started_at = Some(started_at);
        }
        if let Some(completed_at) = self.completed_at {
            job.completed_at = Some(completed_at);
        }
        if let Some(result_path) = &self.result_path {
            job.result_path = result_path.clone();
        }
        if let Some((kind, detail)) = &self.error {
            job.error_kind = Some(*kind);
            job.error_detail = detail.clone();
        }
    }
}

/// Job listing filter
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
}

/// Offset pagination
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 20,
            offset: 0,
        }
    }
}

/// Durable store contract
#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    /// Atomically persist a shootout and its job; either both appear or neither
    async fn create_shootout_and_job(&self, shootout: &Shootout, job: &Job) -> Result<()>;

    async fn load_shootout(&self, shootout_id: Uuid) -> Result<Option<Shootout>>;

    async fn load_job(&self, job_id: Uuid) -> Result<Option<Job>>;

    async fn list_jobs(&self, owner_id: Uuid, filter: &JobFilter, page: &Page) -> Result<Vec<Job>>;

    /// CAS progress update, expected status `running`; no-op Conflict otherwise
    async fn update_job_progress(
        &self,
        job_id: Uuid,
        progress: i16,
        message: Option<String>,
    ) -> Result<CasOutcome>;

    /// CAS status transition with a merge patch applied in the same commit
    async fn transition_job(
        &self,
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
        patch: JobPatch,
    ) -> Result<CasOutcome>;

    /// Pending jobs created at or before `cutoff` (supervisor drain scan)
    async fn jobs_pending_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>>;

    /// Running jobs started at or before `cutoff` (wall-clock ceiling scan)
    async fn jobs_running_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>>;

    /// Terminal jobs completed at or before `cutoff` that still hold an artifact
    async fn jobs_retired_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>>;

    /// Null the artifact column after retention deleted the file
    async fn clear_result_path(&self, job_id: Uuid) -> Result<()>;

    /// Delete a job row and its shootout when no other job references it
    async fn delete_job(&self, job_id: Uuid) -> Result<bool>;

    async fn get_credential(&self, owner_id: Uuid) -> Result<Option<Credential>>;

    /// Upsert the credential row for its owner
    async fn put_credential(&self, credential: &Credential) -> Result<()>;

    async fn delete_credential(&self, owner_id: Uuid) -> Result<bool>;

    /// Flag the credential as unusable until the user re-links the provider
    async fn mark_credential_broken(&self, owner_id: Uuid) -> Result<()>;
}
