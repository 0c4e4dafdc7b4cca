//! Postgres-backed durable store
//!
//! Transitions are single `UPDATE ... WHERE id = $1 AND status = $2`
//! statements; `rows_affected` is the CAS outcome. The create path runs in
//! one transaction so shootout and job commit or roll back together.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use shootout_common::Result;

use crate::domain::entities::{Credential, Job, JobStatus, Shootout};
use crate::repository::{CasOutcome, JobFilter, JobPatch, JobStore, Page};

const JOB_COLUMNS: &str = "id, shootout_id, owner_id, status, progress, message, attempts, \
                           result_path, error_kind, error_detail, created_at, started_at, completed_at";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl JobStore for PgStore {
    async fn create_shootout_and_job(&self, shootout: &Shootout, job: &Job) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO shootouts (id, owner_id, title, description, di_tracks, signal_chains,
                                   created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(shootout.id)
        .bind(shootout.owner_id)
        .bind(&shootout.title)
        .bind(&shootout.description)
        .bind(&shootout.di_tracks)
        .bind(&shootout.signal_chains)
        .bind(shootout.created_at)
        .bind(shootout.updated_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO jobs (id, shootout_id, owner_id, status, progress, message, attempts,
                              result_path, error_kind, error_detail, created_at, started_at,
                              completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(job.id)
        .bind(job.shootout_id)
        .bind(job.owner_id)
        .bind(job.status)
        .bind(job.progress)
        .bind(&job.message)
        .bind(job.attempts)
        .bind(&job.result_path)
        .bind(job.error_kind)
        .bind(&job.error_detail)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn load_shootout(&self, shootout_id: Uuid) -> Result<Option<Shootout>> {
        let row = sqlx::query_as::<_, Shootout>(
            r#"
            SELECT id, owner_id, title, description, di_tracks, signal_chains,
                   created_at, updated_at
            FROM shootouts WHERE id = $1
            "#,
        )
        .bind(shootout_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn load_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, Job>(&format!(
            "SELECT {} FROM jobs WHERE id = $1",
            JOB_COLUMNS
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_jobs(&self, owner_id: Uuid, filter: &JobFilter, page: &Page) -> Result<Vec<Job>> {
        let rows = if let Some(status) = filter.status {
            sqlx::query_as::<_, Job>(&format!(
                "SELECT {} FROM jobs WHERE owner_id = $1 AND status = $4 \
                 ORDER BY created_at DESC LIMIT $2 OFFSET $3",
                JOB_COLUMNS
            ))
            .bind(owner_id)
            .bind(page.limit)
            .bind(page.offset)
            .bind(status)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as::<_, Job>(&format!(
                "SELECT {} FROM jobs WHERE owner_id = $1 \
                 ORDER BY created_at DESC LIMIT $2 OFFSET $3",
                JOB_COLUMNS
            ))
            .bind(owner_id)
            .bind(page.limit)
            .bind(page.offset)
            .fetch_all(&self.pool)
            .await?
        };
        Ok(rows)
    }

    async fn update_job_progress(
        &self,
        job_id: Uuid,
        progress: i16,
        message: Option<String>,
    ) -> Result<CasOutcome> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET progress = $3, message = COALESCE($4, message)
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(job_id)
        .bind(JobStatus::Running)
        .bind(progress)
        .bind(&message)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(CasOutcome::Conflict);
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
        let (set_message, message) = match &patch.message {
            Some(value) => (true, value.clone()),
            None => (false, None),
        };
        let (set_result_path, result_path) = match &patch.result_path {
            Some(value) => (true, value.clone()),
            None => (false, None),
        };
        let (set_error, error_kind, error_detail) = match &patch.error {
            Some((kind, detail)) => (true, Some(*kind), detail.clone()),
            None => (false, None, None),
        };

        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                status = $3,
                progress = COALESCE($4, progress),
                message = CASE WHEN $5 THEN $6 ELSE message END,
                attempts = attempts + $7,
                started_at = COALESCE($8, started_at),
                completed_at = COALESCE($9, completed_at),
                result_path = CASE WHEN $10 THEN $11 ELSE result_path END,
                error_kind = CASE WHEN $12 THEN $13 ELSE error_kind END,
                error_detail = CASE WHEN $12 THEN $14 ELSE error_detail END
            WHERE id = $1 AND status = $2
              AND status NOT IN ('succeeded', 'failed', 'cancelled')
            "#,
        )
        .bind(job_id)
        .bind(from)
        .bind(to)
        .bind(patch.progress)
        .bind(set_message)
        .bind(&message)
        .bind(patch.attempts_delta)
        .bind(patch.started_at)
        .bind(patch.completed_at)
        .bind(set_result_path)
        .bind(&result_path)
        .bind(set_error)
        .bind(error_kind)
        .bind(&error_detail)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(CasOutcome::Conflict);
        }
        Ok(CasOutcome::Applied)
    }

    async fn jobs_pending_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, Job>(&format!(
            "SELECT {} FROM jobs WHERE status = $1 AND created_at <= $2",
            JOB_COLUMNS
        ))
        .bind(JobStatus::Pending)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn jobs_running_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, Job>(&format!(
            "SELECT {} FROM jobs WHERE status = $1 AND started_at <= $2",
            JOB_COLUMNS
        ))
        .bind(JobStatus::Running)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn jobs_retired_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, Job>(&format!(
            "SELECT {} FROM jobs \
             WHERE status IN ('succeeded', 'failed', 'cancelled') \
               AND completed_at <= $1 AND result_path IS NOT NULL",
            JOB_COLUMNS
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn clear_result_path(&self, job_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE jobs SET result_path = NULL WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_job(&self, job_id: Uuid) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let shootout_id: Option<Uuid> =
            sqlx::query_scalar("DELETE FROM jobs WHERE id = $1 RETURNING shootout_id")
                .bind(job_id)
                .fetch_optional(&mut *tx)
                .await?;

        let Some(shootout_id) = shootout_id else {
            tx.rollback().await?;
            return Ok(false);
        };

        // The shootout is owned by its jobs; drop it once the last one is gone
        sqlx::query(
            r#"
            DELETE FROM shootouts s
            WHERE s.id = $1 AND NOT EXISTS (SELECT 1 FROM jobs j WHERE j.shootout_id = s.id)
            "#,
        )
        .bind(shootout_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn get_credential(&self, owner_id: Uuid) -> Result<Option<Credential>> {
        let row = sqlx::query_as::<_, Credential>(
            r#"
            SELECT owner_id, access_token, refresh_token, access_expires_at, refreshed_at, broken
            FROM credentials WHERE owner_id = $1
            "#,
        )
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn put_credential(&self, credential: &Credential) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO credentials (owner_id, access_token, refresh_token, access_expires_at,
                                     refreshed_at, broken)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (owner_id) DO UPDATE
            SET access_token = EXCLUDED.access_token,
                refresh_token = EXCLUDED.refresh_token,
                access_expires_at = EXCLUDED.access_expires_at,
                refreshed_at = EXCLUDED.refreshed_at,
                broken = EXCLUDED.broken
            "#,
        )
        .bind(credential.owner_id)
        .bind(&credential.access_token)
        .bind(&credential.refresh_token)
        .bind(credential.access_expires_at)
        .bind(credential.refreshed_at)
        .bind(credential.broken)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_credential(&self, owner_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM credentials WHERE owner_id = $1")
            .bind(owner_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_credential_broken(&self, owner_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE credentials SET broken = TRUE WHERE owner_id = $1")
            .bind(owner_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
