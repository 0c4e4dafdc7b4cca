//! Postgres broker backend
//!
//! One row per queued job in `queue_messages`. Leasing claims the oldest
//! eligible row with `FOR UPDATE SKIP LOCKED` so concurrent workers never
//! block each other, then stamps a lease token and deadline. `lease` polls
//! at a short interval up to `max_wait` since Postgres has no blocking pop.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

use crate::{BrokerError, Lease, QueueBroker};

const LEASE_POLL_INTERVAL: Duration = Duration::from_millis(250);

pub struct PgBroker {
    pool: PgPool,
    lease_ttl: chrono::Duration,
}

impl PgBroker {
    pub fn new(pool: PgPool) -> Self {
        Self::with_lease_ttl(pool, Duration::from_secs(60))
    }

    pub fn with_lease_ttl(pool: PgPool, lease_ttl: Duration) -> Self {
        Self {
            pool,
            lease_ttl: chrono::Duration::from_std(lease_ttl)
                .unwrap_or_else(|_| chrono::Duration::seconds(60)),
        }
    }

    async fn try_lease(&self, worker_id: &str) -> Result<Option<Lease>, BrokerError> {
        let token = Uuid::new_v4();
        let deadline = Utc::now() + self.lease_ttl;

        let row = sqlx::query_as::<_, (Uuid,)>(
            r#"
            UPDATE queue_messages q
            SET lease_token = $1, lease_deadline = $2, leased_by = $3
            WHERE q.job_id = (
                SELECT job_id FROM queue_messages
                WHERE not_before <= NOW()
                  AND (lease_deadline IS NULL OR lease_deadline <= NOW())
                ORDER BY enqueued_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING q.job_id
            "#,
        )
        .bind(token)
        .bind(deadline)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(job_id,)| Lease {
            job_id,
            token,
            deadline,
        }))
    }
}

#[async_trait::async_trait]
impl QueueBroker for PgBroker {
    async fn enqueue(&self, job_id: Uuid, not_before: DateTime<Utc>) -> Result<(), BrokerError> {
        // A job occupies at most one broker slot; re-enqueue of a live row
        // resets its visibility instead of duplicating it
        sqlx::query(
            r#"
            INSERT INTO queue_messages (job_id, enqueued_at, not_before)
            VALUES ($1, NOW(), $2)
            ON CONFLICT (job_id) DO UPDATE
            SET not_before = EXCLUDED.not_before,
                lease_token = NULL,
                lease_deadline = NULL,
                leased_by = NULL
            "#,
        )
        .bind(job_id)
        .bind(not_before)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn lease(
        &self,
        worker_id: &str,
        max_wait: Duration,
    ) -> Result<Option<Lease>, BrokerError> {
        let wait_until = tokio::time::Instant::now() + max_wait;
        loop {
            if let Some(lease) = self.try_lease(worker_id).await? {
                return Ok(Some(lease));
            }
            if tokio::time::Instant::now() + LEASE_POLL_INTERVAL > wait_until {
                return Ok(None);
            }
            tokio::time::sleep(LEASE_POLL_INTERVAL).await;
        }
    }

    async fn extend(&self, lease: &Lease, new_deadline: DateTime<Utc>) -> Result<(), BrokerError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_messages
            SET lease_deadline = $3
            WHERE job_id = $1 AND lease_token = $2 AND lease_deadline > NOW()
            "#,
        )
        .bind(lease.job_id)
        .bind(lease.token)
        .bind(new_deadline)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BrokerError::Expired);
        }
        Ok(())
    }

    async fn ack(&self, lease: &Lease) -> Result<(), BrokerError> {
        let result = sqlx::query("DELETE FROM queue_messages WHERE job_id = $1 AND lease_token = $2")
            .bind(lease.job_id)
            .bind(lease.token)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(BrokerError::Expired);
        }
        Ok(())
    }

    async fn nack(&self, lease: &Lease, delay: Duration) -> Result<(), BrokerError> {
        let not_before = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        let result = sqlx::query(
            r#"
            UPDATE queue_messages
            SET lease_token = NULL, lease_deadline = NULL, leased_by = NULL, not_before = $3
            WHERE job_id = $1 AND lease_token = $2
            "#,
        )
        .bind(lease.job_id)
        .bind(lease.token)
        .bind(not_before)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BrokerError::Expired);
        }
        Ok(())
    }

    async fn reap_expired(&self) -> Result<Vec<Uuid>, BrokerError> {
        let rows = sqlx::query_as::<_, (Uuid,)>(
            r#"
            UPDATE queue_messages
            SET lease_token = NULL, lease_deadline = NULL, leased_by = NULL
            WHERE lease_deadline IS NOT NULL AND lease_deadline <= NOW()
            RETURNING job_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let job_ids: Vec<Uuid> = rows.into_iter().map(|(id,)| id).collect();
        if !job_ids.is_empty() {
            tracing::info!(count = job_ids.len(), "reaped expired leases");
        }
        Ok(job_ids)
    }
}
