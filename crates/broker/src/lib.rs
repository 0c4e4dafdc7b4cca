//! Shootout Queue Broker
//!
//! At-least-once delivery of job ids to worker instances:
//! - Lease-based consumption: a leased job is hidden from other consumers
//!   until its deadline, then becomes eligible for redelivery
//! - Postgres backend for production, in-memory backend for tests and
//!   local development
//!
//! Consumers MUST treat delivery as at-least-once; the same job id may
//! arrive twice if a prior lease expired.

pub mod memory;
pub mod postgres;

use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

pub use memory::MemoryBroker;
pub use postgres::PgBroker;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Lease expired or unknown")]
    Expired,
}

impl From<sqlx::Error> for BrokerError {
    fn from(err: sqlx::Error) -> Self {
        BrokerError::Unavailable(err.to_string())
    }
}

/// Time-bounded exclusive right to process one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub job_id: Uuid,
    pub token: Uuid,
    pub deadline: DateTime<Utc>,
}

/// Queue broker contract
///
/// Leases are visible to at most one consumer between grant and deadline.
/// After the deadline passes without `ack` or `extend`, the job is eligible
/// for redelivery. No total order is guaranteed.
#[async_trait::async_trait]
pub trait QueueBroker: Send + Sync {
    /// Admit a job id into the broker, visible from `not_before`
    async fn enqueue(&self, job_id: Uuid, not_before: DateTime<Utc>) -> Result<(), BrokerError>;

    /// Lease a single job, waiting up to `max_wait` for one to appear
    async fn lease(&self, worker_id: &str, max_wait: Duration)
        -> Result<Option<Lease>, BrokerError>;

    /// Push the lease deadline out; fails with `Expired` if the lease lapsed
    async fn extend(&self, lease: &Lease, new_deadline: DateTime<Utc>) -> Result<(), BrokerError>;

    /// Remove the job from the broker
    async fn ack(&self, lease: &Lease) -> Result<(), BrokerError>;

    /// Return the job to the queue, visible again after `delay`
    async fn nack(&self, lease: &Lease, delay: Duration) -> Result<(), BrokerError>;

    /// Release all expired leases back to the ready set, returning their job ids
    async fn reap_expired(&self) -> Result<Vec<Uuid>, BrokerError>;
}
