//! In-memory broker backend for tests and local development
//!
//! Single mutex-guarded state: a ready queue, a delayed set, and the leased
//! map keyed by lease token. A `Notify` wakes blocked `lease` calls when
//! work arrives.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

use shootout_common::Clock;

use crate::{BrokerError, Lease, QueueBroker};

struct LeasedEntry {
    job_id: Uuid,
    deadline: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    ready: VecDeque<Uuid>,
    delayed: Vec<(DateTime<Utc>, Uuid)>,
    leased: HashMap<Uuid, LeasedEntry>,
}

pub struct MemoryBroker {
    inner: Mutex<Inner>,
    notify: Notify,
    clock: Arc<dyn Clock>,
    lease_ttl: Duration,
}

impl MemoryBroker {
    /// Default lease deadline horizon, matching the worker heartbeat contract
    pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(60);

    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_lease_ttl(clock, Self::DEFAULT_LEASE_TTL)
    }

    pub fn with_lease_ttl(clock: Arc<dyn Clock>, lease_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            clock,
            lease_ttl,
        }
    }

    /// Number of jobs currently ready or delayed (test helper)
    pub fn depth(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.ready.len() + inner.delayed.len()
    }

    /// Move delayed entries whose time has come into the ready queue
    fn promote_due(inner: &mut Inner, now: DateTime<Utc>) {
        let mut index = 0;
        while index < inner.delayed.len() {
            if inner.delayed[index].0 <= now {
                let (_, job_id) = inner.delayed.swap_remove(index);
                inner.ready.push_back(job_id);
            } else {
                index += 1;
            }
        }
    }

    fn try_lease(&self) -> Option<Lease> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap();
        Self::promote_due(&mut inner, now);

        let job_id = inner.ready.pop_front()?;
        let token = Uuid::new_v4();
        let deadline = now
            + chrono::Duration::from_std(self.lease_ttl)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        inner.leased.insert(token, LeasedEntry { job_id, deadline });
        Some(Lease {
            job_id,
            token,
            deadline,
        })
    }
}

#[async_trait::async_trait]
impl QueueBroker for MemoryBroker {
    async fn enqueue(&self, job_id: Uuid, not_before: DateTime<Utc>) -> Result<(), BrokerError> {
        {
            let now = self.clock.now();
            let mut inner = self.inner.lock().unwrap();
            if not_before <= now {
                inner.ready.push_back(job_id);
            } else {
                inner.delayed.push((not_before, job_id));
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn lease(
        &self,
        _worker_id: &str,
        max_wait: Duration,
    ) -> Result<Option<Lease>, BrokerError> {
        let wait_until = tokio::time::Instant::now() + max_wait;
        loop {
            if let Some(lease) = self.try_lease() {
                return Ok(Some(lease));
            }

            let notified = self.notify.notified();
            if tokio::time::timeout_at(wait_until, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn extend(&self, lease: &Lease, new_deadline: DateTime<Utc>) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.leased.get_mut(&lease.token) {
            Some(entry) => {
                entry.deadline = new_deadline;
                Ok(())
            }
            None => Err(BrokerError::Expired),
        }
    }

    async fn ack(&self, lease: &Lease) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.leased.remove(&lease.token) {
            Some(_) => Ok(()),
            None => Err(BrokerError::Expired),
        }
    }

    async fn nack(&self, lease: &Lease, delay: Duration) -> Result<(), BrokerError> {
        let job_id = {
            let mut inner = self.inner.lock().unwrap();
            let entry = inner
                .leased
                .remove(&lease.token)
                .ok_or(BrokerError::Expired)?;

            let now = self.clock.now();
            let not_before = now
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            if not_before <= now {
                inner.ready.push_back(entry.job_id);
            } else {
                inner.delayed.push((not_before, entry.job_id));
            }
            entry.job_id
        };
        self.notify.notify_waiters();
        tracing::debug!(%job_id, "nacked job back to queue");
        Ok(())
    }

    async fn reap_expired(&self) -> Result<Vec<Uuid>, BrokerError> {
        let now = self.clock.now();
        let reaped = {
            let mut inner = self.inner.lock().unwrap();
            let expired: Vec<Uuid> = inner
                .leased
                .iter()
                .filter(|(_, entry)| entry.deadline <= now)
                .map(|(token, _)| *token)
                .collect();

            let mut job_ids = Vec::with_capacity(expired.len());
            for token in expired {
                if let Some(entry) = inner.leased.remove(&token) {
                    inner.ready.push_back(entry.job_id);
                    job_ids.push(entry.job_id);
                }
            }
            job_ids
        };
        if !reaped.is_empty() {
            self.notify.notify_waiters();
            tracing::info!(count = reaped.len(), "reaped expired leases");
        }
        Ok(reaped)
    }
}
