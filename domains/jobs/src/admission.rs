//! Admission: validated intake of shootout submissions
//!
//! Validation happens before any row exists; the shootout and its job are
//! committed atomically with the job already `queued`, then the job id is
//! handed to the broker. If the broker is down after the commit, the job is
//! parked in `pending` and the supervisor drains it on a later tick.

use std::sync::Arc;
use uuid::Uuid;

use shootout_broker::QueueBroker;
use shootout_common::{Clock, Result};

use crate::domain::entities::{Job, Shootout, ShootoutDraft};
use crate::domain::validation::validate_draft;
use crate::repository::{JobPatch, JobStore};

pub struct Admission {
    store: Arc<dyn JobStore>,
    broker: Arc<dyn QueueBroker>,
    clock: Arc<dyn Clock>,
}

impl Admission {
    pub fn new(
        store: Arc<dyn JobStore>,
        broker: Arc<dyn QueueBroker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            broker,
            clock,
        }
    }

    /// Validate and admit a submission; returns the new job id
    pub async fn submit(&self, owner_id: Uuid, draft: ShootoutDraft) -> Result<Uuid> {
        validate_draft(&draft)?;

        let now = self.clock.now();
        let shootout = Shootout::from_draft(owner_id, draft, now);
        let job = Job::new(shootout.id, owner_id, now);
        let job_id = job.id;

        self.store.create_shootout_and_job(&shootout, &job).await?;

        if let Err(err) = self.broker.enqueue(job_id, now).await {
            // The job row is committed; park it for the supervisor instead
            // of failing the submission
            tracing::warn!(%job_id, error = %err, "broker enqueue failed; degrading job to pending");
            let degrade = self
                .store
                .transition_job(
                    job_id,
                    crate::domain::entities::JobStatus::Queued,
                    crate::domain::entities::JobStatus::Pending,
                    JobPatch {
                        message: Some(Some("broker unavailable".to_string())),
                        ..Default::default()
                    },
                )
                .await;
            if let Err(store_err) = degrade {
                tracing::error!(%job_id, error = %store_err, "failed to degrade job after enqueue failure");
            }
        }

        tracing::info!(%job_id, shootout_id = %shootout.id, %owner_id, "shootout admitted");
        Ok(job_id)
    }
}
