//! Credential service: per-user access tokens for the model registry
//!
//! Tokens live in the durable store; this service fronts them with expiry
//! checks and refresh orchestration. At most one refresh RPC is in flight
//! per owner: concurrent callers serialize on a keyed latch and re-read the
//! store after acquiring it, so all but the first reuse the refreshed row.
//! Latch entries are evicted as soon as their flight drains, so the map
//! stays bounded by concurrent owners rather than every owner ever seen.
//! Refreshes are rate-limited in aggregate to respect the provider.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use shootout_common::Clock;
use shootout_idp::IdentityProvider;

use crate::domain::entities::Credential;
use crate::repository::JobStore;

/// Authentication failure, classified for retry policy
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    /// Provider or store hiccup; retry with backoff
    #[error("Transient auth failure: {0}")]
    Transient(String),

    /// The grant is gone; the user must re-link the provider
    #[error("Permanent auth failure: {0}")]
    Permanent(String),
}

pub struct CredentialService {
    store: Arc<dyn JobStore>,
    idp: Arc<dyn IdentityProvider>,
    clock: Arc<dyn Clock>,
    skew: Duration,
    latches: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
    refresh_log: Mutex<VecDeque<DateTime<Utc>>>,
    refresh_limit_per_minute: usize,
}

impl CredentialService {
    /// Tokens are considered expired this long before their stated expiry
    pub const DEFAULT_SKEW: Duration = Duration::seconds(60);
    /// Aggregate refresh budget against the external provider
    pub const DEFAULT_REFRESH_LIMIT_PER_MINUTE: usize = 100;

    pub fn new(
        store: Arc<dyn JobStore>,
        idp: Arc<dyn IdentityProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            idp,
            clock,
            skew: Self::DEFAULT_SKEW,
            latches: Mutex::new(HashMap::new()),
            refresh_log: Mutex::new(VecDeque::new()),
            refresh_limit_per_minute: Self::DEFAULT_REFRESH_LIMIT_PER_MINUTE,
        }
    }

    pub fn with_limits(mut self, skew: Duration, refresh_limit_per_minute: usize) -> Self {
        self.skew = skew;
        self.refresh_limit_per_minute = refresh_limit_per_minute;
        self
    }

    /// Return a bearer token for the owner, refreshing if needed
    pub async fn bearer_for(&self, owner_id: Uuid) -> Result<String, AuthError> {
        let credential = self.load(owner_id).await?;
        if !credential.is_expired(self.clock.now(), self.skew) {
            return Ok(credential.access_token);
        }

        // Single-flight: one refresh per owner, everyone else awaits it
        let latch = self.latch_for(owner_id);
        let result = {
            let _guard = latch.lock().await;

            // A concurrent caller may have refreshed while we waited
            match self.load(owner_id).await {
                Ok(credential) if credential.is_expired(self.clock.now(), self.skew) => {
                    self.refresh(credential).await
                }
                Ok(credential) => Ok(credential.access_token),
                Err(err) => Err(err),
            }
        };

        self.release_latch(owner_id, &latch);
        result
    }

    async fn load(&self, owner_id: Uuid) -> Result<Credential, AuthError> {
        let credential = self
            .store
            .get_credential(owner_id)
            .await
            .map_err(|e| AuthError::Transient(e.to_string()))?
            .ok_or_else(|| {
                AuthError::Permanent("no credential on file for owner".to_string())
            })?;

        if credential.broken {
            return Err(AuthError::Permanent(
                "credential is broken; user must re-link the provider".to_string(),
            ));
        }
        Ok(credential)
    }

    async fn refresh(&self, credential: Credential) -> Result<String, AuthError> {
        self.check_rate()?;

        match self.idp.refresh(&credential.refresh_token).await {
            Ok(token) => {
                let now = self.clock.now();
                let updated = Credential {
                    owner_id: credential.owner_id,
                    access_token: token.access_token.clone(),
                    // The provider may rotate the refresh token
                    refresh_token: token
                        .refresh_token
                        .unwrap_or(credential.refresh_token),
                    access_expires_at: now + Duration::seconds(token.expires_in as i64),
                    refreshed_at: now,
                    broken: false,
                };
                self.store
                    .put_credential(&updated)
                    .await
                    .map_err(|e| AuthError::Transient(e.to_string()))?;
                tracing::debug!(owner_id = %credential.owner_id, "access token refreshed");
                Ok(token.access_token)
            }
            Err(err) if err.is_transient() => {
                tracing::warn!(owner_id = %credential.owner_id, error = %err, "token refresh failed transiently");
                Err(AuthError::Transient(err.to_string()))
            }
            Err(err) => {
                tracing::warn!(owner_id = %credential.owner_id, error = %err, "token refresh rejected; marking credential broken");
                if let Err(store_err) = self.store.mark_credential_broken(credential.owner_id).await
                {
                    tracing::error!(error = %store_err, "failed to mark credential broken");
                }
                Err(AuthError::Permanent(err.to_string()))
            }
        }
    }

    /// Sliding one-minute window over refresh attempts
    fn check_rate(&self) -> Result<(), AuthError> {
        let now = self.clock.now();
        let mut log = self.refresh_log.lock().unwrap();
        while log
            .front()
            .map_or(false, |at| now.signed_duration_since(*at) > Duration::minutes(1))
        {
            log.pop_front();
        }
        if log.len() >= self.refresh_limit_per_minute {
            return Err(AuthError::Transient(
                "refresh rate limit reached".to_string(),
            ));
        }
        log.push_back(now);
        Ok(())
    }

    fn latch_for(&self, owner_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut latches = self.latches.lock().unwrap();
        latches
            .entry(owner_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drop the latch entry once no other caller holds it, so the map does
    /// not grow with every owner ever seen
    fn release_latch(&self, owner_id: Uuid, latch: &Arc<tokio::sync::Mutex<()>>) {
        let mut latches = self.latches.lock().unwrap();
        // Clones are only handed out under this lock; two references means
        // the map entry plus ours, so nobody is waiting on the latch
        if Arc::strong_count(latch) == 2 {
            latches.remove(&owner_id);
        }
    }
}
