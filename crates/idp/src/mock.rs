//! Mock identity provider
//!
//! Programmable mock for testing credential refresh flows:
//! - scripted per-call outcomes (consumed in order, last one repeats)
//! - optional per-call delay so tests can hold a refresh in flight
//! - call counter for asserting single-flight behavior

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::{IdentityProvider, IdpError, TokenResponse};

/// What the next refresh call should produce
#[derive(Debug, Clone)]
pub enum MockRefreshOutcome {
    /// Succeed with a token valid for `expires_in` seconds, optionally rotating
    Grant {
        access_token: String,
        rotated_refresh_token: Option<String>,
        expires_in: u64,
    },
    /// Fail with invalid_grant (permanent)
    InvalidGrant,
    /// Fail with a 5xx (transient)
    ServerError,
}

impl Default for MockRefreshOutcome {
    fn default() -> Self {
        MockRefreshOutcome::Grant {
            access_token: "mock-access-token".to_string(),
            rotated_refresh_token: None,
            expires_in: 3600,
        }
    }
}

#[derive(Default)]
pub struct MockIdentityProvider {
    script: Mutex<Vec<MockRefreshOutcome>>,
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl MockIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue outcomes; consumed front-to-back, final entry repeats
    pub fn script(&self, outcomes: Vec<MockRefreshOutcome>) {
        *self.script.lock().unwrap() = outcomes;
    }

    /// Delay every refresh call, keeping it observable in flight
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Total refresh calls made
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of concurrently outstanding refresh calls observed
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_outcome(&self) -> MockRefreshOutcome {
        let mut script = self.script.lock().unwrap();
        if script.is_empty() {
            return MockRefreshOutcome::default();
        }
        if script.len() == 1 {
            script[0].clone()
        } else {
            script.remove(0)
        }
    }
}

#[async_trait::async_trait]
impl IdentityProvider for MockIdentityProvider {
    async fn refresh(&self, _refresh_token: &str) -> Result<TokenResponse, IdpError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let outcome = self.next_outcome();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match outcome {
            MockRefreshOutcome::Grant {
                access_token,
                rotated_refresh_token,
                expires_in,
            } => Ok(TokenResponse {
                access_token,
                refresh_token: rotated_refresh_token,
                expires_in,
            }),
            MockRefreshOutcome::InvalidGrant => {
                Err(IdpError::InvalidGrant("mock invalid_grant".to_string()))
            }
            MockRefreshOutcome::ServerError => Err(IdpError::Server {
                status: 503,
                body: "mock provider overloaded".to_string(),
            }),
        }
    }
}
