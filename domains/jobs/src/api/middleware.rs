//! Jobs domain state and caller identity extraction
//!
//! Authentication itself lives in the front door; by the time a request
//! reaches the core it carries the verified caller id in a trusted header.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use std::sync::Arc;
use uuid::Uuid;

use shootout_common::Error;

use crate::service::CoreService;

/// Header set by the authenticating front door
pub const CALLER_HEADER: &str = "x-shootout-user";

/// Application state for the Jobs domain
#[derive(Clone)]
pub struct JobsState {
    pub core: Arc<CoreService>,
}

/// Verified caller identity
#[derive(Debug, Clone, Copy)]
pub struct CallerId(pub Uuid);

impl<S> FromRequestParts<S> for CallerId
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(CALLER_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| Error::Authentication("missing caller identity".to_string()))?;

        let owner_id = value
            .parse::<Uuid>()
            .map_err(|_| Error::Authentication("invalid caller identity".to_string()))?;

        Ok(CallerId(owner_id))
    }
}
