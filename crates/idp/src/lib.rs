//! Shootout Identity Provider Service
//!
//! Exchanges refresh tokens for fresh access tokens with the external
//! OAuth2-style provider:
//! - HTTP client for production
//! - Programmable mock for testing and development
//! - Provider selection and credentials from environment configuration

pub mod client;
pub mod mock;

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum IdpError {
    #[error("Identity provider configuration error: {0}")]
    Configuration(String),

    /// Transport-level failure; safe to retry
    #[error("Identity provider request error: {0}")]
    Request(String),

    /// Provider-side failure (5xx); safe to retry
    #[error("Identity provider returned {status}: {body}")]
    Server { status: u16, body: String },

    /// The grant was rejected; retrying cannot help
    #[error("Refresh grant rejected: {0}")]
    InvalidGrant(String),

    #[error("Identity provider response error: {0}")]
    Response(String),
}

impl IdpError {
    /// Whether a retry with the same grant could succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, IdpError::Request(_) | IdpError::Server { .. })
    }
}

/// Successful token exchange
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    /// Present when the provider rotates the refresh token
    pub refresh_token: Option<String>,
    pub expires_in: u64,
}

/// Identity provider configuration
#[derive(Clone)]
pub struct IdpConfig {
    /// Provider (idp, mock)
    pub provider: String,
    /// Token endpoint URL
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
}

impl std::fmt::Debug for IdpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdpConfig")
            .field("provider", &self.provider)
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .finish()
    }
}

impl IdpConfig {
    /// Create identity provider config from environment variables
    pub fn from_env() -> Result<Self, IdpError> {
        let provider = std::env::var("IDP_PROVIDER").unwrap_or_else(|_| "idp".to_string());
        let token_url = std::env::var("IDP_URL").unwrap_or_default();
        let client_id = std::env::var("IDP_CLIENT_ID").unwrap_or_default();
        let client_secret = std::env::var("IDP_CLIENT_SECRET").unwrap_or_default();

        if provider != "mock" && (token_url.is_empty() || client_id.is_empty()) {
            return Err(IdpError::Configuration(
                "IDP_URL and IDP_CLIENT_ID are required for the idp provider".to_string(),
            ));
        }

        Ok(Self {
            provider,
            token_url,
            client_id,
            client_secret,
        })
    }
}

/// Identity provider trait for different implementations
#[async_trait::async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Exchange a refresh token for a fresh access token
    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, IdpError>;
}

/// Factory for creating IdentityProvider implementations
pub struct IdpFactory;

impl IdpFactory {
    pub fn create(config: IdpConfig) -> Result<Box<dyn IdentityProvider>, IdpError> {
        match config.provider.as_str() {
            "idp" => {
                tracing::info!("Creating HTTP identity provider client");
                Ok(Box::new(client::HttpIdentityProvider::new(config)))
            }
            "mock" => {
                tracing::info!("Creating mock identity provider");
                Ok(Box::new(mock::MockIdentityProvider::new()))
            }
            provider => Err(IdpError::Configuration(format!(
                "Unknown identity provider: {}. Supported providers: idp, mock",
                provider
            ))),
        }
    }
}
