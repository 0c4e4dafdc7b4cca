//! HTTP identity provider client
//!
//! POSTs a `grant_type=refresh_token` form to the provider token endpoint
//! and classifies the outcome: `invalid_grant` bodies are permanent, 5xx
//! and transport errors are transient.

use serde::Deserialize;

use crate::{IdentityProvider, IdpConfig, IdpError, TokenResponse};

/// Error body shape used by OAuth2-style token endpoints
#[derive(Debug, Deserialize)]
struct TokenErrorBody {
    error: Option<String>,
    error_description: Option<String>,
}

pub struct HttpIdentityProvider {
    http: reqwest::Client,
    config: IdpConfig,
}

impl HttpIdentityProvider {
    pub fn new(config: IdpConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait::async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, IdpError> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
        ];

        let response = self
            .http
            .post(&self.config.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| IdpError::Request(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            let token: TokenResponse = response
                .json()
                .await
                .map_err(|e| IdpError::Response(e.to_string()))?;
            tracing::debug!("identity provider refresh succeeded");
            return Ok(token);
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Failed to read response body".to_string());

        if status.is_client_error() {
            let parsed: Option<TokenErrorBody> = serde_json::from_str(&body).ok();
            let code = parsed
                .as_ref()
                .and_then(|b| b.error.as_deref())
                .unwrap_or("")
                .to_string();
            if code == "invalid_grant" || status.as_u16() == 401 {
                let detail = parsed
                    .and_then(|b| b.error_description)
                    .unwrap_or_else(|| code.clone());
                return Err(IdpError::InvalidGrant(detail));
            }
            return Err(IdpError::Response(format!(
                "token endpoint returned {}: {}",
                status, body
            )));
        }

        Err(IdpError::Server {
            status: status.as_u16(),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_body_parses_invalid_grant() {
        let body: TokenErrorBody = serde_json::from_str(
            r#"{"error": "invalid_grant", "error_description": "refresh token revoked"}"#,
        )
        .unwrap();
        assert_eq!(body.error.as_deref(), Some("invalid_grant"));
        assert_eq!(
            body.error_description.as_deref(),
            Some("refresh token revoked")
        );
    }

    #[test]
    fn test_error_body_tolerates_missing_fields() {
        let body: TokenErrorBody = serde_json::from_str("{}").unwrap();
        assert!(body.error.is_none());
        assert!(body.error_description.is_none());
    }
}
