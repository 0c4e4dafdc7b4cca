//! Shootout Model Registry Service
//!
//! Resolves model references to downloadable artifacts and maintains the
//! worker-local model cache:
//! - HTTP client against the external artifact registry for production
//! - Programmable mock for testing and development
//! - Content-addressed on-disk cache with temp-file-then-rename writes

pub mod client;
pub mod mock;

use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Registry configuration error: {0}")]
    Configuration(String),

    /// Transport-level failure; safe to retry
    #[error("Registry request error: {0}")]
    Request(String),

    #[error("Model not found: {0}")]
    NotFound(String),

    #[error("Access to model denied: {0}")]
    Forbidden(String),

    /// Local filesystem failure while materializing the artifact
    #[error("Model cache I/O error: {0}")]
    Io(String),

    #[error("Registry response error: {0}")]
    Response(String),
}

impl FetchError {
    /// Whether a retry could succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Request(_) | FetchError::Io(_))
    }
}

/// Resolves model references to local files, downloading on cache miss
#[async_trait::async_trait]
pub trait ModelFetcher: Send + Sync {
    /// Return a local path for `(owner_id, model_ref)`, fetching with the
    /// caller's bearer credentials when the cache misses
    async fn ensure_local(
        &self,
        owner_id: Uuid,
        model_ref: &str,
        bearer: &str,
    ) -> Result<PathBuf, FetchError>;
}

/// Content-addressed cache location for an owner's model artifact
pub fn cache_path(cache_root: &Path, owner_id: Uuid, model_ref: &str) -> PathBuf {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(owner_id.as_bytes());
    hasher.update(b":");
    hasher.update(model_ref.as_bytes());
    cache_root.join(hex::encode(hasher.finalize()))
}

/// Registry configuration
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Provider (registry, mock)
    pub provider: String,
    /// Base URL of the artifact registry
    pub base_url: String,
    /// Directory for cached model artifacts
    pub cache_root: PathBuf,
}

impl RegistryConfig {
    /// Create registry config from environment variables
    pub fn from_env() -> Result<Self, FetchError> {
        let provider = std::env::var("REGISTRY_PROVIDER").unwrap_or_else(|_| "registry".to_string());
        let base_url = std::env::var("REGISTRY_URL").unwrap_or_default();
        let artifacts_root = std::env::var("ARTIFACTS_ROOT").unwrap_or_default();

        if provider != "mock" && (base_url.is_empty() || artifacts_root.is_empty()) {
            return Err(FetchError::Configuration(
                "REGISTRY_URL and ARTIFACTS_ROOT are required for the registry provider"
                    .to_string(),
            ));
        }

        Ok(Self {
            provider,
            base_url,
            cache_root: PathBuf::from(artifacts_root).join("models"),
        })
    }
}

/// Factory for creating ModelFetcher implementations
pub struct ModelFetcherFactory;

impl ModelFetcherFactory {
    pub fn create(config: RegistryConfig) -> Result<Box<dyn ModelFetcher>, FetchError> {
        match config.provider.as_str() {
            "registry" => {
                tracing::info!("Creating HTTP model fetcher");
                Ok(Box::new(client::HttpModelFetcher::new(config)))
            }
            "mock" => {
                tracing::info!("Creating mock model fetcher");
                Ok(Box::new(mock::MockModelFetcher::new(config.cache_root)))
            }
            provider => Err(FetchError::Configuration(format!(
                "Unknown registry provider: {}. Supported providers: registry, mock",
                provider
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_path_is_stable() {
        let owner = Uuid::new_v4();
        let root = PathBuf::from("/cache");
        let a = cache_path(&root, owner, "neural-amp/plexi-v2");
        let b = cache_path(&root, owner, "neural-amp/plexi-v2");
        assert_eq!(a, b);
        assert!(a.starts_with("/cache"));
    }

    #[test]
    fn test_cache_path_separates_owners_and_refs() {
        let root = PathBuf::from("/cache");
        let owner_a = Uuid::new_v4();
        let owner_b = Uuid::new_v4();

        assert_ne!(
            cache_path(&root, owner_a, "m1"),
            cache_path(&root, owner_b, "m1")
        );
        assert_ne!(
            cache_path(&root, owner_a, "m1"),
            cache_path(&root, owner_a, "m2")
        );
    }

    #[test]
    fn test_factory_unknown_provider() {
        let config = RegistryConfig {
            provider: "invalid".to_string(),
            base_url: String::new(),
            cache_root: PathBuf::from("/tmp"),
        };
        let err = match ModelFetcherFactory::create(config) {
            Err(e) => e,
            Ok(_) => panic!("Expected error"),
        };
        assert!(err.to_string().contains("Unknown registry provider"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(FetchError::Request("timeout".to_string()).is_transient());
        assert!(FetchError::Io("disk full".to_string()).is_transient());
        assert!(!FetchError::NotFound("m1".to_string()).is_transient());
        assert!(!FetchError::Forbidden("m1".to_string()).is_transient());
    }
}
