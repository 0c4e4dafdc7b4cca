//! Shootout Render Engine Seam
//!
//! The actual audio/video pipeline is an external native component. This
//! crate defines the calling contract the workers use plus a programmable
//! mock for testing:
//! - `render` is synchronous and CPU-bound; callers MUST run it off the
//!   I/O scheduler (`tokio::task::spawn_blocking`)
//! - progress is reported through a plain callback; cancellation through a
//!   shared token the engine is expected to observe promptly

pub mod mock;

use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    /// I/O, decode, engine restart; the attempt may be retried
    #[error("Transient render failure: {0}")]
    Transient(String),

    /// The spec itself cannot render; retrying cannot help
    #[error("Invalid render spec: {0}")]
    Invalid(String),

    /// The cancel token was observed
    #[error("Render cancelled")]
    Cancelled,
}

/// Fully resolved input for one render attempt
///
/// `spec` is the shootout snapshot with model references already replaced
/// by local artifact paths; the engine never touches the network.
#[derive(Debug, Clone)]
pub struct RenderSpec {
    pub job_id: Uuid,
    pub spec: serde_json::Value,
    pub output_path: PathBuf,
}

/// Blocking render engine contract
pub trait RenderEngine: Send + Sync {
    /// Render to `spec.output_path`, reporting progress in [0, 100]
    ///
    /// Returns the artifact path on success. Implementations observe
    /// `cancel` between units of work and return `RenderError::Cancelled`.
    fn render(
        &self,
        spec: &RenderSpec,
        progress: &mut dyn FnMut(i16, &str),
        cancel: &CancellationToken,
    ) -> Result<PathBuf, RenderError>;
}

/// Render engine configuration
#[derive(Debug, Clone)]
pub struct RenderConfig {
    /// Provider (mock; the native engine registers its own provider)
    pub provider: String,
}

impl RenderConfig {
    pub fn from_env() -> Self {
        Self {
            provider: std::env::var("RENDER_PROVIDER").unwrap_or_else(|_| "mock".to_string()),
        }
    }
}

/// Factory for creating RenderEngine implementations
pub struct RenderEngineFactory;

impl RenderEngineFactory {
    pub fn create(config: RenderConfig) -> Result<Box<dyn RenderEngine>, RenderError> {
        match config.provider.as_str() {
            "mock" => {
                tracing::info!("Creating mock render engine");
                Ok(Box::new(mock::MockRenderEngine::new()))
            }
            provider => Err(RenderError::Invalid(format!(
                "Unknown render provider: {}. Supported providers: mock",
                provider
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_mock_succeeds() {
        let config = RenderConfig {
            provider: "mock".to_string(),
        };
        assert!(RenderEngineFactory::create(config).is_ok());
    }

    #[test]
    fn test_factory_unknown_provider() {
        let config = RenderConfig {
            provider: "gpu-farm".to_string(),
        };
        let err = match RenderEngineFactory::create(config) {
            Err(e) => e,
            Ok(_) => panic!("Expected error"),
        };
        assert!(err.to_string().contains("Unknown render provider"));
    }

    #[test]
    fn test_render_error_display() {
        assert_eq!(
            RenderError::Transient("decode failed".to_string()).to_string(),
            "Transient render failure: decode failed"
        );
        assert_eq!(
            RenderError::Invalid("no such stage".to_string()).to_string(),
            "Invalid render spec: no such stage"
        );
        assert_eq!(RenderError::Cancelled.to_string(), "Render cancelled");
    }
}
