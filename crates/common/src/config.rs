//! Configuration management following 12-factor app principles
//!
//! All configuration is loaded from environment variables to ensure
//! clean separation between code and config.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Durable store connection URL (Postgres)
    pub store_url: String,

    /// Queue broker connection URL (Postgres)
    pub broker_url: String,

    /// Identity provider token endpoint and client credentials
    pub idp_url: String,
    pub idp_client_id: String,
    pub idp_client_secret: String,

    /// Root directory for downloaded models and rendered outputs
    pub artifacts_root: PathBuf,

    /// Retry and timeout policy
    pub max_attempts: i16,
    pub job_wall_clock: Duration,
    pub progress_silence: Duration,
    pub retention_days: i64,

    /// Worker identity and concurrency
    pub worker_id: String,
    pub worker_slots: usize,

    /// Runtime configuration
    pub port: u16,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if it exists

        let config = Self {
            store_url: env::var("STORE_URL")
                .map_err(|_| anyhow::anyhow!("STORE_URL is required"))?,
            broker_url: env::var("BROKER_URL")
                .map_err(|_| anyhow::anyhow!("BROKER_URL is required"))?,

            idp_url: env::var("IDP_URL").map_err(|_| anyhow::anyhow!("IDP_URL is required"))?,
            idp_client_id: env::var("IDP_CLIENT_ID")
                .map_err(|_| anyhow::anyhow!("IDP_CLIENT_ID is required"))?,
            idp_client_secret: env::var("IDP_CLIENT_SECRET")
                .map_err(|_| anyhow::anyhow!("IDP_CLIENT_SECRET is required"))?,

            artifacts_root: env::var("ARTIFACTS_ROOT")
                .map(PathBuf::from)
                .map_err(|_| anyhow::anyhow!("ARTIFACTS_ROOT is required"))?,

            max_attempts: parse_or("MAX_ATTEMPTS", 3),
            job_wall_clock: Duration::from_secs(parse_or("JOB_WALL_CLOCK", 1800)),
            progress_silence: Duration::from_secs(parse_or("PROGRESS_SILENCE", 300)),
            retention_days: parse_or("RETENTION_DAYS", 14),

            worker_id: env::var("WORKER_ID")
                .unwrap_or_else(|_| format!("worker-{}", uuid::Uuid::new_v4())),
            worker_slots: parse_or(
                "WORKER_SLOTS",
                std::thread::available_parallelism()
                    .map(|n| n.get().saturating_sub(1).max(1))
                    .unwrap_or(1),
            ),

            port: parse_or("PORT", 3000),
        };

        Ok(config)
    }
}

fn parse_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl std::fmt::Display for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Secrets stay out of logs
        write!(
            f,
            "Config {{ store_url: [REDACTED], broker_url: [REDACTED], idp_url: {}, artifacts_root: {}, max_attempts: {}, worker_slots: {} }}",
            self.idp_url,
            self.artifacts_root.display(),
            self.max_attempts,
            self.worker_slots
        )
    }
}
