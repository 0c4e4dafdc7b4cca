//! Shootout application composition root
//!
//! Wires configuration into concrete collaborators (Postgres or in-memory
//! backends, HTTP or mock external services) and hands the assembled core
//! to the binaries. Collaborators are constructed here and passed down;
//! nothing holds process-global state.

use axum::Router;
use sqlx::PgPool;
use std::sync::Arc;

use shootout_broker::{MemoryBroker, PgBroker, QueueBroker};
use shootout_common::{Clock, Config, SystemClock};
use shootout_idp::{IdpConfig, IdpFactory};
use shootout_jobs::{
    CoreService, CredentialService, JobStore, JobsState, MemoryStore, PgStore, ProgressHub,
    Supervisor, SupervisorConfig, Worker, WorkerConfig,
};
use shootout_registry::{ModelFetcherFactory, RegistryConfig};
use shootout_render::{RenderConfig, RenderEngineFactory};

/// Assembled core handles shared by the API and worker binaries
pub struct AppHandles {
    pub config: Config,
    pub clock: Arc<dyn Clock>,
    pub store: Arc<dyn JobStore>,
    pub broker: Arc<dyn QueueBroker>,
    pub hub: Arc<ProgressHub>,
    pub core: Arc<CoreService>,
}

/// Build store, broker, hub, and core service from configuration
///
/// `STORE_PROVIDER=memory` selects the in-memory backends for local
/// development without Postgres; production uses `STORE_URL`/`BROKER_URL`.
pub async fn build_core(config: Config) -> anyhow::Result<AppHandles> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let provider = std::env::var("STORE_PROVIDER").unwrap_or_else(|_| "postgres".to_string());
    let (store, broker): (Arc<dyn JobStore>, Arc<dyn QueueBroker>) = match provider.as_str() {
        "memory" => {
            tracing::info!("Using in-memory store and broker");
            (
                Arc::new(MemoryStore::new()),
                Arc::new(MemoryBroker::new(clock.clone())),
            )
        }
        _ => {
            let store_pool = PgPool::connect(&config.store_url).await?;
            sqlx::migrate!("../../migrations").run(&store_pool).await?;

            let broker_pool = if config.broker_url == config.store_url {
                store_pool.clone()
            } else {
                let pool = PgPool::connect(&config.broker_url).await?;
                sqlx::migrate!("../../migrations").run(&pool).await?;
                pool
            };

            tracing::info!("Connected to Postgres store and broker");
            (
                Arc::new(PgStore::new(store_pool)),
                Arc::new(PgBroker::new(broker_pool)),
            )
        }
    };

    let hub = Arc::new(ProgressHub::new(clock.clone()));
    let core = Arc::new(CoreService::new(
        store.clone(),
        broker.clone(),
        hub.clone(),
        clock.clone(),
    ));

    Ok(AppHandles {
        config,
        clock,
        store,
        broker,
        hub,
        core,
    })
}

/// Create the HTTP front-door router
pub fn create_app(handles: &AppHandles) -> Router {
    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(shootout_jobs::routes().with_state(JobsState {
            core: handles.core.clone(),
        }))
}

/// Build the worker and supervisor pair from the same handles
pub fn build_worker(handles: &AppHandles) -> anyhow::Result<(Arc<Worker>, Supervisor)> {
    let idp = IdpFactory::create(IdpConfig::from_env()?)
        .map_err(|e| anyhow::anyhow!("identity provider setup failed: {}", e))?;
    let fetcher = ModelFetcherFactory::create(RegistryConfig::from_env()?)
        .map_err(|e| anyhow::anyhow!("model fetcher setup failed: {}", e))?;
    let engine = RenderEngineFactory::create(RenderConfig::from_env())
        .map_err(|e| anyhow::anyhow!("render engine setup failed: {}", e))?;

    let credentials = Arc::new(CredentialService::new(
        handles.store.clone(),
        Arc::from(idp),
        handles.clock.clone(),
    ));

    let mut worker_config = WorkerConfig::new(
        handles.config.worker_id.clone(),
        handles.config.artifacts_root.clone(),
    );
    worker_config.slots = handles.config.worker_slots;
    worker_config.max_attempts = handles.config.max_attempts;
    worker_config.wall_clock = handles.config.job_wall_clock;
    worker_config.progress_silence = handles.config.progress_silence;

    let worker = Arc::new(Worker::new(
        handles.store.clone(),
        handles.broker.clone(),
        handles.hub.clone(),
        credentials,
        Arc::from(fetcher),
        Arc::from(engine),
        handles.clock.clone(),
        worker_config,
    ));

    let supervisor_config = SupervisorConfig {
        wall_clock: handles.config.job_wall_clock,
        retention: chrono_days(handles.config.retention_days),
        ..Default::default()
    };
    let supervisor = Supervisor::new(
        handles.store.clone(),
        handles.broker.clone(),
        handles.hub.clone(),
        handles.clock.clone(),
        supervisor_config,
    );

    Ok((worker, supervisor))
}

fn chrono_days(days: i64) -> chrono::Duration {
    chrono::Duration::days(days)
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}
