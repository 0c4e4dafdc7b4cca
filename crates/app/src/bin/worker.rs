// Shootout worker process: render slots plus the repair supervisor

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use shootout_common::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!("Starting Shootout worker");

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    let handles = shootout_app::build_core(config).await.map_err(|e| {
        error!("Failed to build core: {}", e);
        e
    })?;
    let (worker, supervisor) = shootout_app::build_worker(&handles)?;

    let shutdown = CancellationToken::new();

    let supervisor_shutdown = shutdown.clone();
    let supervisor_task = tokio::spawn(async move { supervisor.run(supervisor_shutdown).await });

    let worker_shutdown = shutdown.clone();
    let worker_task = tokio::spawn(async move { worker.run(worker_shutdown).await });

    shutdown_signal().await;
    info!("Shutdown requested; draining in-flight jobs");
    shutdown.cancel();

    let _ = worker_task.await;
    let _ = supervisor_task.await;

    info!("Worker shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
