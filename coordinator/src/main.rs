// Coordinator binary entry point
//
// Runs the queue adapter, job tracker, webhook and subscription fan-out and
// the scheduler in one process until SIGINT/SIGTERM.

use anyhow::Context;
use common::bootstrap::{build_coordinator, init_queue_engine, init_repositories};
use common::config::Settings;
use common::telemetry;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().context("Failed to load configuration")?;
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    telemetry::init_logging(
        &settings.observability.log_level,
        settings.observability.tracing_endpoint.as_deref(),
    )?;

    info!(
        storage_backend = ?settings.storage.backend,
        scheduler_queue = %settings.scheduler.queue_name,
        tenants = settings.tenancy.tenants.len(),
        "Starting job-queue coordinator"
    );

    if let Err(e) = telemetry::init_metrics(settings.observability.metrics_port) {
        error!(error = %e, "Failed to start metrics exporter, continuing without it");
    }

    // A storage backend that cannot be reached at startup is fatal
    let repositories = init_repositories(&settings).await?;
    let engine = init_queue_engine(&settings);
    let coordinator = build_coordinator(&settings, engine, repositories)?;

    let restored = coordinator.start().await?;
    info!(restored_schedules = restored, "Coordinator running");

    shutdown_signal().await;
    info!("Shutdown signal received, stopping coordinator");

    if let Err(e) = coordinator.shutdown().await {
        error!(error = %e, "Error during coordinator shutdown");
    }
    telemetry::shutdown_tracer();

    info!("Coordinator stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
