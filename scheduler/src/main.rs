// Scheduler binary entry point

mod jobs;

use anyhow::{Context, Result};
use common::bootstrap;
use common::config::Settings;
use common::job::ServiceRegistry;
use common::scheduler::Scheduler;
use common::telemetry;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load().context("Failed to load configuration")?;
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    bootstrap::init_observability(&settings)?;
    info!(
        instance = %settings.scheduler.instance_name,
        worker_threads = settings.scheduler.worker_threads,
        jobs_file = ?settings.jobs.file,
        "Starting Fulcrum scheduler"
    );

    let services = ServiceRegistry::new().with_service(
        jobs::INSTANCE_NAME_ROLE,
        Arc::new(settings.scheduler.instance_name.clone()),
    );
    let engine =
        bootstrap::build_engine(&settings, &jobs::job_factory(), Arc::new(services)).await?;

    engine.start().await?;
    bootstrap::log_scheduler_configuration(&engine).await;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C signal, initiating graceful shutdown");

    if let Err(e) = engine
        .shutdown(settings.scheduler.wait_for_jobs_on_shutdown)
        .await
    {
        error!(error = %e, "Error during scheduler shutdown");
    }
    telemetry::shutdown_tracer();

    info!("Scheduler stopped");
    Ok(())
}
