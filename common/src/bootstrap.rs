// Bootstrap utilities for binary initialization

use crate::config::Settings;
use crate::job::ServiceRegistry;
use crate::listener::{LoggingJobListener, ServiceInjectionListener};
use crate::loader::{load_jobs, JobFactory, LoadSummary};
use crate::schedule::parse_timezone;
use crate::scheduler::SchedulerEngine;
use crate::telemetry;
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

/// Initialize logging, tracing and (when a port is configured) the metrics exporter
pub fn init_observability(settings: &Settings) -> Result<()> {
    let observability = &settings.observability;
    telemetry::init_logging(
        &observability.log_level,
        observability.log_format,
        observability.tracing_endpoint.as_deref(),
    )?;

    if let Some(port) = observability.metrics_port {
        telemetry::init_metrics(port)?;
    }
    Ok(())
}

/// Build an engine from settings with the built-in listeners registered
///
/// # Errors
/// Returns error if the configured job file cannot be loaded or applied
#[tracing::instrument(skip_all)]
pub async fn build_engine(
    settings: &Settings,
    factory: &JobFactory,
    services: Arc<ServiceRegistry>,
) -> Result<SchedulerEngine> {
    let engine = SchedulerEngine::new(settings.scheduler.to_engine_config());
    engine.add_job_listener(Arc::new(LoggingJobListener)).await;
    engine
        .add_job_listener(Arc::new(ServiceInjectionListener::new(services)))
        .await;

    if let Some(path) = &settings.jobs.file {
        let default_tz = parse_timezone(&settings.scheduler.timezone)
            .context("Invalid scheduler timezone")?;
        let LoadSummary { jobs, triggers } = load_jobs(&engine, path, factory, default_tz)
            .await
            .with_context(|| format!("Failed to load job file {}", path.display()))?;
        info!(jobs, triggers, "Declared jobs registered");
    }

    Ok(engine)
}

/// Log every job group with each job's first trigger and its next fire time
pub async fn log_scheduler_configuration(engine: &SchedulerEngine) {
    for group in engine.job_group_names().await {
        info!(group = %group, "Job group");
        for job in engine.list_jobs(Some(&group)).await {
            match engine.get_triggers_for_job(&job).await.first() {
                Some(trigger) => {
                    let next = trigger
                        .next_fire_time
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "never".to_string());
                    info!(
                        job = %job,
                        trigger = %trigger.key,
                        schedule = trigger.schedule.type_name(),
                        next_fire_time = %next,
                        "Job scheduled"
                    );
                }
                None => info!(job = %job, "No trigger defined"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::job_fn;
    use crate::models::{JobDefinition, JobKey, Schedule, TriggerDefinition, TriggerKey};
    use std::io::Write;

    #[tokio::test]
    async fn test_build_engine_without_job_file() {
        let settings = Settings::default();
        let engine = build_engine(&settings, &JobFactory::new(), Arc::new(ServiceRegistry::new()))
            .await
            .unwrap();

        let listeners = engine.job_listener_names().await;
        assert_eq!(listeners, vec!["logging", "service-injection"]);
        assert!(engine.list_jobs(None).await.is_empty());
    }

    #[tokio::test]
    async fn test_build_engine_loads_job_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[[jobs]]
name = "heartbeat"
kind = "noop"

[[triggers]]
name = "every-minute"
job = "heartbeat"
schedule = {{ type = "cron", expression = "0 * * * * ?" }}
"#
        )
        .unwrap();

        let mut settings = Settings::default();
        settings.jobs.file = Some(file.path().to_path_buf());
        let factory = JobFactory::new().with_kind("noop", job_fn(|_| async { Ok(()) }));

        let engine = build_engine(&settings, &factory, Arc::new(ServiceRegistry::new()))
            .await
            .unwrap();
        assert_eq!(engine.list_jobs(None).await, vec![JobKey::with_default_group("heartbeat")]);
        assert_eq!(
            engine.list_triggers(None).await,
            vec![TriggerKey::with_default_group("every-minute")]
        );
    }

    #[tokio::test]
    async fn test_log_scheduler_configuration_handles_unscheduled_jobs() {
        let engine = SchedulerEngine::new(Default::default());
        engine
            .add_job(
                JobDefinition::new(
                    JobKey::new("idle", Some("OPS")),
                    job_fn(|_| async { Ok(()) }),
                )
                .durable(true),
                false,
            )
            .await
            .unwrap();
        engine
            .schedule_job(
                JobDefinition::new(JobKey::with_default_group("once"), job_fn(|_| async { Ok(()) })),
                TriggerDefinition::new(
                    TriggerKey::with_default_group("once"),
                    JobKey::with_default_group("once"),
                    Schedule::OneShot {
                        at: chrono::Utc::now() + chrono::Duration::hours(1),
                    },
                ),
            )
            .await
            .unwrap();

        log_scheduler_configuration(&engine).await;
    }
}
