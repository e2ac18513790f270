// Telemetry module for structured logging, metrics, and tracing

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{RandomIdGenerator, Sampler, TracerProvider},
    Resource,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::str::FromStr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const SERVICE_NAME: &str = "fulcrum-scheduler";

/// Output format of the log layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            _ => Err(format!("Invalid log format: {}", s)),
        }
    }
}

/// Initialize structured logging
///
/// Installs a tracing subscriber with:
/// - an `EnvFilter` taken from `RUST_LOG`, falling back to `log_level`
/// - JSON (with span context) or human-readable output
/// - an OpenTelemetry layer exporting spans over OTLP when `tracing_endpoint` is set
#[tracing::instrument(skip_all)]
pub fn init_logging(
    log_level: &str,
    format: LogFormat,
    tracing_endpoint: Option<&str>,
) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let log_layer = match format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .with_thread_names(true)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_target(true)
            .with_filter(env_filter)
            .boxed(),
    };

    let telemetry_layer = match tracing_endpoint {
        Some(endpoint) => Some(tracing_opentelemetry::layer().with_tracer(init_tracer(endpoint)?)),
        None => None,
    };

    tracing_subscriber::registry()
        .with(log_layer)
        .with(telemetry_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;

    tracing::info!(
        log_level = log_level,
        log_format = ?format,
        tracing_endpoint = tracing_endpoint,
        "Structured logging initialized"
    );

    Ok(())
}

/// Initialize OpenTelemetry tracer with OTLP exporter
#[tracing::instrument(skip_all)]
fn init_tracer(endpoint: &str) -> Result<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry_sdk::runtime::Tokio;

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .build_span_exporter()
        .map_err(|e| anyhow::anyhow!("Failed to build span exporter: {}", e))?;

    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(exporter, Tokio)
        .with_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![
                    KeyValue::new("service.name", SERVICE_NAME),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])),
        )
        .build();

    global::set_tracer_provider(tracer_provider.clone());

    let tracer = tracer_provider.tracer(SERVICE_NAME);

    tracing::info!(
        endpoint = endpoint,
        "OpenTelemetry tracer initialized with OTLP exporter"
    );

    Ok(tracer)
}

/// Flush remaining spans on shutdown
pub fn shutdown_tracer() {
    global::shutdown_tracer_provider();
}

/// Initialize Prometheus metrics exporter
///
/// Registers descriptions for:
/// - trigger_fired_total / trigger_misfired_total
/// - job_success_total / job_failed_total / job_vetoed_total
/// - job_duration_seconds
/// - scheduler_waiting_triggers / scheduler_running_jobs
#[tracing::instrument(skip_all)]
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics port: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_counter!("trigger_fired_total", "Total number of trigger fires");
    describe_counter!(
        "trigger_misfired_total",
        "Total number of fire times missed by more than the misfire threshold"
    );
    describe_counter!(
        "job_success_total",
        "Total number of successful job executions"
    );
    describe_counter!("job_failed_total", "Total number of failed job executions");
    describe_counter!(
        "job_vetoed_total",
        "Total number of job executions vetoed by a listener"
    );
    describe_histogram!(
        "job_duration_seconds",
        "Duration of job executions in seconds"
    );
    describe_gauge!(
        "scheduler_waiting_triggers",
        "Number of triggers waiting for their next fire time"
    );
    describe_gauge!(
        "scheduler_running_jobs",
        "Number of job executions currently running"
    );

    tracing::info!(
        metrics_port = metrics_port,
        metrics_endpoint = format!("http://0.0.0.0:{}/metrics", metrics_port),
        "Prometheus metrics exporter initialized"
    );

    Ok(())
}

#[inline]
pub fn record_trigger_fired(trigger: &str, misfired: bool) {
    counter!(
        "trigger_fired_total",
        "trigger" => trigger.to_string(),
        "misfired" => misfired.to_string()
    )
    .increment(1);
}

#[inline]
pub fn record_trigger_misfired(trigger: &str, policy: &str) {
    counter!(
        "trigger_misfired_total",
        "trigger" => trigger.to_string(),
        "policy" => policy.to_string()
    )
    .increment(1);
}

#[inline]
pub fn record_job_success(job: &str) {
    counter!("job_success_total", "job" => job.to_string()).increment(1);
}

#[inline]
pub fn record_job_failure(job: &str, reason: &str) {
    counter!(
        "job_failed_total",
        "job" => job.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

#[inline]
pub fn record_job_vetoed(job: &str) {
    counter!("job_vetoed_total", "job" => job.to_string()).increment(1);
}

#[inline]
pub fn record_job_duration(job: &str, duration_seconds: f64) {
    histogram!("job_duration_seconds", "job" => job.to_string()).record(duration_seconds);
}

#[inline]
pub fn update_waiting_triggers(count: usize) {
    gauge!("scheduler_waiting_triggers").set(count as f64);
}

#[inline]
pub fn update_running_jobs(count: usize) {
    gauge!("scheduler_running_jobs").set(count as f64);
}
