// Configuration management with layered configuration (file, env)

use crate::models::MisfirePolicy;
use crate::schedule::parse_timezone;
use crate::scheduler::SchedulerConfig;
use crate::telemetry::LogFormat;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub scheduler: SchedulerSettings,
    pub observability: ObservabilityConfig,
    pub jobs: JobsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub instance_name: String,
    pub worker_threads: usize,
    pub misfire_threshold_ms: u64,
    pub misfire_policy: MisfirePolicy,
    pub history_capacity: usize,
    pub job_timeout_seconds: Option<u64>,
    pub shutdown_timeout_seconds: Option<u64>,
    pub wait_for_jobs_on_shutdown: bool,
    /// Time zone for cron triggers that do not name one
    pub timezone: String,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            instance_name: "fulcrum".to_string(),
            worker_threads: 10,
            misfire_threshold_ms: 60_000,
            misfire_policy: MisfirePolicy::FireOnceNow,
            history_capacity: 100,
            job_timeout_seconds: None,
            shutdown_timeout_seconds: None,
            wait_for_jobs_on_shutdown: true,
            timezone: "UTC".to_string(),
        }
    }
}

impl SchedulerSettings {
    pub fn to_engine_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            instance_name: self.instance_name.clone(),
            worker_threads: self.worker_threads,
            misfire_threshold: Duration::from_millis(self.misfire_threshold_ms),
            default_misfire_policy: self.misfire_policy,
            history_capacity: self.history_capacity,
            job_timeout: self.job_timeout_seconds.map(Duration::from_secs),
            shutdown_timeout: self.shutdown_timeout_seconds.map(Duration::from_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_format: LogFormat,
    /// Prometheus exporter port; no exporter when unset
    pub metrics_port: Option<u16>,
    pub tracing_endpoint: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
            metrics_port: None,
            tracing_endpoint: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Declarative job file loaded at startup
    pub file: Option<PathBuf>,
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local configuration (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.scheduler.instance_name.trim().is_empty() {
            return Err("Scheduler instance_name cannot be empty".to_string());
        }
        if self.scheduler.worker_threads == 0 {
            return Err("Scheduler worker_threads must be greater than 0".to_string());
        }
        if self.scheduler.history_capacity == 0 {
            return Err("Scheduler history_capacity must be greater than 0".to_string());
        }
        if let Err(e) = parse_timezone(&self.scheduler.timezone) {
            return Err(format!("Scheduler timezone: {}", e));
        }

        if self.observability.log_level.trim().is_empty() {
            return Err("Observability log_level cannot be empty".to_string());
        }
        if self.observability.metrics_port == Some(0) {
            return Err("Metrics port must be greater than 0".to_string());
        }

        Ok(())
    }
}
