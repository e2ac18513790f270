// Error handling framework for the scheduler core

use crate::models::{JobKey, TriggerKey};
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

/// Schedule-related errors, raised while building or validating a schedule
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("Invalid schedule configuration: {0}")]
    InvalidConfiguration(String),
}

/// Errors returned by the scheduler registration, lifecycle and query API
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ScheduleError),

    #[error("Trigger {trigger} references unknown job {job}")]
    UnknownJob { trigger: TriggerKey, job: JobKey },

    #[error("Based on configured schedule, trigger {0} will never fire")]
    TriggerWillNeverFire(TriggerKey),

    #[error("Job {0} already exists")]
    DuplicateJob(JobKey),

    #[error("Trigger {0} already exists")]
    DuplicateTrigger(TriggerKey),

    #[error("Job {job} is still referenced by {triggers} trigger(s)")]
    JobInUse { job: JobKey, triggers: usize },

    #[error("Job not found: {0}")]
    JobNotFound(JobKey),

    #[error("Trigger not found: {0}")]
    TriggerNotFound(TriggerKey),

    #[error("Scheduler has been shut down")]
    Shutdown,

    #[error("Scheduler halted: {0}")]
    Fatal(String),
}

impl SchedulerError {
    /// Errors caused by a malformed definition rather than scheduler state.
    /// These are always raised synchronously at registration time.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            SchedulerError::Configuration(_)
                | SchedulerError::UnknownJob { .. }
                | SchedulerError::TriggerWillNeverFire(_)
        )
    }
}

/// A fire time that was missed by more than the trigger's misfire threshold
#[derive(Error, Debug, Clone)]
#[error("Trigger {trigger} misfired: scheduled for {scheduled_fire_time}, {late_by:?} late (threshold {threshold:?})")]
pub struct MisfireError {
    pub trigger: TriggerKey,
    pub scheduled_fire_time: DateTime<Utc>,
    pub late_by: Duration,
    pub threshold: Duration,
}

/// Job execution failures, captured per dispatch
#[derive(Error, Debug)]
pub enum JobError {
    #[error("Job execution failed: {0}")]
    Failed(String),

    #[error("Job execution timed out after {0:?}")]
    Timeout(Duration),

    #[error("Job panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl JobError {
    pub fn failed(reason: impl Into<String>) -> Self {
        JobError::Failed(reason.into())
    }
}

/// Time source failures. Fatal to the scheduler loop.
#[derive(Error, Debug, Clone)]
#[error("Time source failure: {0}")]
pub struct ClockError(pub String);

/// Service lookup errors raised by the service registry
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("No service registered for role '{0}'")]
    NotFound(String),

    #[error("Service registered for role '{role}' is not a {expected}")]
    WrongType { role: String, expected: &'static str },
}

/// Errors raised while loading declarative job definitions
#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("Failed to read job file: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Job {job} uses unknown job kind '{kind}'")]
    UnknownJobKind { job: JobKey, kind: String },

    #[error("Invalid schedule for trigger {trigger}: {source}")]
    InvalidSchedule {
        trigger: TriggerKey,
        #[source]
        source: ScheduleError,
    },

    #[error("Scheduler rejected definition: {0}")]
    Scheduler(#[from] SchedulerError),
}
