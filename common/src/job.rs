// Executable jobs, their execution context, and capability injection

use crate::errors::{JobError, ServiceError};
use crate::models::{FireEvent, JobDataMap, JobDefinition, JobKey, JobOutcome, TriggerKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Job is the unit of work invoked on every fire of one of its triggers
#[async_trait]
pub trait Job: Send + Sync {
    async fn execute(&self, ctx: &JobExecutionContext) -> Result<(), JobError>;

    /// Jobs that accept injected services return themselves here
    fn as_serviceable(&self) -> Option<&dyn Serviceable> {
        None
    }
}

/// Capability of a job to receive the scheduler's service registry before it runs
pub trait Serviceable: Send + Sync {
    fn inject_services(&self, services: Arc<ServiceRegistry>);
}

/// Role-keyed registry of shared services handed to serviceable jobs
#[derive(Default)]
pub struct ServiceRegistry {
    services: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service under a role, replacing any previous one
    pub fn register<T>(&mut self, role: impl Into<String>, service: Arc<T>)
    where
        T: Any + Send + Sync,
    {
        self.services.insert(role.into(), service);
    }

    pub fn with_service<T>(mut self, role: impl Into<String>, service: Arc<T>) -> Self
    where
        T: Any + Send + Sync,
    {
        self.register(role, service);
        self
    }

    /// Typed lookup of the service registered for `role`
    pub fn lookup<T>(&self, role: &str) -> Result<Arc<T>, ServiceError>
    where
        T: Any + Send + Sync,
    {
        let service = self
            .services
            .get(role)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(role.to_string()))?;

        service
            .downcast::<T>()
            .map_err(|_| ServiceError::WrongType {
                role: role.to_string(),
                expected: std::any::type_name::<T>(),
            })
    }

    pub fn roles(&self) -> Vec<String> {
        let mut roles: Vec<String> = self.services.keys().cloned().collect();
        roles.sort();
        roles
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("roles", &self.roles())
            .finish()
    }
}

/// Everything a job sees about the fire that invoked it
#[derive(Debug, Clone)]
pub struct JobExecutionContext {
    pub fire: FireEvent,
    pub job: JobDefinition,
    /// Job data overlaid with the trigger's data
    pub merged_data: JobDataMap,
    pub scheduler_name: String,
    /// Set once a worker slot has been acquired
    pub started_at: Option<DateTime<Utc>>,
}

impl JobExecutionContext {
    pub fn job_key(&self) -> &JobKey {
        &self.fire.job_key
    }

    pub fn trigger_key(&self) -> &TriggerKey {
        &self.fire.trigger_key
    }

    /// Time spent running as of `now`, excluding any wait for a worker slot
    pub fn run_time(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.started_at.unwrap_or(self.fire.actual_fire_time)
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.merged_data.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|value| value.as_str())
    }
}

/// Result of a single dispatch
#[derive(Debug, Clone)]
pub enum JobResult {
    Success,
    Failure(Arc<JobError>),
}

impl JobResult {
    pub fn is_success(&self) -> bool {
        matches!(self, JobResult::Success)
    }

    pub fn error(&self) -> Option<&JobError> {
        match self {
            JobResult::Success => None,
            JobResult::Failure(error) => Some(error),
        }
    }

    pub fn outcome(&self) -> JobOutcome {
        match self {
            JobResult::Success => JobOutcome::Succeeded,
            JobResult::Failure(error) => JobOutcome::Failed(error.to_string()),
        }
    }
}

/// Job backed by an async closure
pub struct FnJob<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Job for FnJob<F>
where
    F: Fn(JobExecutionContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), JobError>> + Send,
{
    async fn execute(&self, ctx: &JobExecutionContext) -> Result<(), JobError> {
        (self.f)(ctx.clone()).await
    }
}

/// Adapt an async closure into a shareable job
pub fn job_fn<F, Fut>(f: F) -> Arc<dyn Job>
where
    F: Fn(JobExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    Arc::new(FnJob { f })
}
