// Built-in job kinds available to job files

use async_trait::async_trait;
use common::errors::JobError;
use common::job::{Job, JobExecutionContext, ServiceRegistry, Serviceable};
use common::loader::JobFactory;
use std::sync::{Arc, RwLock};
use tracing::info;

/// Service role under which the binary registers its instance name
pub const INSTANCE_NAME_ROLE: &str = "instance_name";

/// Registry of the job kinds shipped with the binary
pub fn job_factory() -> JobFactory {
    JobFactory::new()
        .with_kind("log", Arc::new(LogJob::default()))
        .with_kind("noop", Arc::new(NoopJob))
}

/// Logs the `message` entry of its job data
#[derive(Default)]
pub struct LogJob {
    services: RwLock<Option<Arc<ServiceRegistry>>>,
}

impl LogJob {
    fn instance_name(&self) -> Result<Option<Arc<String>>, JobError> {
        let services = self
            .services
            .read()
            .map_err(|_| JobError::failed("service registry lock poisoned"))?;
        match services.as_ref() {
            Some(registry) => Ok(Some(registry.lookup::<String>(INSTANCE_NAME_ROLE)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Job for LogJob {
    async fn execute(&self, ctx: &JobExecutionContext) -> Result<(), JobError> {
        let message = ctx.get_str("message").unwrap_or("tick");
        let instance = self
            .instance_name()?
            .map(|name| name.as_str().to_string())
            .unwrap_or_else(|| ctx.scheduler_name.clone());

        info!(
            job = %ctx.job_key(),
            trigger = %ctx.trigger_key(),
            instance = %instance,
            scheduled_fire_time = %ctx.fire.scheduled_fire_time,
            "{}",
            message
        );
        Ok(())
    }

    fn as_serviceable(&self) -> Option<&dyn Serviceable> {
        Some(self)
    }
}

impl Serviceable for LogJob {
    fn inject_services(&self, services: Arc<ServiceRegistry>) {
        if let Ok(mut slot) = self.services.write() {
            *slot = Some(services);
        }
    }
}

/// Does nothing; useful for exercising triggers
pub struct NoopJob;

#[async_trait]
impl Job for NoopJob {
    async fn execute(&self, _ctx: &JobExecutionContext) -> Result<(), JobError> {
        Ok(())
    }
}
