// Listener hooks around job dispatch and scheduler lifecycle events
//
// Listeners are invoked in registration order. A listener that returns an
// error or panics is logged and skipped; it never affects other listeners,
// the job, or the scheduler loop.

use crate::dispatcher::panic_message;
use crate::errors::{MisfireError, SchedulerError};
use crate::job::{JobExecutionContext, JobResult, ServiceRegistry};
use crate::models::{JobDefinition, JobKey, TriggerDefinition, TriggerKey};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

/// Decision of a listener about an imminent execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Proceed,
    Veto,
}

/// Hooks invoked around every job execution
pub trait JobListener: Send + Sync {
    fn name(&self) -> &str;

    /// Called before the job runs; the first `Veto` cancels the execution
    fn job_to_be_executed(&self, _ctx: &JobExecutionContext) -> anyhow::Result<Verdict> {
        Ok(Verdict::Proceed)
    }

    /// Called on every listener once an execution has been vetoed
    fn job_execution_vetoed(&self, _ctx: &JobExecutionContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn job_was_executed(
        &self,
        _ctx: &JobExecutionContext,
        _result: &JobResult,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn trigger_misfired(
        &self,
        _trigger: &TriggerDefinition,
        _misfire: &MisfireError,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Hooks invoked on registration and lifecycle events
pub trait SchedulerListener: Send + Sync {
    fn name(&self) -> &str;

    fn job_added(&self, _job: &JobDefinition) {}

    fn job_deleted(&self, _job: &JobKey) {}

    fn job_scheduled(&self, _trigger: &TriggerDefinition) {}

    fn job_unscheduled(&self, _trigger: &TriggerKey) {}

    /// The trigger will never fire again
    fn trigger_finalized(&self, _trigger: &TriggerDefinition) {}

    fn triggers_paused(&self, _triggers: &[TriggerKey]) {}

    fn triggers_resumed(&self, _triggers: &[TriggerKey]) {}

    fn scheduler_error(&self, _message: &str, _error: &SchedulerError) {}

    fn scheduler_started(&self) {}

    fn scheduler_in_standby(&self) {}

    fn scheduler_shutdown(&self) {}
}

/// Ordered listener registry shared by the loop and the worker tasks
#[derive(Default)]
pub struct ListenerBus {
    job_listeners: RwLock<Vec<Arc<dyn JobListener>>>,
    scheduler_listeners: RwLock<Vec<Arc<dyn SchedulerListener>>>,
}

impl ListenerBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_job_listener(&self, listener: Arc<dyn JobListener>) {
        debug!(listener = listener.name(), "Registering job listener");
        self.job_listeners.write().await.push(listener);
    }

    /// Remove every job listener registered under `name`
    pub async fn remove_job_listener(&self, name: &str) -> bool {
        let mut listeners = self.job_listeners.write().await;
        let before = listeners.len();
        listeners.retain(|listener| listener.name() != name);
        listeners.len() != before
    }

    pub async fn job_listener_names(&self) -> Vec<String> {
        self.job_listeners
            .read()
            .await
            .iter()
            .map(|listener| listener.name().to_string())
            .collect()
    }

    pub async fn add_scheduler_listener(&self, listener: Arc<dyn SchedulerListener>) {
        debug!(listener = listener.name(), "Registering scheduler listener");
        self.scheduler_listeners.write().await.push(listener);
    }

    pub async fn remove_scheduler_listener(&self, name: &str) -> bool {
        let mut listeners = self.scheduler_listeners.write().await;
        let before = listeners.len();
        listeners.retain(|listener| listener.name() != name);
        listeners.len() != before
    }

    /// Run the before-phase. Returns `Veto` if any listener vetoed, after
    /// notifying every listener of the veto.
    pub async fn job_to_be_executed(&self, ctx: &JobExecutionContext) -> Verdict {
        let listeners = self.job_listeners.read().await.clone();

        let vetoed_by = listeners.iter().find(|listener| {
            guarded(listener.name(), "job_to_be_executed", || {
                listener.job_to_be_executed(ctx)
            }) == Some(Verdict::Veto)
        });

        let Some(vetoed_by) = vetoed_by else {
            return Verdict::Proceed;
        };

        debug!(
            job = %ctx.job_key(),
            trigger = %ctx.trigger_key(),
            listener = vetoed_by.name(),
            "Job execution vetoed"
        );

        for listener in &listeners {
            guarded(listener.name(), "job_execution_vetoed", || {
                listener.job_execution_vetoed(ctx)
            });
        }

        Verdict::Veto
    }

    pub async fn job_was_executed(&self, ctx: &JobExecutionContext, result: &JobResult) {
        let listeners = self.job_listeners.read().await.clone();
        for listener in &listeners {
            guarded(listener.name(), "job_was_executed", || {
                listener.job_was_executed(ctx, result)
            });
        }
    }

    pub async fn trigger_misfired(&self, trigger: &TriggerDefinition, misfire: &MisfireError) {
        let listeners = self.job_listeners.read().await.clone();
        for listener in &listeners {
            guarded(listener.name(), "trigger_misfired", || {
                listener.trigger_misfired(trigger, misfire)
            });
        }
    }

    /// Invoke `hook` on every scheduler listener
    pub async fn notify_scheduler_listeners<F>(&self, hook: &'static str, notify: F)
    where
        F: Fn(&dyn SchedulerListener),
    {
        let listeners = self.scheduler_listeners.read().await.clone();
        for listener in &listeners {
            guarded(listener.name(), hook, || {
                notify(listener.as_ref());
                Ok(())
            });
        }
    }
}

/// Run one listener hook, logging and swallowing errors and panics
fn guarded<T>(
    listener: &str,
    hook: &'static str,
    call: impl FnOnce() -> anyhow::Result<T>,
) -> Option<T> {
    match std::panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            warn!(listener, hook, error = %e, "Listener returned an error");
            None
        }
        Err(panic) => {
            error!(
                listener,
                hook,
                panic = %panic_message(&*panic),
                "Listener panicked"
            );
            None
        }
    }
}

// ============================================================================
// Built-in listeners
// ============================================================================

/// Logs failed executions at ERROR and every run time at DEBUG
#[derive(Debug, Default)]
pub struct LoggingJobListener;

impl JobListener for LoggingJobListener {
    fn name(&self) -> &str {
        "logging"
    }

    fn job_was_executed(&self, ctx: &JobExecutionContext, result: &JobResult) -> anyhow::Result<()> {
        let run_time = ctx.run_time(chrono::Utc::now());

        if let Some(error) = result.error() {
            error!(
                job = %ctx.job_key(),
                trigger = %ctx.trigger_key(),
                fire_id = %ctx.fire.fire_instance_id,
                error = %error,
                "Job execution failed"
            );
        }

        debug!(
            job = %ctx.job_key(),
            run_time_ms = run_time.num_milliseconds(),
            "Job run time"
        );
        Ok(())
    }

    fn trigger_misfired(
        &self,
        trigger: &TriggerDefinition,
        misfire: &MisfireError,
    ) -> anyhow::Result<()> {
        debug!(trigger = %trigger.key, late_by = ?misfire.late_by, "Trigger misfired");
        Ok(())
    }
}

/// Hands the service registry to serviceable jobs right before they run
pub struct ServiceInjectionListener {
    services: Arc<ServiceRegistry>,
}

impl ServiceInjectionListener {
    pub fn new(services: Arc<ServiceRegistry>) -> Self {
        Self { services }
    }
}

impl JobListener for ServiceInjectionListener {
    fn name(&self) -> &str {
        "service-injection"
    }

    fn job_to_be_executed(&self, ctx: &JobExecutionContext) -> anyhow::Result<Verdict> {
        if let Some(serviceable) = ctx.job.job.as_serviceable() {
            serviceable.inject_services(self.services.clone());
        }
        Ok(Verdict::Proceed)
    }
}
