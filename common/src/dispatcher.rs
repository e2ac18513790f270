// Bounded worker pool that executes jobs with panic capture and an optional timeout

use crate::errors::{JobError, SchedulerError};
use crate::job::{JobExecutionContext, JobResult};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info_span, Instrument};

/// Dispatcher runs job executions on a fixed number of worker slots
#[derive(Debug, Clone)]
pub struct Dispatcher {
    permits: Arc<Semaphore>,
    worker_threads: usize,
    job_timeout: Option<Duration>,
}

impl Dispatcher {
    pub fn new(worker_threads: usize, job_timeout: Option<Duration>) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(worker_threads)),
            worker_threads,
            job_timeout,
        }
    }

    /// Wait for a free worker slot. Fails once the pool is closed.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, SchedulerError> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SchedulerError::Shutdown)
    }

    /// Abandon queued dispatches; running ones finish normally
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    pub fn idle_workers(&self) -> usize {
        self.permits.available_permits()
    }

    /// Execute the job in `ctx`, capturing failures, panics and timeouts as a `JobResult`
    pub async fn dispatch(&self, ctx: &JobExecutionContext) -> JobResult {
        let span = info_span!(
            "job",
            job = %ctx.job_key(),
            trigger = %ctx.trigger_key(),
            fire_id = %ctx.fire.fire_instance_id,
        );

        async {
            let job = ctx.job.job.clone();
            let guarded = AssertUnwindSafe(job.execute(ctx)).catch_unwind();

            let outcome = match self.job_timeout {
                Some(limit) => match tokio::time::timeout(limit, guarded).await {
                    Ok(outcome) => outcome,
                    Err(_) => return JobResult::Failure(Arc::new(JobError::Timeout(limit))),
                },
                None => guarded.await,
            };

            match outcome {
                Ok(Ok(())) => {
                    debug!("Job completed");
                    JobResult::Success
                }
                Ok(Err(e)) => JobResult::Failure(Arc::new(e)),
                Err(panic) => {
                    JobResult::Failure(Arc::new(JobError::Panicked(panic_message(&*panic))))
                }
            }
        }
        .instrument(span)
        .await
    }
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
