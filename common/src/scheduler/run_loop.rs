// The loop that fires due triggers and hands executions to workers

use crate::errors::{JobError, MisfireError, SchedulerError};
use crate::job::{JobExecutionContext, JobResult};
use crate::listener::Verdict;
use crate::models::{FireEvent, JobOutcome, MisfirePolicy, TriggerDefinition, TriggerState};
use crate::schedule::ScheduleTrigger;
use crate::scheduler::engine::{EngineInner, SchedulerStatus};
use crate::telemetry;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What one pass over the due queue produced. Listener and worker work
/// happens after the state lock is released.
#[derive(Default)]
struct Fired {
    misfire: Option<(TriggerDefinition, MisfireError, MisfirePolicy)>,
    dispatch: Option<JobExecutionContext>,
    finalized: Option<TriggerDefinition>,
    broken: Option<(String, SchedulerError)>,
}

enum Step {
    /// Something was due and has been handled; look again immediately
    Handled(Fired),
    /// Nothing is due. Sleep until the given delay passes or a wakeup
    /// arrives; with no delay, wait for a wakeup only.
    Wait(Option<Duration>),
    Halt(Option<String>),
}

pub(crate) async fn run(inner: Arc<EngineInner>) {
    let mut halt = inner.halt.subscribe();
    debug!(scheduler = %inner.config.instance_name, "Scheduler loop running");

    loop {
        if *halt.borrow_and_update() {
            break;
        }

        match step(&inner).await {
            Step::Handled(fired) => deliver(&inner, fired).await,
            Step::Wait(delay) => {
                let sleep = async {
                    match delay {
                        Some(delay) => tokio::time::sleep(delay).await,
                        None => std::future::pending::<()>().await,
                    }
                };
                tokio::select! {
                    _ = sleep => {}
                    _ = inner.wakeup.notified() => {}
                    _ = halt.changed() => {}
                }
            }
            Step::Halt(None) => break,
            Step::Halt(Some(reason)) => {
                error!(error = %reason, "Time source failed, scheduler loop halted");
                let err = SchedulerError::Fatal(reason);
                inner
                    .listeners
                    .notify_scheduler_listeners("scheduler_error", |l| {
                        l.scheduler_error("Time source failed", &err)
                    })
                    .await;
                break;
            }
        }
    }

    debug!(scheduler = %inner.config.instance_name, "Scheduler loop stopped");
}

/// Inspect the earliest due trigger under the state lock
async fn step(inner: &Arc<EngineInner>) -> Step {
    let mut state = inner.state.lock().await;
    if state.status != SchedulerStatus::Started {
        return Step::Halt(None);
    }

    let now = match inner.clock.now() {
        Ok(now) => now,
        Err(e) => {
            let reason = e.to_string();
            state.status = SchedulerStatus::Standby;
            state.fatal_error = Some(reason.clone());
            return Step::Halt(Some(reason));
        }
    };

    let Some((fire_time, key)) = state.store.peek_due() else {
        return Step::Wait(None);
    };
    if fire_time > now {
        return Step::Wait(Some((fire_time - now).to_std().unwrap_or_default()));
    }
    let Some(trigger) = state.store.get_trigger(&key) else {
        return Step::Handled(Fired::default());
    };

    let Some(job) = state.store.get_job(&trigger.job_key) else {
        state.store.set_state(&key, TriggerState::Error);
        let err = SchedulerError::JobNotFound(trigger.job_key.clone());
        error!(trigger = %key, job = %trigger.job_key, "Trigger references a missing job");
        return Step::Handled(Fired {
            broken: Some((format!("Trigger {} could not fire", key), err)),
            ..Fired::default()
        });
    };

    if !job.allow_concurrent_execution && state.running_jobs.contains_key(&job.key) {
        state.store.set_state(&key, TriggerState::Blocked);
        debug!(trigger = %key, job = %job.key, "Job still running, trigger blocked");
        return Step::Handled(Fired::default());
    }

    let threshold = trigger
        .misfire_threshold
        .unwrap_or(inner.config.misfire_threshold);
    let policy = trigger
        .misfire_policy
        .unwrap_or(inner.config.default_misfire_policy);
    let late_by = (now - fire_time).to_std().unwrap_or_default();
    let misfire = (late_by > threshold).then(|| MisfireError {
        trigger: key.clone(),
        scheduled_fire_time: fire_time,
        late_by,
        threshold,
    });

    if let (Some(misfire), MisfirePolicy::Skip) = (&misfire, policy) {
        let next = trigger.schedule.next_fire_time(now);
        let snapshot = state.store.skip_to(&key, next);
        telemetry::update_waiting_triggers(state.store.waiting_count());
        return Step::Handled(Fired {
            finalized: snapshot.filter(|t| t.state == TriggerState::Complete),
            misfire: Some((trigger, misfire.clone(), policy)),
            ..Fired::default()
        });
    }

    // a misfired trigger fires once now and resumes from now; otherwise the
    // next fire time follows the one just fired, catching up on short delays
    let next = if misfire.is_some() {
        trigger.schedule.next_fire_time(now)
    } else {
        trigger.schedule.next_fire_time(fire_time)
    };
    let fired_at = if misfire.is_some() { now } else { fire_time };
    let snapshot = state.store.trigger_fired(&key, fired_at, next);

    let fire = FireEvent {
        fire_instance_id: Uuid::new_v4(),
        trigger_key: key.clone(),
        job_key: job.key.clone(),
        scheduled_fire_time: fire_time,
        actual_fire_time: now,
        previous_fire_time: trigger.previous_fire_time,
        next_fire_time: next,
        misfired: misfire.is_some(),
    };

    let mut merged_data = job.data.clone();
    merged_data.extend(trigger.data.clone());

    *state.running_jobs.entry(job.key.clone()).or_default() += 1;
    inner.in_flight.send_modify(|count| *count += 1);
    telemetry::update_running_jobs(state.running_count());
    telemetry::update_waiting_triggers(state.store.waiting_count());

    Step::Handled(Fired {
        finalized: snapshot.filter(|t| t.state == TriggerState::Complete),
        misfire: misfire.map(|m| (trigger, m, policy)),
        dispatch: Some(JobExecutionContext {
            fire,
            job,
            merged_data,
            scheduler_name: inner.config.instance_name.clone(),
            started_at: None,
        }),
        broken: None,
    })
}

/// Notify listeners about a handled step and spawn the worker, if any
async fn deliver(inner: &Arc<EngineInner>, fired: Fired) {
    if let Some((trigger, misfire, policy)) = &fired.misfire {
        warn!(
            trigger = %trigger.key,
            scheduled_fire_time = %misfire.scheduled_fire_time,
            late_by_ms = misfire.late_by.as_millis() as u64,
            policy = policy.as_str(),
            "Trigger misfired"
        );
        telemetry::record_trigger_misfired(&trigger.key.to_string(), policy.as_str());
        inner.listeners.trigger_misfired(trigger, misfire).await;
    }

    if let Some((message, err)) = &fired.broken {
        inner
            .listeners
            .notify_scheduler_listeners("scheduler_error", |l| l.scheduler_error(message, err))
            .await;
    }

    if let Some(ctx) = fired.dispatch {
        debug!(
            trigger = %ctx.trigger_key(),
            job = %ctx.job_key(),
            fire_id = %ctx.fire.fire_instance_id,
            scheduled_fire_time = %ctx.fire.scheduled_fire_time,
            "Trigger fired"
        );
        telemetry::record_trigger_fired(&ctx.trigger_key().to_string(), ctx.fire.misfired);
        tokio::spawn(run_worker(inner.clone(), ctx));
    }

    if let Some(trigger) = &fired.finalized {
        info!(
            trigger = %trigger.key,
            times_triggered = trigger.times_triggered,
            "Trigger completed"
        );
        inner
            .listeners
            .notify_scheduler_listeners("trigger_finalized", |l| l.trigger_finalized(trigger))
            .await;
    }
}

/// Run one execution on a pooled worker
async fn run_worker(inner: Arc<EngineInner>, mut ctx: JobExecutionContext) {
    let job = ctx.job_key().to_string();

    let outcome = match inner.dispatcher.acquire().await {
        Ok(permit) => {
            let started_at = Utc::now();
            ctx.started_at = Some(started_at);
            let outcome = match inner.listeners.job_to_be_executed(&ctx).await {
                Verdict::Veto => {
                    telemetry::record_job_vetoed(&job);
                    JobOutcome::Vetoed
                }
                Verdict::Proceed => {
                    let result = inner.dispatcher.dispatch(&ctx).await;
                    let elapsed = (Utc::now() - started_at).to_std().unwrap_or_default();
                    telemetry::record_job_duration(&job, elapsed.as_secs_f64());
                    record_result(&job, &result);
                    inner.listeners.job_was_executed(&ctx, &result).await;
                    result.outcome()
                }
            };
            drop(permit);
            Some((started_at, outcome))
        }
        Err(_) => {
            debug!(
                job = %job,
                fire_id = %ctx.fire.fire_instance_id,
                "Worker pool closed, execution abandoned"
            );
            None
        }
    };

    match outcome {
        Some((started_at, outcome)) => inner.job_finished(&ctx, started_at, Some(outcome)).await,
        None => inner.job_finished(&ctx, Utc::now(), None).await,
    }
}

fn record_result(job: &str, result: &JobResult) {
    match result.error() {
        None => telemetry::record_job_success(job),
        Some(err) => {
            let reason = match err {
                JobError::Timeout(_) => "timeout",
                JobError::Panicked(_) => "panic",
                _ => "error",
            };
            telemetry::record_job_failure(job, reason);
        }
    }
}
