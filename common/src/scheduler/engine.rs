// Scheduler engine: registration API, lifecycle, and the state shared with the loop

use crate::clock::{Clock, SystemClock};
use crate::dispatcher::Dispatcher;
use crate::errors::SchedulerError;
use crate::job::JobExecutionContext;
use crate::listener::{JobListener, ListenerBus, SchedulerListener};
use crate::models::{
    ExecutionRecord, JobDataMap, JobDefinition, JobKey, JobOutcome, MisfirePolicy, Schedule,
    TriggerDefinition, TriggerKey, TriggerState, MANUAL_TRIGGER_GROUP,
};
use crate::scheduler::run_loop;
use crate::store::RamJobStore;
use crate::telemetry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, MutexGuard, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Configuration for the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Name reported in logs, metadata and job execution contexts
    pub instance_name: String,
    /// Maximum number of jobs executing at once
    pub worker_threads: usize,
    /// Lateness beyond which a fire time counts as misfired
    pub misfire_threshold: Duration,
    /// Policy for triggers that do not set their own
    pub default_misfire_policy: MisfirePolicy,
    /// Number of execution records kept for `execution_history`
    pub history_capacity: usize,
    /// Per-execution time limit; unlimited when unset
    pub job_timeout: Option<Duration>,
    /// Upper bound on how long a graceful shutdown waits for running jobs
    pub shutdown_timeout: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            instance_name: "fulcrum".to_string(),
            worker_threads: 10,
            misfire_threshold: Duration::from_secs(60),
            default_misfire_policy: MisfirePolicy::FireOnceNow,
            history_capacity: 100,
            job_timeout: None,
            shutdown_timeout: None,
        }
    }
}

/// Lifecycle status of a scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerStatus {
    /// Registered triggers are kept but nothing fires
    Standby,
    Started,
    ShuttingDown,
    Shutdown,
}

impl fmt::Display for SchedulerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerStatus::Standby => write!(f, "standby"),
            SchedulerStatus::Started => write!(f, "started"),
            SchedulerStatus::ShuttingDown => write!(f, "shutting_down"),
            SchedulerStatus::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Point-in-time summary of a scheduler
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerMetadata {
    pub instance_name: String,
    pub status: SchedulerStatus,
    pub job_count: usize,
    pub trigger_count: usize,
    pub waiting_triggers: usize,
    pub running_jobs: usize,
    pub worker_threads: usize,
    pub fatal_error: Option<String>,
}

/// Scheduler trait for lifecycle operations
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Start (or resume) firing triggers
    async fn start(&self) -> Result<(), SchedulerError>;

    /// Stop firing triggers while keeping all state
    async fn standby(&self) -> Result<(), SchedulerError>;

    /// Stop the scheduler for good. With `wait_for_jobs` running executions
    /// are awaited; otherwise queued executions are abandoned.
    async fn shutdown(&self, wait_for_jobs: bool) -> Result<(), SchedulerError>;

    async fn is_started(&self) -> bool;
}

/// Everything guarded by the engine's single lock
pub(crate) struct EngineState {
    pub(crate) store: RamJobStore,
    pub(crate) status: SchedulerStatus,
    /// Active executions per job
    pub(crate) running_jobs: HashMap<JobKey, usize>,
    pub(crate) history: VecDeque<ExecutionRecord>,
    pub(crate) loop_handle: Option<JoinHandle<()>>,
    pub(crate) fatal_error: Option<String>,
}

impl EngineState {
    pub(crate) fn running_count(&self) -> usize {
        self.running_jobs.values().sum()
    }
}

pub(crate) struct EngineInner {
    pub(crate) config: SchedulerConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) state: Mutex<EngineState>,
    pub(crate) listeners: ListenerBus,
    pub(crate) dispatcher: Dispatcher,
    /// Wakes the loop when the earliest fire time may have changed
    pub(crate) wakeup: Notify,
    /// `true` asks the loop to exit
    pub(crate) halt: watch::Sender<bool>,
    /// Number of fires handed to workers and not yet finished
    pub(crate) in_flight: watch::Sender<usize>,
}

impl EngineInner {
    /// Bookkeeping after a worker is done with a fire
    pub(crate) async fn job_finished(
        &self,
        ctx: &JobExecutionContext,
        started_at: DateTime<Utc>,
        outcome: Option<JobOutcome>,
    ) {
        {
            let mut state = self.state.lock().await;
            let key = ctx.job_key();
            let remaining = match state.running_jobs.get_mut(key) {
                Some(count) => {
                    *count = count.saturating_sub(1);
                    *count
                }
                None => 0,
            };
            if remaining == 0 {
                state.running_jobs.remove(key);
                let unblocked = state.store.unblock_triggers(key);
                if !unblocked.is_empty() {
                    debug!(job = %key, triggers = unblocked.len(), "Unblocked triggers");
                }
            }

            if let Some(outcome) = outcome {
                state.history.push_back(ExecutionRecord {
                    fire: ctx.fire.clone(),
                    started_at,
                    finished_at: Utc::now(),
                    outcome,
                });
                while state.history.len() > self.config.history_capacity {
                    state.history.pop_front();
                }
            }

            telemetry::update_running_jobs(state.running_count());
            telemetry::update_waiting_triggers(state.store.waiting_count());
        }

        self.wakeup.notify_one();
        self.in_flight.send_modify(|count| *count = count.saturating_sub(1));
    }
}

/// In-memory trigger-driven job scheduler
#[derive(Clone)]
pub struct SchedulerEngine {
    inner: Arc<EngineInner>,
}

impl SchedulerEngine {
    /// Create a scheduler in standby that reads time from the system clock
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: SchedulerConfig, clock: Arc<dyn Clock>) -> Self {
        let (halt, _) = watch::channel(true);
        let (in_flight, _) = watch::channel(0usize);
        let dispatcher = Dispatcher::new(config.worker_threads, config.job_timeout);

        Self {
            inner: Arc::new(EngineInner {
                clock,
                state: Mutex::new(EngineState {
                    store: RamJobStore::new(),
                    status: SchedulerStatus::Standby,
                    running_jobs: HashMap::new(),
                    history: VecDeque::with_capacity(config.history_capacity),
                    loop_handle: None,
                    fatal_error: None,
                }),
                listeners: ListenerBus::new(),
                dispatcher,
                wakeup: Notify::new(),
                halt,
                in_flight,
                config,
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn instance_name(&self) -> &str {
        &self.inner.config.instance_name
    }

    fn now(&self) -> Result<DateTime<Utc>, SchedulerError> {
        self.inner
            .clock
            .now()
            .map_err(|e| SchedulerError::Fatal(e.to_string()))
    }

    /// Lock the state, refusing when the scheduler is shutting down
    async fn accepting(&self) -> Result<MutexGuard<'_, EngineState>, SchedulerError> {
        let state = self.inner.state.lock().await;
        match state.status {
            SchedulerStatus::ShuttingDown | SchedulerStatus::Shutdown => {
                Err(SchedulerError::Shutdown)
            }
            _ => Ok(state),
        }
    }

    async fn notify(&self, hook: &'static str, notify: impl Fn(&dyn SchedulerListener)) {
        self.inner
            .listeners
            .notify_scheduler_listeners(hook, notify)
            .await;
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Store a job without scheduling it
    #[instrument(skip(self, job), fields(job = %job.key))]
    pub async fn add_job(&self, job: JobDefinition, replace: bool) -> Result<(), SchedulerError> {
        let snapshot = job.clone();
        self.accepting().await?.store.add_job(job, replace)?;
        debug!("Job added");
        self.notify("job_added", |l| l.job_added(&snapshot)).await;
        Ok(())
    }

    /// Register a trigger for a stored job, returning its first fire time
    #[instrument(skip(self, trigger), fields(trigger = %trigger.key, job = %trigger.job_key))]
    pub async fn add_trigger(
        &self,
        trigger: TriggerDefinition,
    ) -> Result<DateTime<Utc>, SchedulerError> {
        let now = self.now()?;
        let key = trigger.key.clone();
        let (first, snapshot) = {
            let mut state = self.accepting().await?;
            let first = state.store.add_trigger(trigger, now)?;
            telemetry::update_waiting_triggers(state.store.waiting_count());
            (first, state.store.get_trigger(&key))
        };

        self.inner.wakeup.notify_one();
        info!(next_fire_time = %first, "Trigger scheduled");
        if let Some(snapshot) = snapshot {
            self.notify("job_scheduled", |l| l.job_scheduled(&snapshot))
                .await;
        }
        Ok(first)
    }

    /// Register a job and its first trigger together
    #[instrument(skip(self, job, trigger), fields(job = %job.key, trigger = %trigger.key))]
    pub async fn schedule_job(
        &self,
        job: JobDefinition,
        trigger: TriggerDefinition,
    ) -> Result<DateTime<Utc>, SchedulerError> {
        let now = self.now()?;
        let job_snapshot = job.clone();
        let key = trigger.key.clone();
        let (first, snapshot) = {
            let mut state = self.accepting().await?;
            let first = state.store.schedule_job(job, trigger, now)?;
            telemetry::update_waiting_triggers(state.store.waiting_count());
            (first, state.store.get_trigger(&key))
        };

        self.inner.wakeup.notify_one();
        info!(next_fire_time = %first, "Job scheduled");
        self.notify("job_added", |l| l.job_added(&job_snapshot))
            .await;
        if let Some(snapshot) = snapshot {
            self.notify("job_scheduled", |l| l.job_scheduled(&snapshot))
                .await;
        }
        Ok(first)
    }

    /// Remove a job. Returns whether it existed.
    #[instrument(skip(self))]
    pub async fn remove_job(&self, key: &JobKey, cascade: bool) -> Result<bool, SchedulerError> {
        let removed = {
            let mut state = self.accepting().await?;
            let removed = state.store.remove_job(key, cascade)?;
            telemetry::update_waiting_triggers(state.store.waiting_count());
            removed
        };

        let Some(triggers) = removed else {
            return Ok(false);
        };

        self.inner.wakeup.notify_one();
        info!(triggers = triggers.len(), "Job removed");
        for trigger in &triggers {
            self.notify("job_unscheduled", |l| l.job_unscheduled(trigger))
                .await;
        }
        self.notify("job_deleted", |l| l.job_deleted(key)).await;
        Ok(true)
    }

    /// Unschedule a trigger. Returns whether it existed.
    #[instrument(skip(self))]
    pub async fn remove_trigger(&self, key: &TriggerKey) -> Result<bool, SchedulerError> {
        let (removed, job_gone) = {
            let mut state = self.accepting().await?;
            let removed = state.store.remove_trigger(key);
            let job_gone = removed
                .as_ref()
                .is_some_and(|trigger| state.store.get_job(&trigger.job_key).is_none());
            telemetry::update_waiting_triggers(state.store.waiting_count());
            (removed, job_gone)
        };

        let Some(trigger) = removed else {
            return Ok(false);
        };

        self.inner.wakeup.notify_one();
        info!("Trigger removed");
        self.notify("job_unscheduled", |l| l.job_unscheduled(key))
            .await;
        if job_gone {
            debug!(job = %trigger.job_key, "Non-durable job removed with its last trigger");
            self.notify("job_deleted", |l| l.job_deleted(&trigger.job_key))
                .await;
        }
        Ok(true)
    }

    /// Replace a trigger, returning the replacement's first fire time
    #[instrument(skip(self, replacement), fields(replacement = %replacement.key))]
    pub async fn reschedule_trigger(
        &self,
        key: &TriggerKey,
        replacement: TriggerDefinition,
    ) -> Result<DateTime<Utc>, SchedulerError> {
        let now = self.now()?;
        let new_key = replacement.key.clone();
        let (first, snapshot) = {
            let mut state = self.accepting().await?;
            let first = state.store.reschedule_trigger(key, replacement, now)?;
            telemetry::update_waiting_triggers(state.store.waiting_count());
            (first, state.store.get_trigger(&new_key))
        };

        self.inner.wakeup.notify_one();
        info!(next_fire_time = %first, "Trigger rescheduled");
        self.notify("job_unscheduled", |l| l.job_unscheduled(key))
            .await;
        if let Some(snapshot) = snapshot {
            self.notify("job_scheduled", |l| l.job_scheduled(&snapshot))
                .await;
        }
        Ok(first)
    }

    #[instrument(skip(self, data))]
    pub async fn update_job_data(&self, key: &JobKey, data: JobDataMap) -> Result<(), SchedulerError> {
        self.accepting().await?.store.update_job_data(key, data)
    }

    /// Fire a stored job once, now, through a generated one-shot trigger
    #[instrument(skip(self, data))]
    pub async fn trigger_job(
        &self,
        key: &JobKey,
        data: Option<JobDataMap>,
    ) -> Result<TriggerKey, SchedulerError> {
        let now = self.now()?;
        let trigger_key = TriggerKey::new(
            format!("MT_{}", Uuid::new_v4().simple()),
            Some(MANUAL_TRIGGER_GROUP),
        );
        let trigger = TriggerDefinition::new(
            trigger_key.clone(),
            key.clone(),
            Schedule::OneShot { at: now },
        )
        .with_data(data.unwrap_or_default());

        {
            let mut state = self.accepting().await?;
            if state.store.get_job(key).is_none() {
                return Err(SchedulerError::JobNotFound(key.clone()));
            }
            state.store.add_trigger(trigger, now)?;
        }

        self.inner.wakeup.notify_one();
        info!(trigger = %trigger_key, "Job triggered manually");
        Ok(trigger_key)
    }

    // ========================================================================
    // Pause / resume
    // ========================================================================

    #[instrument(skip(self))]
    pub async fn pause_trigger(&self, key: &TriggerKey) -> Result<(), SchedulerError> {
        let changed = self.accepting().await?.store.pause_trigger(key)?;
        if changed {
            info!("Trigger paused");
            let keys = [key.clone()];
            self.notify("triggers_paused", |l| l.triggers_paused(&keys))
                .await;
        }
        Ok(())
    }

    /// Resume a paused trigger. An overdue trigger then goes through its misfire policy.
    #[instrument(skip(self))]
    pub async fn resume_trigger(&self, key: &TriggerKey) -> Result<(), SchedulerError> {
        let changed = self.accepting().await?.store.resume_trigger(key)?;
        if changed {
            self.inner.wakeup.notify_one();
            info!("Trigger resumed");
            let keys = [key.clone()];
            self.notify("triggers_resumed", |l| l.triggers_resumed(&keys))
                .await;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn pause_job(&self, key: &JobKey) -> Result<(), SchedulerError> {
        let paused = self.accepting().await?.store.pause_job(key)?;
        if !paused.is_empty() {
            info!(triggers = paused.len(), "Job paused");
            self.notify("triggers_paused", |l| l.triggers_paused(&paused))
                .await;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn resume_job(&self, key: &JobKey) -> Result<(), SchedulerError> {
        let resumed = self.accepting().await?.store.resume_job(key)?;
        if !resumed.is_empty() {
            self.inner.wakeup.notify_one();
            info!(triggers = resumed.len(), "Job resumed");
            self.notify("triggers_resumed", |l| l.triggers_resumed(&resumed))
                .await;
        }
        Ok(())
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub async fn list_jobs(&self, group: Option<&str>) -> Vec<JobKey> {
        self.inner.state.lock().await.store.list_jobs(group)
    }

    pub async fn list_triggers(&self, group: Option<&str>) -> Vec<TriggerKey> {
        self.inner.state.lock().await.store.list_triggers(group)
    }

    pub async fn job_group_names(&self) -> Vec<String> {
        self.inner.state.lock().await.store.job_group_names()
    }

    pub async fn trigger_group_names(&self) -> Vec<String> {
        self.inner.state.lock().await.store.trigger_group_names()
    }

    pub async fn get_job(&self, key: &JobKey) -> Option<JobDefinition> {
        self.inner.state.lock().await.store.get_job(key)
    }

    pub async fn get_trigger(&self, key: &TriggerKey) -> Option<TriggerDefinition> {
        self.inner.state.lock().await.store.get_trigger(key)
    }

    pub async fn get_triggers_for_job(&self, key: &JobKey) -> Vec<TriggerDefinition> {
        self.inner.state.lock().await.store.get_triggers_for_job(key)
    }

    pub async fn trigger_state(&self, key: &TriggerKey) -> Option<TriggerState> {
        self.inner.state.lock().await.store.trigger_state(key)
    }

    pub async fn status(&self) -> SchedulerStatus {
        self.inner.state.lock().await.status
    }

    /// Number of executions currently running
    pub async fn running_job_count(&self) -> usize {
        self.inner.state.lock().await.running_count()
    }

    /// Most recent executions, oldest first
    pub async fn execution_history(&self) -> Vec<ExecutionRecord> {
        self.inner
            .state
            .lock()
            .await
            .history
            .iter()
            .cloned()
            .collect()
    }

    /// The error that halted the loop, if any. Cleared by `start`.
    pub async fn fatal_error(&self) -> Option<String> {
        self.inner.state.lock().await.fatal_error.clone()
    }

    pub async fn metadata(&self) -> SchedulerMetadata {
        let state = self.inner.state.lock().await;
        SchedulerMetadata {
            instance_name: self.inner.config.instance_name.clone(),
            status: state.status,
            job_count: state.store.job_count(),
            trigger_count: state.store.trigger_count(),
            waiting_triggers: state.store.waiting_count(),
            running_jobs: state.running_count(),
            worker_threads: self.inner.dispatcher.worker_threads(),
            fatal_error: state.fatal_error.clone(),
        }
    }

    // ========================================================================
    // Listeners
    // ========================================================================

    pub async fn add_job_listener(&self, listener: Arc<dyn JobListener>) {
        self.inner.listeners.add_job_listener(listener).await;
    }

    pub async fn remove_job_listener(&self, name: &str) -> bool {
        self.inner.listeners.remove_job_listener(name).await
    }

    pub async fn job_listener_names(&self) -> Vec<String> {
        self.inner.listeners.job_listener_names().await
    }

    pub async fn add_scheduler_listener(&self, listener: Arc<dyn SchedulerListener>) {
        self.inner.listeners.add_scheduler_listener(listener).await;
    }

    pub async fn remove_scheduler_listener(&self, name: &str) -> bool {
        self.inner.listeners.remove_scheduler_listener(name).await
    }

    /// Stop the loop task and wait for it to exit
    async fn stop_loop(&self, handle: Option<JoinHandle<()>>) {
        self.inner.halt.send_replace(true);
        self.inner.wakeup.notify_one();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Scheduler loop ended abnormally");
            }
        }
    }
}

#[async_trait]
impl Scheduler for SchedulerEngine {
    #[instrument(skip(self), fields(scheduler = %self.inner.config.instance_name))]
    async fn start(&self) -> Result<(), SchedulerError> {
        {
            let mut state = self.inner.state.lock().await;
            match state.status {
                SchedulerStatus::ShuttingDown | SchedulerStatus::Shutdown => {
                    return Err(SchedulerError::Shutdown)
                }
                SchedulerStatus::Started => return Ok(()),
                SchedulerStatus::Standby => {}
            }

            state.status = SchedulerStatus::Started;
            state.fatal_error = None;
            self.inner.halt.send_replace(false);
            state.loop_handle = Some(tokio::spawn(run_loop::run(self.inner.clone())));
        }

        info!(
            worker_threads = self.inner.config.worker_threads,
            misfire_threshold_ms = self.inner.config.misfire_threshold.as_millis() as u64,
            "Scheduler started"
        );
        self.notify("scheduler_started", |l| l.scheduler_started())
            .await;
        Ok(())
    }

    #[instrument(skip(self), fields(scheduler = %self.inner.config.instance_name))]
    async fn standby(&self) -> Result<(), SchedulerError> {
        let handle = {
            let mut state = self.inner.state.lock().await;
            match state.status {
                SchedulerStatus::ShuttingDown | SchedulerStatus::Shutdown => {
                    return Err(SchedulerError::Shutdown)
                }
                SchedulerStatus::Standby => return Ok(()),
                SchedulerStatus::Started => {}
            }
            state.status = SchedulerStatus::Standby;
            state.loop_handle.take()
        };

        self.stop_loop(handle).await;
        info!("Scheduler in standby");
        self.notify("scheduler_in_standby", |l| l.scheduler_in_standby())
            .await;
        Ok(())
    }

    #[instrument(skip(self), fields(scheduler = %self.inner.config.instance_name))]
    async fn shutdown(&self, wait_for_jobs: bool) -> Result<(), SchedulerError> {
        let handle = {
            let mut state = self.inner.state.lock().await;
            if matches!(
                state.status,
                SchedulerStatus::ShuttingDown | SchedulerStatus::Shutdown
            ) {
                return Ok(());
            }
            state.status = SchedulerStatus::ShuttingDown;
            state.loop_handle.take()
        };

        info!(wait_for_jobs, "Scheduler shutting down");
        self.stop_loop(handle).await;

        if wait_for_jobs {
            let mut in_flight = self.inner.in_flight.subscribe();
            let drained = in_flight.wait_for(|count| *count == 0);
            match self.inner.config.shutdown_timeout {
                Some(limit) => {
                    if tokio::time::timeout(limit, drained).await.is_err() {
                        warn!(
                            timeout_ms = limit.as_millis() as u64,
                            "Timed out waiting for running jobs"
                        );
                    }
                }
                None => {
                    let _ = drained.await;
                }
            }
        }
        self.inner.dispatcher.close();

        self.inner.state.lock().await.status = SchedulerStatus::Shutdown;
        info!("Scheduler shut down");
        self.notify("scheduler_shutdown", |l| l.scheduler_shutdown())
            .await;
        Ok(())
    }

    async fn is_started(&self) -> bool {
        self.inner.state.lock().await.status == SchedulerStatus::Started
    }
}
