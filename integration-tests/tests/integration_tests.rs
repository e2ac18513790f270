// Integration tests for the Fulcrum scheduler
// These tests drive a real engine on the system clock and verify end-to-end timing behaviour

use chrono::{Duration as ChronoDuration, Utc};
use common::errors::{JobError, MisfireError, SchedulerError};
use common::job::{job_fn, JobExecutionContext, JobResult};
use common::listener::{JobListener, SchedulerListener, Verdict};
use common::models::{
    FireEvent, JobDefinition, JobKey, JobOutcome, MisfirePolicy, RepeatCount, Schedule,
    TriggerDefinition, TriggerKey, TriggerState,
};
use common::scheduler::{Scheduler, SchedulerConfig, SchedulerEngine, SchedulerStatus};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::sleep;

/// Job that records every fire it sees
fn recording_job(name: &str, fires: Arc<Mutex<Vec<FireEvent>>>) -> JobDefinition {
    JobDefinition::new(
        JobKey::with_default_group(name),
        job_fn(move |ctx| {
            let fires = fires.clone();
            async move {
                fires.lock().unwrap().push(ctx.fire.clone());
                Ok(())
            }
        }),
    )
}

/// Job that sleeps while tracking how many of its executions overlap
fn slow_job(
    name: &str,
    run_for: Duration,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
    finished: Arc<AtomicUsize>,
) -> JobDefinition {
    JobDefinition::new(
        JobKey::with_default_group(name),
        job_fn(move |_| {
            let active = active.clone();
            let max_active = max_active.clone();
            let finished = finished.clone();
            async move {
                let now_active = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_active.fetch_max(now_active, Ordering::SeqCst);
                sleep(run_for).await;
                active.fetch_sub(1, Ordering::SeqCst);
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }),
    )
}

fn one_shot(name: &str, job: &str, in_ms: i64) -> TriggerDefinition {
    TriggerDefinition::new(
        TriggerKey::with_default_group(name),
        JobKey::with_default_group(job),
        Schedule::OneShot {
            at: Utc::now() + ChronoDuration::milliseconds(in_ms),
        },
    )
}

fn engine() -> SchedulerEngine {
    SchedulerEngine::new(SchedulerConfig {
        instance_name: "integration".to_string(),
        worker_threads: 4,
        ..SchedulerConfig::default()
    })
}

#[derive(Default)]
struct RecordingListener {
    vetoed: AtomicUsize,
    executed: AtomicUsize,
    misfires: Mutex<Vec<MisfireError>>,
    veto: bool,
}

impl JobListener for RecordingListener {
    fn name(&self) -> &str {
        "recording"
    }

    fn job_to_be_executed(&self, _ctx: &JobExecutionContext) -> anyhow::Result<Verdict> {
        Ok(if self.veto {
            Verdict::Veto
        } else {
            Verdict::Proceed
        })
    }

    fn job_execution_vetoed(&self, _ctx: &JobExecutionContext) -> anyhow::Result<()> {
        self.vetoed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn job_was_executed(&self, _ctx: &JobExecutionContext, _result: &JobResult) -> anyhow::Result<()> {
        self.executed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn trigger_misfired(
        &self,
        _trigger: &TriggerDefinition,
        misfire: &MisfireError,
    ) -> anyhow::Result<()> {
        self.misfires.lock().unwrap().push(misfire.clone());
        Ok(())
    }
}

/// Fails or panics in every hook
struct FaultyListener;

impl JobListener for FaultyListener {
    fn name(&self) -> &str {
        "faulty"
    }

    fn job_to_be_executed(&self, _ctx: &JobExecutionContext) -> anyhow::Result<Verdict> {
        anyhow::bail!("listener storage unavailable")
    }

    fn job_was_executed(&self, _ctx: &JobExecutionContext, _result: &JobResult) -> anyhow::Result<()> {
        panic!("listener bug")
    }
}

#[derive(Default)]
struct LifecycleListener {
    events: Mutex<Vec<String>>,
}

impl SchedulerListener for LifecycleListener {
    fn name(&self) -> &str {
        "lifecycle"
    }

    fn job_scheduled(&self, trigger: &TriggerDefinition) {
        self.events
            .lock()
            .unwrap()
            .push(format!("scheduled {}", trigger.key));
    }

    fn trigger_finalized(&self, trigger: &TriggerDefinition) {
        self.events
            .lock()
            .unwrap()
            .push(format!("finalized {}", trigger.key));
    }

    fn scheduler_started(&self) {
        self.events.lock().unwrap().push("started".to_string());
    }

    fn scheduler_shutdown(&self) {
        self.events.lock().unwrap().push("shutdown".to_string());
    }
}

#[tokio::test]
async fn test_one_shot_fires_exactly_once() {
    let fires = Arc::new(Mutex::new(Vec::new()));
    let engine = engine();
    engine
        .schedule_job(recording_job("once", fires.clone()), one_shot("once", "once", 100))
        .await
        .unwrap();
    engine.start().await.unwrap();

    sleep(Duration::from_millis(300)).await;

    assert_eq!(fires.lock().unwrap().len(), 1);
    let trigger = engine
        .get_trigger(&TriggerKey::with_default_group("once"))
        .await
        .unwrap();
    assert_eq!(trigger.state, TriggerState::Complete);
    assert_eq!(trigger.times_triggered, 1);
    assert!(trigger.next_fire_time.is_none());

    engine.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn test_cron_every_second_over_five_seconds() {
    let fires = Arc::new(Mutex::new(Vec::new()));
    let engine = engine();
    let trigger = TriggerDefinition::new(
        TriggerKey::with_default_group("every-second"),
        JobKey::with_default_group("tick"),
        Schedule::cron("* * * * * ?", chrono_tz::UTC).unwrap(),
    );
    engine
        .schedule_job(recording_job("tick", fires.clone()), trigger)
        .await
        .unwrap();
    engine.start().await.unwrap();

    sleep(Duration::from_secs(5)).await;
    engine.shutdown(true).await.unwrap();

    let fires = fires.lock().unwrap();
    assert!(
        (4..=6).contains(&fires.len()),
        "expected 4-6 fires, got {}",
        fires.len()
    );
    for pair in fires.windows(2) {
        assert_eq!(
            pair[1].scheduled_fire_time - pair[0].scheduled_fire_time,
            ChronoDuration::seconds(1)
        );
    }
}

#[tokio::test]
async fn test_interval_with_repeat_count_fires_n_plus_one_times() {
    let fires = Arc::new(Mutex::new(Vec::new()));
    let engine = engine();
    let trigger = TriggerDefinition::new(
        TriggerKey::with_default_group("repeat"),
        JobKey::with_default_group("repeat"),
        Schedule::Interval {
            start: Utc::now() + ChronoDuration::milliseconds(50),
            every: Duration::from_millis(100),
            repeat: RepeatCount::Times(3),
        },
    );
    engine
        .schedule_job(recording_job("repeat", fires.clone()), trigger)
        .await
        .unwrap();
    engine.start().await.unwrap();

    sleep(Duration::from_millis(800)).await;

    let fires = fires.lock().unwrap().clone();
    assert_eq!(fires.len(), 4);
    for pair in fires.windows(2) {
        assert_eq!(
            pair[1].scheduled_fire_time - pair[0].scheduled_fire_time,
            ChronoDuration::milliseconds(100)
        );
    }
    assert!(fires.iter().all(|f| f.actual_fire_time >= f.scheduled_fire_time));
    assert_eq!(
        engine
            .trigger_state(&TriggerKey::with_default_group("repeat"))
            .await,
        Some(TriggerState::Complete)
    );

    engine.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn test_trigger_for_unknown_job_is_rejected() {
    let engine = engine();
    let err = engine
        .add_trigger(one_shot("orphan", "nobody", 1_000))
        .await
        .unwrap_err();

    assert!(err.is_configuration_error());
    assert!(matches!(err, SchedulerError::UnknownJob { .. }));
    assert!(engine.list_triggers(None).await.is_empty());
    assert!(engine.list_jobs(None).await.is_empty());
}

#[tokio::test]
async fn test_paused_trigger_fires_once_after_resume() {
    let fires = Arc::new(Mutex::new(Vec::new()));
    let listener = Arc::new(RecordingListener::default());
    let engine = engine();
    engine.add_job_listener(listener.clone()).await;

    let trigger = one_shot("paused", "paused", 100)
        .with_misfire_threshold(Duration::from_millis(50));
    let key = trigger.key.clone();
    engine
        .schedule_job(recording_job("paused", fires.clone()), trigger)
        .await
        .unwrap();
    engine.pause_trigger(&key).await.unwrap();
    engine.start().await.unwrap();

    sleep(Duration::from_millis(400)).await;
    assert!(fires.lock().unwrap().is_empty());
    assert_eq!(engine.trigger_state(&key).await, Some(TriggerState::Paused));

    engine.resume_trigger(&key).await.unwrap();
    sleep(Duration::from_millis(200)).await;

    let fires = fires.lock().unwrap().clone();
    assert_eq!(fires.len(), 1);
    assert!(fires[0].misfired);
    assert_eq!(listener.misfires.lock().unwrap().len(), 1);
    assert_eq!(engine.trigger_state(&key).await, Some(TriggerState::Complete));

    engine.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn test_paused_interval_produces_no_fires() {
    let fires = Arc::new(Mutex::new(Vec::new()));
    let engine = engine();
    let trigger = TriggerDefinition::new(
        TriggerKey::with_default_group("pulse"),
        JobKey::with_default_group("pulse"),
        Schedule::Interval {
            start: Utc::now(),
            every: Duration::from_millis(50),
            repeat: RepeatCount::Forever,
        },
    );
    engine
        .schedule_job(recording_job("pulse", fires.clone()), trigger)
        .await
        .unwrap();
    engine.start().await.unwrap();

    sleep(Duration::from_millis(200)).await;
    engine
        .pause_job(&JobKey::with_default_group("pulse"))
        .await
        .unwrap();
    sleep(Duration::from_millis(50)).await;
    let paused_at = fires.lock().unwrap().len();
    assert!(paused_at >= 2);

    sleep(Duration::from_millis(300)).await;
    assert_eq!(fires.lock().unwrap().len(), paused_at);

    engine.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn test_non_concurrent_job_never_overlaps() {
    let active = Arc::new(AtomicUsize::new(0));
    let max_active = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));
    let engine = engine();

    let job = slow_job(
        "exclusive",
        Duration::from_millis(300),
        active.clone(),
        max_active.clone(),
        finished.clone(),
    )
    .allow_concurrent_execution(false)
    .durable(true);
    engine.add_job(job, false).await.unwrap();
    engine
        .add_trigger(one_shot("first", "exclusive", 50))
        .await
        .unwrap();
    engine
        .add_trigger(one_shot("second", "exclusive", 50))
        .await
        .unwrap();
    engine.start().await.unwrap();

    sleep(Duration::from_millis(200)).await;
    let states = [
        engine
            .trigger_state(&TriggerKey::with_default_group("first"))
            .await,
        engine
            .trigger_state(&TriggerKey::with_default_group("second"))
            .await,
    ];
    assert!(states.contains(&Some(TriggerState::Blocked)));

    sleep(Duration::from_millis(700)).await;
    assert_eq!(finished.load(Ordering::SeqCst), 2);
    assert_eq!(max_active.load(Ordering::SeqCst), 1);

    engine.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn test_concurrent_job_may_overlap() {
    let active = Arc::new(AtomicUsize::new(0));
    let max_active = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));
    let engine = engine();

    let job = slow_job(
        "shared",
        Duration::from_millis(300),
        active,
        max_active.clone(),
        finished.clone(),
    )
    .durable(true);
    engine.add_job(job, false).await.unwrap();
    engine.add_trigger(one_shot("a", "shared", 50)).await.unwrap();
    engine.add_trigger(one_shot("b", "shared", 50)).await.unwrap();
    engine.start().await.unwrap();

    sleep(Duration::from_millis(600)).await;
    assert_eq!(finished.load(Ordering::SeqCst), 2);
    assert_eq!(max_active.load(Ordering::SeqCst), 2);

    engine.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn test_vetoed_execution_does_not_run() {
    let fires = Arc::new(Mutex::new(Vec::new()));
    let listener = Arc::new(RecordingListener {
        veto: true,
        ..RecordingListener::default()
    });
    let engine = engine();
    engine.add_job_listener(listener.clone()).await;
    engine
        .schedule_job(recording_job("vetoed", fires.clone()), one_shot("vetoed", "vetoed", 50))
        .await
        .unwrap();
    engine.start().await.unwrap();

    sleep(Duration::from_millis(250)).await;

    assert!(fires.lock().unwrap().is_empty());
    assert_eq!(listener.vetoed.load(Ordering::SeqCst), 1);
    assert_eq!(listener.executed.load(Ordering::SeqCst), 0);
    let history = engine.execution_history().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].outcome, JobOutcome::Vetoed);

    engine.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn test_faulty_listener_does_not_affect_jobs() {
    let fires = Arc::new(Mutex::new(Vec::new()));
    let recording = Arc::new(RecordingListener::default());
    let engine = engine();
    engine.add_job_listener(Arc::new(FaultyListener)).await;
    engine.add_job_listener(recording.clone()).await;

    let trigger = TriggerDefinition::new(
        TriggerKey::with_default_group("steady"),
        JobKey::with_default_group("steady"),
        Schedule::Interval {
            start: Utc::now() + ChronoDuration::milliseconds(50),
            every: Duration::from_millis(100),
            repeat: RepeatCount::Times(1),
        },
    );
    engine
        .schedule_job(recording_job("steady", fires.clone()), trigger)
        .await
        .unwrap();
    engine.start().await.unwrap();

    sleep(Duration::from_millis(400)).await;

    assert_eq!(fires.lock().unwrap().len(), 2);
    assert_eq!(recording.executed.load(Ordering::SeqCst), 2);
    assert!(engine.is_started().await);

    engine.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn test_failing_and_panicking_jobs_are_recorded() {
    let engine = engine();
    engine
        .schedule_job(
            JobDefinition::new(
                JobKey::with_default_group("fails"),
                job_fn(|_| async { Err(JobError::failed("disk full")) }),
            ),
            one_shot("fails", "fails", 50),
        )
        .await
        .unwrap();
    engine
        .schedule_job(
            JobDefinition::new(
                JobKey::with_default_group("panics"),
                job_fn(|ctx| async move {
                    if ctx.get_str("never").is_none() {
                        panic!("job bug");
                    }
                    Ok(())
                }),
            ),
            one_shot("panics", "panics", 50),
        )
        .await
        .unwrap();
    engine.start().await.unwrap();

    sleep(Duration::from_millis(300)).await;

    let history = engine.execution_history().await;
    assert_eq!(history.len(), 2);
    for record in &history {
        match &record.outcome {
            JobOutcome::Failed(reason) => {
                assert!(reason.contains("disk full") || reason.contains("job bug"))
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }
    assert!(engine.is_started().await);

    engine.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn test_job_timeout_is_reported_as_failure() {
    let engine = SchedulerEngine::new(SchedulerConfig {
        job_timeout: Some(Duration::from_millis(100)),
        ..SchedulerConfig::default()
    });
    engine
        .schedule_job(
            JobDefinition::new(
                JobKey::with_default_group("stuck"),
                job_fn(|_| async {
                    sleep(Duration::from_secs(5)).await;
                    Ok(())
                }),
            ),
            one_shot("stuck", "stuck", 20),
        )
        .await
        .unwrap();
    engine.start().await.unwrap();

    sleep(Duration::from_millis(400)).await;

    let history = engine.execution_history().await;
    assert_eq!(history.len(), 1);
    assert!(matches!(&history[0].outcome, JobOutcome::Failed(reason) if reason.contains("timed out")));
    assert_eq!(engine.running_job_count().await, 0);

    engine.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn test_graceful_shutdown_waits_for_running_jobs() {
    let finished = Arc::new(AtomicUsize::new(0));
    let engine = engine();
    engine
        .schedule_job(
            slow_job(
                "slow",
                Duration::from_millis(400),
                Arc::new(AtomicUsize::new(0)),
                Arc::new(AtomicUsize::new(0)),
                finished.clone(),
            ),
            one_shot("slow", "slow", 20),
        )
        .await
        .unwrap();
    engine.start().await.unwrap();
    sleep(Duration::from_millis(150)).await;
    assert_eq!(engine.running_job_count().await, 1);

    engine.shutdown(true).await.unwrap();

    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(engine.status().await, SchedulerStatus::Shutdown);

    let history = engine.execution_history().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].outcome, JobOutcome::Succeeded);
    assert!(history[0].run_time() >= ChronoDuration::milliseconds(400));
}

#[tokio::test]
async fn test_run_time_starts_when_worker_slot_is_acquired() {
    let waits = Arc::new(Mutex::new(Vec::new()));
    let seen = waits.clone();
    let engine = SchedulerEngine::new(SchedulerConfig {
        worker_threads: 1,
        ..SchedulerConfig::default()
    });
    engine
        .schedule_job(
            JobDefinition::new(
                JobKey::with_default_group("queued"),
                job_fn(move |ctx| {
                    let seen = seen.clone();
                    async move {
                        let started_at = ctx.started_at.unwrap();
                        seen.lock()
                            .unwrap()
                            .push(started_at - ctx.fire.actual_fire_time);
                        sleep(Duration::from_millis(200)).await;
                        Ok(())
                    }
                }),
            ),
            one_shot("first", "queued", 20),
        )
        .await
        .unwrap();
    engine.add_trigger(one_shot("second", "queued", 20)).await.unwrap();
    engine.start().await.unwrap();

    sleep(Duration::from_millis(600)).await;
    engine.shutdown(true).await.unwrap();

    // the second run waited for the single slot, which does not count as run time
    let mut waits = waits.lock().unwrap().clone();
    waits.sort();
    assert_eq!(waits.len(), 2);
    assert!(waits[0] < ChronoDuration::milliseconds(100));
    assert!(waits[1] >= ChronoDuration::milliseconds(150));
}

#[tokio::test]
async fn test_graceful_shutdown_is_bounded_by_timeout() {
    let finished = Arc::new(AtomicUsize::new(0));
    let engine = SchedulerEngine::new(SchedulerConfig {
        shutdown_timeout: Some(Duration::from_millis(200)),
        ..SchedulerConfig::default()
    });
    engine
        .schedule_job(
            slow_job(
                "stuck",
                Duration::from_secs(5),
                Arc::new(AtomicUsize::new(0)),
                Arc::new(AtomicUsize::new(0)),
                finished.clone(),
            ),
            one_shot("stuck", "stuck", 20),
        )
        .await
        .unwrap();
    engine.start().await.unwrap();
    sleep(Duration::from_millis(150)).await;
    assert_eq!(engine.running_job_count().await, 1);

    let began = Instant::now();
    engine.shutdown(true).await.unwrap();
    let waited = began.elapsed();

    assert!(waited >= Duration::from_millis(200));
    assert!(waited < Duration::from_secs(1));
    assert_eq!(finished.load(Ordering::SeqCst), 0);
    assert_eq!(engine.status().await, SchedulerStatus::Shutdown);
}

#[tokio::test]
async fn test_earlier_registration_wakes_sleeping_loop() {
    let fires = Arc::new(Mutex::new(Vec::new()));
    let engine = engine();
    engine
        .schedule_job(
            recording_job("wake", fires.clone()),
            one_shot("later", "wake", 3_600_000),
        )
        .await
        .unwrap();
    engine.start().await.unwrap();

    // the loop is now asleep until the hour-away trigger
    sleep(Duration::from_millis(50)).await;
    engine.add_trigger(one_shot("soon", "wake", 100)).await.unwrap();
    sleep(Duration::from_millis(300)).await;

    let fires = fires.lock().unwrap().clone();
    assert_eq!(fires.len(), 1);
    assert_eq!(fires[0].trigger_key, TriggerKey::with_default_group("soon"));
    assert_eq!(
        engine
            .trigger_state(&TriggerKey::with_default_group("later"))
            .await,
        Some(TriggerState::Waiting)
    );

    engine.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn test_immediate_shutdown_does_not_wait() {
    let finished = Arc::new(AtomicUsize::new(0));
    let engine = engine();
    engine
        .schedule_job(
            slow_job(
                "slow",
                Duration::from_millis(800),
                Arc::new(AtomicUsize::new(0)),
                Arc::new(AtomicUsize::new(0)),
                finished.clone(),
            ),
            one_shot("slow", "slow", 20),
        )
        .await
        .unwrap();
    engine.start().await.unwrap();
    sleep(Duration::from_millis(150)).await;

    let began = Instant::now();
    engine.shutdown(false).await.unwrap();

    assert!(began.elapsed() < Duration::from_millis(500));
    assert_eq!(finished.load(Ordering::SeqCst), 0);
    assert!(matches!(
        engine.add_trigger(one_shot("late", "slow", 100)).await,
        Err(SchedulerError::Shutdown)
    ));
}

#[tokio::test]
async fn test_misfire_skip_policy_after_standby() {
    let fires = Arc::new(Mutex::new(Vec::new()));
    let listener = Arc::new(RecordingListener::default());
    let engine = engine();
    engine.add_job_listener(listener.clone()).await;

    let trigger = one_shot("missed", "missed", 50)
        .with_misfire_threshold(Duration::from_millis(50))
        .with_misfire_policy(MisfirePolicy::Skip);
    let key = trigger.key.clone();
    engine
        .add_job(recording_job("missed", fires.clone()).durable(true), false)
        .await
        .unwrap();
    engine.add_trigger(trigger).await.unwrap();

    // still in standby while the fire time passes
    sleep(Duration::from_millis(300)).await;
    engine.start().await.unwrap();
    sleep(Duration::from_millis(150)).await;

    assert!(fires.lock().unwrap().is_empty());
    let misfires = listener.misfires.lock().unwrap().clone();
    assert_eq!(misfires.len(), 1);
    assert!(misfires[0].late_by > Duration::from_millis(50));
    assert_eq!(engine.trigger_state(&key).await, Some(TriggerState::Complete));

    engine.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn test_misfire_fire_once_now_after_standby() {
    let fires = Arc::new(Mutex::new(Vec::new()));
    let engine = SchedulerEngine::new(SchedulerConfig {
        misfire_threshold: Duration::from_millis(50),
        ..SchedulerConfig::default()
    });
    let trigger = TriggerDefinition::new(
        TriggerKey::with_default_group("catch-up"),
        JobKey::with_default_group("catch-up"),
        Schedule::Interval {
            start: Utc::now(),
            every: Duration::from_millis(300),
            repeat: RepeatCount::Forever,
        },
    );
    engine
        .schedule_job(recording_job("catch-up", fires.clone()), trigger)
        .await
        .unwrap();

    // two periods pass in standby
    sleep(Duration::from_millis(700)).await;
    engine.start().await.unwrap();
    sleep(Duration::from_millis(30)).await;
    engine.standby().await.unwrap();

    let fires = fires.lock().unwrap().clone();
    assert_eq!(fires.len(), 1);
    assert!(fires[0].misfired);
    assert!(fires[0].next_fire_time.unwrap() > fires[0].actual_fire_time);

    engine.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn test_manual_trigger_and_lifecycle_events() {
    let fires = Arc::new(Mutex::new(Vec::new()));
    let lifecycle = Arc::new(LifecycleListener::default());
    let engine = engine();
    engine.add_scheduler_listener(lifecycle.clone()).await;
    engine
        .add_job(recording_job("manual", fires.clone()).durable(true), false)
        .await
        .unwrap();
    engine.start().await.unwrap();

    let key = engine
        .trigger_job(&JobKey::with_default_group("manual"), None)
        .await
        .unwrap();
    sleep(Duration::from_millis(200)).await;

    assert_eq!(fires.lock().unwrap().len(), 1);
    assert_eq!(fires.lock().unwrap()[0].trigger_key, key);
    assert!(engine.get_trigger(&key).await.is_none());
    assert!(engine
        .get_job(&JobKey::with_default_group("manual"))
        .await
        .is_some());

    engine.shutdown(true).await.unwrap();
    let events = lifecycle.events.lock().unwrap().clone();
    assert_eq!(events.first().map(String::as_str), Some("started"));
    assert!(events.contains(&format!("finalized {}", key)));
    assert_eq!(events.last().map(String::as_str), Some("shutdown"));
}

#[tokio::test]
async fn test_removed_scheduler_listener_is_not_notified() {
    let lifecycle = Arc::new(LifecycleListener::default());
    let engine = engine();
    engine.add_scheduler_listener(lifecycle.clone()).await;

    assert!(engine.remove_scheduler_listener("lifecycle").await);
    assert!(!engine.remove_scheduler_listener("lifecycle").await);

    engine.start().await.unwrap();
    engine.shutdown(true).await.unwrap();
    assert!(lifecycle.events.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_job_file_round_trip_through_engine() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(
        file,
        r#"
[[jobs]]
name = "heartbeat"
group = "OPS"
kind = "record"

[jobs.data]
message = "alive"

[[triggers]]
name = "fast"
group = "OPS"
job = "heartbeat"

[triggers.schedule]
type = "interval"
every_ms = 100
repeat = 1
"#
    )
    .unwrap();

    let fires = Arc::new(Mutex::new(Vec::new()));
    let seen = fires.clone();
    let factory = common::loader::JobFactory::new().with_kind(
        "record",
        job_fn(move |ctx| {
            let seen = seen.clone();
            async move {
                assert_eq!(ctx.get_str("message"), Some("alive"));
                seen.lock().unwrap().push(ctx.fire.clone());
                Ok(())
            }
        }),
    );

    let engine = engine();
    let summary = common::loader::load_jobs(&engine, file.path(), &factory, chrono_tz::UTC)
        .await
        .unwrap();
    assert_eq!(summary.jobs, 1);
    assert_eq!(summary.triggers, 1);

    engine.start().await.unwrap();
    sleep(Duration::from_millis(350)).await;
    engine.shutdown(true).await.unwrap();

    assert_eq!(fires.lock().unwrap().len(), 2);
}
