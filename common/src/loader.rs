// Declarative job and trigger definitions loaded from a job file

use crate::errors::{LoaderError, ScheduleError};
use crate::job::Job;
use crate::models::{
    JobDataMap, JobDefinition, JobKey, MisfirePolicy, RepeatCount, Schedule, TriggerDefinition,
    TriggerKey, DEFAULT_PRIORITY,
};
use crate::schedule::parse_timezone;
use crate::scheduler::SchedulerEngine;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use config::{Config, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Maps the `kind` named in a job file to an executable job
#[derive(Clone, Default)]
pub struct JobFactory {
    kinds: HashMap<String, Arc<dyn Job>>,
}

impl JobFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: impl Into<String>, job: Arc<dyn Job>) {
        self.kinds.insert(kind.into(), job);
    }

    pub fn with_kind(mut self, kind: impl Into<String>, job: Arc<dyn Job>) -> Self {
        self.register(kind, job);
        self
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn Job>> {
        self.kinds.get(kind).cloned()
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.kinds.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

/// Top level of a job file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobsFile {
    #[serde(default)]
    pub jobs: Vec<JobSpec>,
    #[serde(default)]
    pub triggers: Vec<TriggerSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub group: Option<String>,
    pub kind: String,
    pub description: Option<String>,
    #[serde(default)]
    pub durable: bool,
    #[serde(default = "default_concurrent")]
    pub concurrent: bool,
    #[serde(default)]
    pub data: JobDataMap,
}

fn default_concurrent() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct TriggerSpec {
    pub name: String,
    pub group: Option<String>,
    pub job: String,
    pub job_group: Option<String>,
    pub description: Option<String>,
    pub priority: Option<i32>,
    pub misfire_policy: Option<MisfirePolicy>,
    pub misfire_threshold_ms: Option<u64>,
    #[serde(default)]
    pub data: JobDataMap,
    pub schedule: ScheduleSpec,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleSpec {
    OneShot {
        at: DateTime<Utc>,
    },
    Interval {
        every_ms: u64,
        /// Repeats after the first fire; forever when unset
        repeat: Option<u32>,
        start: Option<DateTime<Utc>>,
    },
    Cron {
        expression: String,
        timezone: Option<String>,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    },
}

impl ScheduleSpec {
    fn resolve(&self, default_tz: Tz, now: DateTime<Utc>) -> Result<Schedule, ScheduleError> {
        match self {
            ScheduleSpec::OneShot { at } => Ok(Schedule::OneShot { at: *at }),
            ScheduleSpec::Interval {
                every_ms,
                repeat,
                start,
            } => Ok(Schedule::Interval {
                start: start.unwrap_or(now),
                every: Duration::from_millis(*every_ms),
                repeat: repeat.map_or(RepeatCount::Forever, RepeatCount::Times),
            }),
            ScheduleSpec::Cron {
                expression,
                timezone,
                start,
                end,
            } => {
                let timezone = match timezone {
                    Some(name) => parse_timezone(name)?,
                    None => default_tz,
                };
                Ok(Schedule::Cron {
                    expression: expression.parse()?,
                    timezone,
                    start: *start,
                    end: *end,
                })
            }
        }
    }
}

/// What a job file added to the scheduler
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub jobs: usize,
    pub triggers: usize,
}

impl JobsFile {
    /// Read a job file. The format (TOML, JSON, YAML) follows the file extension.
    pub fn load(path: &Path) -> Result<Self, LoaderError> {
        let config = Config::builder().add_source(File::from(path)).build()?;
        Ok(config.try_deserialize()?)
    }

    /// Turn the file's entries into definitions. Fails on the first entry
    /// with an unknown kind or an invalid schedule.
    pub fn resolve(
        &self,
        factory: &JobFactory,
        default_tz: Tz,
        now: DateTime<Utc>,
    ) -> Result<(Vec<JobDefinition>, Vec<TriggerDefinition>), LoaderError> {
        let jobs = self
            .jobs
            .iter()
            .map(|spec| {
                let key = JobKey::new(&spec.name, spec.group.as_deref());
                let job = factory
                    .get(&spec.kind)
                    .ok_or_else(|| LoaderError::UnknownJobKind {
                        job: key.clone(),
                        kind: spec.kind.clone(),
                    })?;

                let mut definition = JobDefinition::new(key, job)
                    .with_data(spec.data.clone())
                    .durable(spec.durable)
                    .allow_concurrent_execution(spec.concurrent);
                if let Some(description) = &spec.description {
                    definition = definition.with_description(description);
                }
                Ok(definition)
            })
            .collect::<Result<Vec<_>, LoaderError>>()?;

        let triggers = self
            .triggers
            .iter()
            .map(|spec| {
                let key = TriggerKey::new(&spec.name, spec.group.as_deref());
                let schedule = spec.schedule.resolve(default_tz, now).map_err(|source| {
                    LoaderError::InvalidSchedule {
                        trigger: key.clone(),
                        source,
                    }
                })?;

                let job_group = spec.job_group.as_deref().or(spec.group.as_deref());
                let mut trigger =
                    TriggerDefinition::new(key, JobKey::new(&spec.job, job_group), schedule)
                        .with_priority(spec.priority.unwrap_or(DEFAULT_PRIORITY))
                        .with_data(spec.data.clone());
                if let Some(description) = &spec.description {
                    trigger = trigger.with_description(description);
                }
                if let Some(policy) = spec.misfire_policy {
                    trigger = trigger.with_misfire_policy(policy);
                }
                if let Some(threshold) = spec.misfire_threshold_ms {
                    trigger = trigger.with_misfire_threshold(Duration::from_millis(threshold));
                }
                Ok(trigger)
            })
            .collect::<Result<Vec<_>, LoaderError>>()?;

        Ok((jobs, triggers))
    }
}

/// Register resolved definitions: jobs first, then the triggers that reference them
pub async fn apply(
    engine: &SchedulerEngine,
    jobs: Vec<JobDefinition>,
    triggers: Vec<TriggerDefinition>,
) -> Result<LoadSummary, LoaderError> {
    let mut summary = LoadSummary::default();

    for job in jobs {
        let unscheduled = !job.durable && !triggers.iter().any(|t| t.job_key == job.key);
        if unscheduled {
            warn!(job = %job.key, "Non-durable job has no trigger in the job file");
        }
        engine.add_job(job, false).await?;
        summary.jobs += 1;
    }

    for trigger in triggers {
        engine.add_trigger(trigger).await?;
        summary.triggers += 1;
    }

    Ok(summary)
}

/// Load a job file and register its contents with the engine
#[instrument(skip(engine, factory), fields(path = %path.display()))]
pub async fn load_jobs(
    engine: &SchedulerEngine,
    path: &Path,
    factory: &JobFactory,
    default_tz: Tz,
) -> Result<LoadSummary, LoaderError> {
    let file = JobsFile::load(path)?;
    let (jobs, triggers) = file.resolve(factory, default_tz, Utc::now())?;
    let summary = apply(engine, jobs, triggers).await?;

    info!(
        jobs = summary.jobs,
        triggers = summary.triggers,
        "Job file loaded"
    );
    Ok(summary)
}
