use crate::cron::CronExpression;
use crate::job::Job;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Group used when a job or trigger key is created without one
pub const DEFAULT_GROUP: &str = "DEFAULT";

/// Group of the one-shot triggers created by `trigger_job`
pub const MANUAL_TRIGGER_GROUP: &str = "MANUAL_TRIGGER";

/// Trigger priority used when none is given. Higher fires first on ties.
pub const DEFAULT_PRIORITY: i32 = 5;

/// Free-form data attached to jobs and triggers and handed to each execution
pub type JobDataMap = HashMap<String, serde_json::Value>;

// Helper functions for Tz serialization
fn serialize_tz<S>(tz: &Tz, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(tz.name())
}

fn deserialize_tz<'de, D>(deserializer: D) -> Result<Tz, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Tz::from_str(&s).map_err(serde::de::Error::custom)
}

// ============================================================================
// Keys
// ============================================================================

/// Identifies a job definition. Ordered by group, then name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub group: String,
    pub name: String,
}

impl JobKey {
    pub fn new(name: impl Into<String>, group: Option<&str>) -> Self {
        Self {
            group: group.unwrap_or(DEFAULT_GROUP).to_string(),
            name: name.into(),
        }
    }

    pub fn with_default_group(name: impl Into<String>) -> Self {
        Self::new(name, None)
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

/// Identifies a trigger definition. Ordered by group, then name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TriggerKey {
    pub group: String,
    pub name: String,
}

impl TriggerKey {
    pub fn new(name: impl Into<String>, group: Option<&str>) -> Self {
        Self {
            group: group.unwrap_or(DEFAULT_GROUP).to_string(),
            name: name.into(),
        }
    }

    pub fn with_default_group(name: impl Into<String>) -> Self {
        Self::new(name, None)
    }
}

impl fmt::Display for TriggerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

// ============================================================================
// Job Models
// ============================================================================

/// JobDefinition binds a key to the executable invoked on every fire
#[derive(Clone)]
pub struct JobDefinition {
    pub key: JobKey,
    pub description: Option<String>,
    pub job: Arc<dyn Job>,
    pub data: JobDataMap,
    /// Durable jobs stay registered when their last trigger is removed
    pub durable: bool,
    /// When false, two fires of this job never run at the same time
    pub allow_concurrent_execution: bool,
}

impl JobDefinition {
    pub fn new(key: JobKey, job: Arc<dyn Job>) -> Self {
        Self {
            key,
            description: None,
            job,
            data: JobDataMap::new(),
            durable: false,
            allow_concurrent_execution: true,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_data(mut self, data: JobDataMap) -> Self {
        self.data = data;
        self
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn allow_concurrent_execution(mut self, allow: bool) -> Self {
        self.allow_concurrent_execution = allow;
        self
    }
}

impl fmt::Debug for JobDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDefinition")
            .field("key", &self.key)
            .field("description", &self.description)
            .field("data", &self.data)
            .field("durable", &self.durable)
            .field("allow_concurrent_execution", &self.allow_concurrent_execution)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Trigger Models
// ============================================================================

/// How many times an interval schedule repeats after its first fire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepeatCount {
    Times(u32),
    Forever,
}

/// Schedule defines when a trigger fires
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    OneShot {
        at: DateTime<Utc>,
    },
    Interval {
        start: DateTime<Utc>,
        every: Duration,
        repeat: RepeatCount,
    },
    Cron {
        expression: CronExpression,
        #[serde(serialize_with = "serialize_tz", deserialize_with = "deserialize_tz")]
        timezone: Tz,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start: Option<DateTime<Utc>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        end: Option<DateTime<Utc>>,
    },
}

impl Schedule {
    /// Parse a cron expression into an unbounded cron schedule
    pub fn cron(expression: &str, timezone: Tz) -> Result<Self, crate::errors::ScheduleError> {
        Ok(Schedule::Cron {
            expression: expression.parse()?,
            timezone,
            start: None,
            end: None,
        })
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Schedule::OneShot { .. } => "one_shot",
            Schedule::Interval { .. } => "interval",
            Schedule::Cron { .. } => "cron",
        }
    }
}

/// Trigger lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerState {
    /// Queued for its next fire time
    Waiting,
    /// Removed from the due set until resumed
    Paused,
    /// Due, but its job disallows concurrent execution and is running
    Blocked,
    /// Schedule exhausted
    Complete,
    /// Unrecoverable, e.g. its job disappeared
    Error,
}

impl fmt::Display for TriggerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerState::Waiting => write!(f, "waiting"),
            TriggerState::Paused => write!(f, "paused"),
            TriggerState::Blocked => write!(f, "blocked"),
            TriggerState::Complete => write!(f, "complete"),
            TriggerState::Error => write!(f, "error"),
        }
    }
}

/// What the loop does with a fire time missed by more than the threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MisfirePolicy {
    /// Fire once immediately, then compute the next fire time from now
    #[default]
    FireOnceNow,
    /// Drop the missed fire and compute the next fire time from now
    Skip,
}

impl MisfirePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MisfirePolicy::FireOnceNow => "fire_once_now",
            MisfirePolicy::Skip => "skip",
        }
    }
}

impl FromStr for MisfirePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fire_once_now" => Ok(MisfirePolicy::FireOnceNow),
            "skip" => Ok(MisfirePolicy::Skip),
            _ => Err(format!("Invalid misfire policy: {}", s)),
        }
    }
}

/// TriggerDefinition binds a schedule to a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerDefinition {
    pub key: TriggerKey,
    pub job_key: JobKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub schedule: Schedule,
    pub priority: i32,
    /// Falls back to the scheduler-wide threshold when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub misfire_threshold: Option<Duration>,
    /// Falls back to the scheduler-wide policy when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub misfire_policy: Option<MisfirePolicy>,
    /// Merged over the job's data for each fire
    #[serde(default)]
    pub data: JobDataMap,
    pub state: TriggerState,
    pub next_fire_time: Option<DateTime<Utc>>,
    pub previous_fire_time: Option<DateTime<Utc>>,
    pub times_triggered: u64,
}

impl TriggerDefinition {
    pub fn new(key: TriggerKey, job_key: JobKey, schedule: Schedule) -> Self {
        Self {
            key,
            job_key,
            description: None,
            schedule,
            priority: DEFAULT_PRIORITY,
            misfire_threshold: None,
            misfire_policy: None,
            data: JobDataMap::new(),
            state: TriggerState::Waiting,
            next_fire_time: None,
            previous_fire_time: None,
            times_triggered: 0,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_misfire_threshold(mut self, threshold: Duration) -> Self {
        self.misfire_threshold = Some(threshold);
        self
    }

    pub fn with_misfire_policy(mut self, policy: MisfirePolicy) -> Self {
        self.misfire_policy = Some(policy);
        self
    }

    pub fn with_data(mut self, data: JobDataMap) -> Self {
        self.data = data;
        self
    }
}

// ============================================================================
// Execution Models
// ============================================================================

/// A single fire of a trigger, produced by the loop and consumed by the dispatcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FireEvent {
    pub fire_instance_id: Uuid,
    pub trigger_key: TriggerKey,
    pub job_key: JobKey,
    pub scheduled_fire_time: DateTime<Utc>,
    pub actual_fire_time: DateTime<Utc>,
    pub previous_fire_time: Option<DateTime<Utc>>,
    pub next_fire_time: Option<DateTime<Utc>>,
    pub misfired: bool,
}

/// How a dispatched fire ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded,
    Failed(String),
    Vetoed,
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobOutcome::Succeeded => write!(f, "succeeded"),
            JobOutcome::Failed(reason) => write!(f, "failed: {}", reason),
            JobOutcome::Vetoed => write!(f, "vetoed"),
        }
    }
}

/// Entry of the scheduler's bounded execution history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub fire: FireEvent,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: JobOutcome,
}

impl ExecutionRecord {
    pub fn run_time(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}
