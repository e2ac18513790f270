// In-memory job registry and trigger store with the due-trigger queue
//
// Invariant: a trigger is queued in `due` exactly when its state is
// `Waiting` and it has a next fire time. Every mutation of a trigger goes
// through `sync_queue` to keep this true.

use crate::errors::SchedulerError;
use crate::models::{
    JobDataMap, JobDefinition, JobKey, TriggerDefinition, TriggerKey, TriggerState,
    MANUAL_TRIGGER_GROUP,
};
use crate::schedule::ScheduleTrigger;
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};

/// Queue entry: earliest fire time first, then higher priority, then key
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct DueEntry {
    fire_time: DateTime<Utc>,
    priority: Reverse<i32>,
    key: TriggerKey,
}

/// RAM-backed store for job and trigger definitions
#[derive(Debug, Default)]
pub struct RamJobStore {
    jobs: HashMap<JobKey, JobDefinition>,
    triggers: HashMap<TriggerKey, TriggerDefinition>,
    triggers_by_job: HashMap<JobKey, BTreeSet<TriggerKey>>,
    due: BTreeSet<DueEntry>,
    queued: HashMap<TriggerKey, DueEntry>,
}

impl RamJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    /// Store a job. Fails with `DuplicateJob` when the key exists and `replace` is false.
    /// A replaced job keeps its triggers.
    pub fn add_job(&mut self, job: JobDefinition, replace: bool) -> Result<(), SchedulerError> {
        if !replace && self.jobs.contains_key(&job.key) {
            return Err(SchedulerError::DuplicateJob(job.key));
        }
        self.jobs.insert(job.key.clone(), job);
        Ok(())
    }

    /// Validate and store a trigger, returning its first fire time.
    /// The store is unchanged when this fails.
    pub fn add_trigger(
        &mut self,
        trigger: TriggerDefinition,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, SchedulerError> {
        let (trigger, first) = self.prepare_trigger(trigger, now, None)?;
        self.insert_trigger(trigger);
        Ok(first)
    }

    /// Store a job together with its first trigger, or neither
    pub fn schedule_job(
        &mut self,
        job: JobDefinition,
        trigger: TriggerDefinition,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, SchedulerError> {
        if self.jobs.contains_key(&job.key) {
            return Err(SchedulerError::DuplicateJob(job.key));
        }

        let job_key = job.key.clone();
        self.jobs.insert(job_key.clone(), job);
        match self.prepare_trigger(trigger, now, None) {
            Ok((trigger, first)) => {
                self.insert_trigger(trigger);
                Ok(first)
            }
            Err(e) => {
                self.jobs.remove(&job_key);
                Err(e)
            }
        }
    }

    /// Replace the trigger stored under `key` with `replacement`, returning
    /// the replacement's first fire time.
    pub fn reschedule_trigger(
        &mut self,
        key: &TriggerKey,
        replacement: TriggerDefinition,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, SchedulerError> {
        let old_job = self
            .triggers
            .get(key)
            .map(|trigger| trigger.job_key.clone())
            .ok_or_else(|| SchedulerError::TriggerNotFound(key.clone()))?;

        let (replacement, first) = self.prepare_trigger(replacement, now, Some(key))?;
        self.detach_trigger(key);
        self.insert_trigger(replacement);
        self.cleanup_orphaned_job(&old_job);
        Ok(first)
    }

    /// Remove a trigger. A non-durable job left without triggers is removed too.
    pub fn remove_trigger(&mut self, key: &TriggerKey) -> Option<TriggerDefinition> {
        let trigger = self.detach_trigger(key)?;
        self.cleanup_orphaned_job(&trigger.job_key);
        Some(trigger)
    }

    /// Remove a job. With `cascade` its triggers go too; without it a job that
    /// still has triggers is refused. Returns the removed trigger keys, or
    /// `None` when the job did not exist.
    pub fn remove_job(
        &mut self,
        key: &JobKey,
        cascade: bool,
    ) -> Result<Option<Vec<TriggerKey>>, SchedulerError> {
        if !self.jobs.contains_key(key) {
            return Ok(None);
        }

        let trigger_keys: Vec<TriggerKey> = self
            .triggers_by_job
            .get(key)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();

        if !trigger_keys.is_empty() && !cascade {
            return Err(SchedulerError::JobInUse {
                job: key.clone(),
                triggers: trigger_keys.len(),
            });
        }

        for trigger_key in &trigger_keys {
            self.detach_trigger(trigger_key);
        }
        self.triggers_by_job.remove(key);
        self.jobs.remove(key);
        Ok(Some(trigger_keys))
    }

    pub fn update_job_data(&mut self, key: &JobKey, data: JobDataMap) -> Result<(), SchedulerError> {
        let job = self
            .jobs
            .get_mut(key)
            .ok_or_else(|| SchedulerError::JobNotFound(key.clone()))?;
        job.data = data;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Pause / resume
    // ------------------------------------------------------------------------

    /// Pause a waiting or blocked trigger. Returns whether its state changed.
    pub fn pause_trigger(&mut self, key: &TriggerKey) -> Result<bool, SchedulerError> {
        let trigger = self
            .triggers
            .get_mut(key)
            .ok_or_else(|| SchedulerError::TriggerNotFound(key.clone()))?;

        if !matches!(trigger.state, TriggerState::Waiting | TriggerState::Blocked) {
            return Ok(false);
        }
        trigger.state = TriggerState::Paused;
        self.sync_queue(key);
        Ok(true)
    }

    /// Put a paused trigger back in the queue with its stored next fire time
    pub fn resume_trigger(&mut self, key: &TriggerKey) -> Result<bool, SchedulerError> {
        let trigger = self
            .triggers
            .get_mut(key)
            .ok_or_else(|| SchedulerError::TriggerNotFound(key.clone()))?;

        if trigger.state != TriggerState::Paused {
            return Ok(false);
        }
        trigger.state = TriggerState::Waiting;
        self.sync_queue(key);
        Ok(true)
    }

    /// Pause every trigger of a job, returning the keys that changed state
    pub fn pause_job(&mut self, key: &JobKey) -> Result<Vec<TriggerKey>, SchedulerError> {
        let mut paused = Vec::new();
        for trigger_key in self.job_trigger_keys(key)? {
            if self.pause_trigger(&trigger_key)? {
                paused.push(trigger_key);
            }
        }
        Ok(paused)
    }

    pub fn resume_job(&mut self, key: &JobKey) -> Result<Vec<TriggerKey>, SchedulerError> {
        let mut resumed = Vec::new();
        for trigger_key in self.job_trigger_keys(key)? {
            if self.resume_trigger(&trigger_key)? {
                resumed.push(trigger_key);
            }
        }
        Ok(resumed)
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn get_job(&self, key: &JobKey) -> Option<JobDefinition> {
        self.jobs.get(key).cloned()
    }

    pub fn get_trigger(&self, key: &TriggerKey) -> Option<TriggerDefinition> {
        self.triggers.get(key).cloned()
    }

    pub fn trigger_state(&self, key: &TriggerKey) -> Option<TriggerState> {
        self.triggers.get(key).map(|trigger| trigger.state)
    }

    /// Job keys, optionally restricted to one group, sorted
    pub fn list_jobs(&self, group: Option<&str>) -> Vec<JobKey> {
        let mut keys: Vec<JobKey> = self
            .jobs
            .keys()
            .filter(|key| group.map_or(true, |group| key.group == group))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn list_triggers(&self, group: Option<&str>) -> Vec<TriggerKey> {
        let mut keys: Vec<TriggerKey> = self
            .triggers
            .keys()
            .filter(|key| group.map_or(true, |group| key.group == group))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn job_group_names(&self) -> Vec<String> {
        let groups: BTreeSet<String> = self.jobs.keys().map(|key| key.group.clone()).collect();
        groups.into_iter().collect()
    }

    pub fn trigger_group_names(&self) -> Vec<String> {
        let groups: BTreeSet<String> = self
            .triggers
            .keys()
            .map(|key| key.group.clone())
            .collect();
        groups.into_iter().collect()
    }

    /// Triggers of a job in key order; empty for an unknown job
    pub fn get_triggers_for_job(&self, key: &JobKey) -> Vec<TriggerDefinition> {
        self.triggers_by_job
            .get(key)
            .map(|keys| {
                keys.iter()
                    .filter_map(|trigger_key| self.triggers.get(trigger_key).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    pub fn trigger_count(&self) -> usize {
        self.triggers.len()
    }

    /// Number of triggers queued for a future fire
    pub fn waiting_count(&self) -> usize {
        self.due.len()
    }

    // ------------------------------------------------------------------------
    // Scheduler loop support
    // ------------------------------------------------------------------------

    /// Earliest queued trigger and its fire time
    pub(crate) fn peek_due(&self) -> Option<(DateTime<Utc>, TriggerKey)> {
        self.due
            .first()
            .map(|entry| (entry.fire_time, entry.key.clone()))
    }

    /// Record a fire: bump counters, store the next fire time, complete the
    /// trigger when there is none. Manual triggers are discarded once complete.
    pub(crate) fn trigger_fired(
        &mut self,
        key: &TriggerKey,
        fired_at: DateTime<Utc>,
        next_fire_time: Option<DateTime<Utc>>,
    ) -> Option<TriggerDefinition> {
        let trigger = self.triggers.get_mut(key)?;
        trigger.previous_fire_time = Some(fired_at);
        trigger.times_triggered += 1;
        trigger.next_fire_time = next_fire_time;
        if next_fire_time.is_none() {
            trigger.state = TriggerState::Complete;
        }
        let snapshot = trigger.clone();
        self.sync_queue(key);

        if snapshot.state == TriggerState::Complete && key.group == MANUAL_TRIGGER_GROUP {
            self.detach_trigger(key);
        }
        Some(snapshot)
    }

    /// Move a trigger to a new next fire time without firing it
    pub(crate) fn skip_to(
        &mut self,
        key: &TriggerKey,
        next_fire_time: Option<DateTime<Utc>>,
    ) -> Option<TriggerDefinition> {
        let trigger = self.triggers.get_mut(key)?;
        trigger.next_fire_time = next_fire_time;
        if next_fire_time.is_none() {
            trigger.state = TriggerState::Complete;
        }
        let snapshot = trigger.clone();
        self.sync_queue(key);
        Some(snapshot)
    }

    pub(crate) fn set_state(&mut self, key: &TriggerKey, state: TriggerState) {
        if let Some(trigger) = self.triggers.get_mut(key) {
            trigger.state = state;
            self.sync_queue(key);
        }
    }

    /// Return the blocked triggers of a job to the queue
    pub(crate) fn unblock_triggers(&mut self, job: &JobKey) -> Vec<TriggerKey> {
        let blocked: Vec<TriggerKey> = self
            .get_triggers_for_job(job)
            .into_iter()
            .filter(|trigger| trigger.state == TriggerState::Blocked)
            .map(|trigger| trigger.key)
            .collect();

        for key in &blocked {
            self.set_state(key, TriggerState::Waiting);
        }
        blocked
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    /// Validate a trigger against the store and compute its first fire time.
    /// `replacing` names a trigger that is about to be removed, so its key
    /// does not count as a collision.
    fn prepare_trigger(
        &self,
        mut trigger: TriggerDefinition,
        now: DateTime<Utc>,
        replacing: Option<&TriggerKey>,
    ) -> Result<(TriggerDefinition, DateTime<Utc>), SchedulerError> {
        trigger.schedule.validate()?;

        if !self.jobs.contains_key(&trigger.job_key) {
            return Err(SchedulerError::UnknownJob {
                trigger: trigger.key,
                job: trigger.job_key,
            });
        }

        if replacing != Some(&trigger.key) && self.triggers.contains_key(&trigger.key) {
            return Err(SchedulerError::DuplicateTrigger(trigger.key));
        }

        let first = trigger
            .schedule
            .first_fire_time(now)
            .ok_or_else(|| SchedulerError::TriggerWillNeverFire(trigger.key.clone()))?;

        trigger.state = TriggerState::Waiting;
        trigger.next_fire_time = Some(first);
        trigger.previous_fire_time = None;
        trigger.times_triggered = 0;
        Ok((trigger, first))
    }

    fn insert_trigger(&mut self, trigger: TriggerDefinition) {
        let key = trigger.key.clone();
        self.triggers_by_job
            .entry(trigger.job_key.clone())
            .or_default()
            .insert(key.clone());
        self.triggers.insert(key.clone(), trigger);
        self.sync_queue(&key);
    }

    /// Remove a trigger from every index without touching its job
    fn detach_trigger(&mut self, key: &TriggerKey) -> Option<TriggerDefinition> {
        let trigger = self.triggers.remove(key)?;
        if let Some(entry) = self.queued.remove(key) {
            self.due.remove(&entry);
        }
        if let Some(keys) = self.triggers_by_job.get_mut(&trigger.job_key) {
            keys.remove(key);
            if keys.is_empty() {
                self.triggers_by_job.remove(&trigger.job_key);
            }
        }
        Some(trigger)
    }

    fn cleanup_orphaned_job(&mut self, job: &JobKey) {
        let orphaned = !self.triggers_by_job.contains_key(job);
        if orphaned && self.jobs.get(job).is_some_and(|job| !job.durable) {
            self.jobs.remove(job);
        }
    }

    fn job_trigger_keys(&self, key: &JobKey) -> Result<Vec<TriggerKey>, SchedulerError> {
        if !self.jobs.contains_key(key) {
            return Err(SchedulerError::JobNotFound(key.clone()));
        }
        Ok(self
            .triggers_by_job
            .get(key)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn sync_queue(&mut self, key: &TriggerKey) {
        if let Some(entry) = self.queued.remove(key) {
            self.due.remove(&entry);
        }

        let Some(trigger) = self.triggers.get(key) else {
            return;
        };
        if trigger.state != TriggerState::Waiting {
            return;
        }
        if let Some(fire_time) = trigger.next_fire_time {
            let entry = DueEntry {
                fire_time,
                priority: Reverse(trigger.priority),
                key: key.clone(),
            };
            self.due.insert(entry.clone());
            self.queued.insert(key.clone(), entry);
        }
    }
}
