//! In-memory job store.
//!
//! The whole registry lives behind one coarse async mutex, which makes every
//! operation trivially atomic. Handles created with [`share`] see the same
//! registry under their own instance identity, so clustered behavior
//! (acquire races, fail-over recovery) is exercisable in a single process.
//!
//! [`share`]: MemoryJobStore::share

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::calendar::Calendar;
#[cfg_attr(not(test), allow(unused_imports))]
use crate::clock::{Clock, SharedClock, SystemClock};
use crate::error::{Result, SchedulerError};
use crate::job::{JobDefinition, JobKey};
use crate::schedule::{MisfireInstruction, Schedule, SimpleSchedule};
use crate::trigger::{Trigger, TriggerKey, TriggerState};

use super::{
    acquisition_order, resume_covers, CompletedExecutionInstruction, FiredState, FiredTrigger,
    GroupMatcher, JobStore, MisfireSweep, RecoveryReport, SchedulerStateRecord, StoreContext,
    TriggerFiredBundle, TriggerFiredResult, RECOVERY_ORIGINAL_FIRE_TIME,
    RECOVERY_ORIGINAL_SCHEDULED_FIRE_TIME, RECOVERY_ORIGINAL_TRIGGER_GROUP,
    RECOVERY_ORIGINAL_TRIGGER_NAME, RECOVERY_TRIGGER_GROUP,
};

struct TriggerRecord {
    trigger: Trigger,
    state: TriggerState,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobKey, JobDefinition>,
    triggers: HashMap<TriggerKey, TriggerRecord>,
    calendars: HashMap<String, Calendar>,
    fired: HashMap<Uuid, FiredTrigger>,
    paused_trigger_groups: Vec<GroupMatcher>,
    paused_job_groups: Vec<GroupMatcher>,
    states: HashMap<String, SchedulerStateRecord>,
    recovery_seq: u64,
}

/// Coarse-mutex in-memory implementation of the [`JobStore`] contract.
pub struct MemoryJobStore {
    inner: Arc<Mutex<Inner>>,
    clock: SharedClock,
    ctx: StdMutex<Option<StoreContext>>,
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemoryJobStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            clock,
            ctx: StdMutex::new(None),
        }
    }

    /// A second handle onto the same registry, to be initialized under its
    /// own instance id. Models several cluster peers sharing one store.
    pub fn share(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            clock: Arc::clone(&self.clock),
            ctx: StdMutex::new(None),
        }
    }

    fn ctx(&self) -> Result<StoreContext> {
        self.ctx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| SchedulerError::Operation("job store is not initialized".into()))
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

// ---------------------------------------------------------------------------
// Locked helpers. Each public operation takes the mutex once and works on
// `Inner` through these, so a failing step never leaves partial writes.
// ---------------------------------------------------------------------------

fn initial_trigger_state(inner: &Inner, trigger: &Trigger) -> TriggerState {
    let group_paused = inner
        .paused_trigger_groups
        .iter()
        .any(|m| m.matches(&trigger.key.group))
        || inner
            .paused_job_groups
            .iter()
            .any(|m| m.matches(&trigger.job_key.group));

    let blocked = inner
        .jobs
        .get(&trigger.job_key)
        .is_some_and(|j| j.concurrent_execution_disallowed)
        && job_is_executing(inner, &trigger.job_key);

    match (group_paused, blocked) {
        (true, true) => TriggerState::PausedBlocked,
        (true, false) => TriggerState::Paused,
        (false, true) => TriggerState::Blocked,
        (false, false) => TriggerState::Waiting,
    }
}

fn job_is_executing(inner: &Inner, job: &JobKey) -> bool {
    inner
        .fired
        .values()
        .any(|f| f.state == FiredState::Executing && f.job_key.as_ref() == Some(job))
}

fn store_trigger_locked(inner: &mut Inner, trigger: Trigger, replace: bool) -> Result<()> {
    if !inner.jobs.contains_key(&trigger.job_key) {
        return Err(SchedulerError::JobNotFound {
            key: trigger.job_key.clone(),
        });
    }
    if inner.triggers.contains_key(&trigger.key) {
        if !replace {
            return Err(SchedulerError::TriggerAlreadyExists {
                key: trigger.key.clone(),
            });
        }
        if let Some(existing) = inner.triggers.get_mut(&trigger.key) {
            existing.trigger = trigger;
        }
        return Ok(());
    }
    let state = initial_trigger_state(inner, &trigger);
    inner
        .triggers
        .insert(trigger.key.clone(), TriggerRecord { trigger, state });
    Ok(())
}

/// Remove a trigger; when `clean_up_job` is set and its job is non-durable
/// with no remaining triggers, the job goes too. Returns the deleted job key
/// when that cleanup happened.
fn remove_trigger_locked(
    inner: &mut Inner,
    key: &TriggerKey,
    clean_up_job: bool,
) -> (bool, Option<JobKey>) {
    let Some(record) = inner.triggers.remove(key) else {
        return (false, None);
    };
    inner
        .fired
        .retain(|_, f| f.trigger_key != *key || f.state != FiredState::Acquired);

    if !clean_up_job {
        return (true, None);
    }
    let job_key = record.trigger.job_key;
    let references_left = inner
        .triggers
        .values()
        .any(|r| r.trigger.job_key == job_key);
    let durable = inner.jobs.get(&job_key).is_some_and(|j| j.durable);
    if !references_left && !durable && inner.jobs.remove(&job_key).is_some() {
        return (true, Some(job_key));
    }
    (true, None)
}

fn release_blocked_peers_locked(inner: &mut Inner, job: &JobKey) {
    let keys: Vec<TriggerKey> = inner
        .triggers
        .iter()
        .filter(|(_, r)| r.trigger.job_key == *job && r.state.is_blocked())
        .map(|(k, _)| k.clone())
        .collect();
    for key in keys {
        if let Some(record) = inner.triggers.get_mut(&key) {
            record.state = match record.state {
                TriggerState::Blocked => TriggerState::Waiting,
                TriggerState::PausedBlocked => TriggerState::Paused,
                other => other,
            };
        }
    }
}

fn block_peers_locked(inner: &mut Inner, job: &JobKey, firing: &TriggerKey) {
    let keys: Vec<TriggerKey> = inner
        .triggers
        .iter()
        .filter(|(k, r)| r.trigger.job_key == *job && *k != firing)
        .map(|(k, _)| k.clone())
        .collect();
    for key in keys {
        if let Some(record) = inner.triggers.get_mut(&key) {
            record.state = match record.state {
                TriggerState::Waiting | TriggerState::Acquired => TriggerState::Blocked,
                TriggerState::Paused => TriggerState::PausedBlocked,
                other => other,
            };
        }
    }
}

fn pause_trigger_locked(inner: &mut Inner, key: &TriggerKey) {
    if let Some(record) = inner.triggers.get_mut(key) {
        record.state = match record.state {
            TriggerState::Waiting | TriggerState::Acquired => TriggerState::Paused,
            TriggerState::Blocked => TriggerState::PausedBlocked,
            other => other,
        };
    }
}

fn resume_trigger_locked(
    inner: &mut Inner,
    key: &TriggerKey,
    now: DateTime<Utc>,
    misfire_threshold: Duration,
) -> Option<DateTime<Utc>> {
    let executing = {
        let Some(record) = inner.triggers.get(key) else {
            return None;
        };
        if !record.state.is_paused() {
            return None;
        }
        let non_concurrent = inner
            .jobs
            .get(&record.trigger.job_key)
            .is_some_and(|j| j.concurrent_execution_disallowed);
        non_concurrent && job_is_executing(inner, &record.trigger.job_key)
    };

    let calendar = inner
        .triggers
        .get(key)
        .and_then(|r| r.trigger.calendar_name.clone())
        .and_then(|name| inner.calendars.get(&name).cloned());

    let record = inner.triggers.get_mut(key)?;
    record.state = if executing {
        TriggerState::Blocked
    } else {
        TriggerState::Waiting
    };

    // A deadline that slipped while paused goes straight through misfire
    // handling instead of waiting for the next sweep.
    if record.state == TriggerState::Waiting
        && record.trigger.has_misfired(now, misfire_threshold)
    {
        if let Err(e) = record.trigger.update_after_misfire(now, calendar.as_ref()) {
            warn!(trigger = %key, error = %e, "misfire handling on resume failed");
            record.state = TriggerState::Error;
            return None;
        }
        if record.trigger.next_fire_time.is_none() {
            record.state = TriggerState::Complete;
            return None;
        }
    }
    record.trigger.next_fire_time
}

fn trigger_groups_matching(inner: &Inner, matcher: &GroupMatcher) -> Vec<String> {
    let mut groups: Vec<String> = inner
        .triggers
        .keys()
        .filter(|k| matcher.matches(&k.group))
        .map(|k| k.group.clone())
        .collect();
    groups.sort();
    groups.dedup();
    groups
}

fn remember_matcher(list: &mut Vec<GroupMatcher>, matcher: &GroupMatcher) {
    if !list.contains(matcher) {
        list.push(matcher.clone());
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn initialize(&self, ctx: StoreContext) -> Result<()> {
        *self.ctx.lock().unwrap_or_else(|e| e.into_inner()) = Some(ctx);
        Ok(())
    }

    async fn store_job(&self, job: JobDefinition, replace: bool) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.jobs.contains_key(&job.key) && !replace {
            return Err(SchedulerError::JobAlreadyExists {
                key: job.key.clone(),
            });
        }
        inner.jobs.insert(job.key.clone(), job);
        Ok(())
    }

    async fn store_trigger(&self, trigger: Trigger, replace: bool) -> Result<()> {
        let mut inner = self.inner.lock().await;
        store_trigger_locked(&mut inner, trigger, replace)
    }

    async fn store_job_and_trigger(
        &self,
        job: JobDefinition,
        trigger: Trigger,
        replace: bool,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.jobs.contains_key(&job.key) && !replace {
            return Err(SchedulerError::JobAlreadyExists {
                key: job.key.clone(),
            });
        }
        if inner.triggers.contains_key(&trigger.key) && !replace {
            return Err(SchedulerError::TriggerAlreadyExists {
                key: trigger.key.clone(),
            });
        }
        inner.jobs.insert(job.key.clone(), job);
        store_trigger_locked(&mut inner, trigger, replace)
    }

    async fn retrieve_job(&self, key: &JobKey) -> Result<Option<JobDefinition>> {
        let inner = self.inner.lock().await;
        Ok(inner.jobs.get(key).cloned())
    }

    async fn retrieve_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>> {
        let inner = self.inner.lock().await;
        Ok(inner.triggers.get(key).map(|r| r.trigger.clone()))
    }

    async fn remove_trigger(&self, key: &TriggerKey) -> Result<bool> {
        let ctx = self.ctx()?;
        let mut inner = self.inner.lock().await;
        let (removed, deleted_job) = remove_trigger_locked(&mut inner, key, true);
        if let Some(job) = deleted_job {
            ctx.signaler.notify_job_deleted(&job);
        }
        Ok(removed)
    }

    async fn remove_job(&self, key: &JobKey) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let trigger_keys: Vec<TriggerKey> = inner
            .triggers
            .iter()
            .filter(|(_, r)| r.trigger.job_key == *key)
            .map(|(k, _)| k.clone())
            .collect();
        for t in trigger_keys {
            remove_trigger_locked(&mut inner, &t, false);
        }
        Ok(inner.jobs.remove(key).is_some())
    }

    async fn replace_trigger(&self, key: &TriggerKey, new_trigger: Trigger) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let Some(existing) = inner.triggers.get(key) else {
            return Ok(false);
        };
        if existing.trigger.job_key != new_trigger.job_key {
            return Err(SchedulerError::InvalidTrigger {
                key: new_trigger.key.clone(),
                reason: "replacement trigger references a different job".into(),
            });
        }
        remove_trigger_locked(&mut inner, key, false);
        store_trigger_locked(&mut inner, new_trigger, false)?;
        Ok(true)
    }

    async fn trigger_state(&self, key: &TriggerKey) -> Result<TriggerState> {
        let inner = self.inner.lock().await;
        Ok(inner
            .triggers
            .get(key)
            .map_or(TriggerState::Deleted, |r| r.state))
    }

    async fn triggers_for_job(&self, key: &JobKey) -> Result<Vec<Trigger>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .triggers
            .values()
            .filter(|r| r.trigger.job_key == *key)
            .map(|r| r.trigger.clone())
            .collect())
    }

    async fn job_keys(&self, matcher: &GroupMatcher) -> Result<Vec<JobKey>> {
        let inner = self.inner.lock().await;
        let mut keys: Vec<JobKey> = inner
            .jobs
            .keys()
            .filter(|k| matcher.matches(&k.group))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn trigger_keys(&self, matcher: &GroupMatcher) -> Result<Vec<TriggerKey>> {
        let inner = self.inner.lock().await;
        let mut keys: Vec<TriggerKey> = inner
            .triggers
            .keys()
            .filter(|k| matcher.matches(&k.group))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn store_calendar(&self, name: &str, calendar: Calendar, replace: bool) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.calendars.contains_key(name) && !replace {
            return Err(SchedulerError::CalendarAlreadyExists {
                name: name.to_string(),
            });
        }
        inner.calendars.insert(name.to_string(), calendar);
        Ok(())
    }

    async fn retrieve_calendar(&self, name: &str) -> Result<Option<Calendar>> {
        let inner = self.inner.lock().await;
        Ok(inner.calendars.get(name).cloned())
    }

    async fn remove_calendar(&self, name: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let references = inner
            .triggers
            .values()
            .filter(|r| r.trigger.calendar_name.as_deref() == Some(name))
            .count();
        if references > 0 {
            return Err(SchedulerError::CalendarInUse {
                name: name.to_string(),
                count: references,
            });
        }
        Ok(inner.calendars.remove(name).is_some())
    }

    async fn acquire_next_triggers(
        &self,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: Duration,
    ) -> Result<Vec<Trigger>> {
        let ctx = self.ctx()?;
        let now = self.now();
        let mut inner = self.inner.lock().await;

        let deadline = no_later_than + time_window;
        let mut candidates: Vec<(TriggerKey, Trigger)> = inner
            .triggers
            .values()
            .filter(|r| {
                r.state == TriggerState::Waiting
                    && r.trigger
                        .next_fire_time
                        .is_some_and(|next| next <= deadline)
            })
            .map(|r| (r.trigger.key.clone(), r.trigger.clone()))
            .collect();
        candidates.sort_by(|a, b| acquisition_order(&a.1, &b.1));

        let mut acquired = Vec::new();
        let mut non_concurrent_jobs: HashSet<JobKey> = HashSet::new();
        for (key, trigger) in candidates {
            if acquired.len() == max_count {
                break;
            }
            let Some(job) = inner.jobs.get(&trigger.job_key) else {
                continue;
            };
            // One trigger per non-concurrent job per batch; the rest would
            // only be parked in Blocked at fire time.
            if job.concurrent_execution_disallowed
                && !non_concurrent_jobs.insert(job.key.clone())
            {
                continue;
            }
            let (non_concurrent, requests_recovery) =
                (job.concurrent_execution_disallowed, job.requests_recovery);

            let Some(record) = inner.triggers.get_mut(&key) else {
                continue;
            };
            let Some(scheduled_at) = record.trigger.next_fire_time else {
                continue;
            };
            record.state = TriggerState::Acquired;
            let priority = record.trigger.priority;
            let snapshot = record.trigger.clone();

            let entry_id = Uuid::new_v4();
            inner.fired.insert(
                entry_id,
                FiredTrigger {
                    entry_id,
                    trigger_key: key,
                    job_key: None,
                    instance_id: ctx.instance_id.clone(),
                    state: FiredState::Acquired,
                    fired_at: now,
                    scheduled_at,
                    priority,
                    non_concurrent,
                    requests_recovery,
                },
            );
            acquired.push(snapshot);
        }
        Ok(acquired)
    }

    async fn release_acquired_trigger(&self, trigger: &Trigger) -> Result<()> {
        let ctx = self.ctx()?;
        let mut inner = self.inner.lock().await;
        if let Some(record) = inner.triggers.get_mut(&trigger.key) {
            if record.state == TriggerState::Acquired {
                record.state = TriggerState::Waiting;
            }
        }
        inner.fired.retain(|_, f| {
            !(f.trigger_key == trigger.key
                && f.instance_id == ctx.instance_id
                && f.state == FiredState::Acquired)
        });
        Ok(())
    }

    async fn triggers_fired(&self, triggers: Vec<Trigger>) -> Result<Vec<TriggerFiredResult>> {
        let ctx = self.ctx()?;
        let now = self.now();
        let mut inner = self.inner.lock().await;
        let mut results = Vec::with_capacity(triggers.len());

        for fired in triggers {
            let key = fired.key.clone();

            let still_acquired = inner
                .triggers
                .get(&key)
                .is_some_and(|r| r.state == TriggerState::Acquired);
            let entry_id = inner
                .fired
                .values()
                .find(|f| {
                    f.trigger_key == key
                        && f.instance_id == ctx.instance_id
                        && f.state == FiredState::Acquired
                })
                .map(|f| f.entry_id);

            let (Some(entry_id), true) = (entry_id, still_acquired) else {
                inner.fired.retain(|_, f| {
                    !(f.trigger_key == key
                        && f.instance_id == ctx.instance_id
                        && f.state == FiredState::Acquired)
                });
                results.push(TriggerFiredResult::Removed { key });
                continue;
            };

            let job = inner
                .triggers
                .get(&key)
                .and_then(|r| inner.jobs.get(&r.trigger.job_key))
                .cloned();
            let Some(job) = job else {
                inner.fired.remove(&entry_id);
                results.push(TriggerFiredResult::Removed { key });
                continue;
            };
            let calendar = inner
                .triggers
                .get(&key)
                .and_then(|r| r.trigger.calendar_name.clone())
                .and_then(|name| inner.calendars.get(&name).cloned());

            let Some(record) = inner.triggers.get_mut(&key) else {
                inner.fired.remove(&entry_id);
                results.push(TriggerFiredResult::Removed { key });
                continue;
            };
            let previous_fire_time = record.trigger.previous_fire_time;
            let Some(scheduled_fire_time) = record.trigger.next_fire_time else {
                inner.fired.remove(&entry_id);
                results.push(TriggerFiredResult::Removed { key });
                continue;
            };

            if let Err(e) = record.trigger.triggered(calendar.as_ref()) {
                warn!(trigger = %key, error = %e, "schedule advance failed, parking trigger in error state");
                record.state = TriggerState::Error;
                inner.fired.remove(&entry_id);
                results.push(TriggerFiredResult::Removed { key });
                continue;
            }

            record.state = if record.trigger.next_fire_time.is_none() {
                TriggerState::Complete
            } else if job.concurrent_execution_disallowed {
                TriggerState::Blocked
            } else {
                TriggerState::Waiting
            };
            let trigger_snapshot = record.trigger.clone();
            let next_fire_time = record.trigger.next_fire_time;

            if job.concurrent_execution_disallowed {
                block_peers_locked(&mut inner, &job.key, &key);
            }

            if let Some(row) = inner.fired.get_mut(&entry_id) {
                row.state = FiredState::Executing;
                row.job_key = Some(job.key.clone());
                row.fired_at = now;
            }

            results.push(TriggerFiredResult::Fired(Box::new(TriggerFiredBundle {
                fire_id: entry_id,
                trigger: trigger_snapshot,
                job,
                calendar,
                fire_time: now,
                scheduled_fire_time,
                previous_fire_time,
                next_fire_time,
            })));
        }
        Ok(results)
    }

    async fn triggered_job_complete(
        &self,
        trigger: &Trigger,
        job: &JobDefinition,
        instruction: CompletedExecutionInstruction,
    ) -> Result<()> {
        let ctx = self.ctx()?;
        let mut inner = self.inner.lock().await;

        if job.persist_data_after_execution {
            if let Some(stored) = inner.jobs.get_mut(&job.key) {
                stored.data = job.data.clone();
            }
        }

        if instruction == CompletedExecutionInstruction::ReExecuteJob {
            // The fired row stays in Executing; the runner re-fires in place.
            return Ok(());
        }

        if job.concurrent_execution_disallowed {
            release_blocked_peers_locked(&mut inner, &job.key);
            ctx.signaler.signal_scheduling_change(None);
        }

        match instruction {
            CompletedExecutionInstruction::Noop
            | CompletedExecutionInstruction::ReExecuteJob => {}
            CompletedExecutionInstruction::SetTriggerComplete => {
                if let Some(record) = inner.triggers.get_mut(&trigger.key) {
                    record.state = TriggerState::Complete;
                }
                ctx.signaler.notify_finalized(&trigger.key);
            }
            CompletedExecutionInstruction::DeleteTrigger => {
                // Only delete if no fire remains on the stored version; a
                // reschedule that happened mid-execution wins.
                let gone_for_good = inner
                    .triggers
                    .get(&trigger.key)
                    .is_some_and(|r| r.trigger.next_fire_time.is_none());
                if gone_for_good {
                    let (_, deleted_job) = remove_trigger_locked(&mut inner, &trigger.key, true);
                    ctx.signaler.notify_finalized(&trigger.key);
                    if let Some(job_key) = deleted_job {
                        ctx.signaler.notify_job_deleted(&job_key);
                    }
                }
            }
            CompletedExecutionInstruction::SetAllJobTriggersComplete => {
                let keys: Vec<TriggerKey> = inner
                    .triggers
                    .iter()
                    .filter(|(_, r)| r.trigger.job_key == job.key)
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in keys {
                    if let Some(record) = inner.triggers.get_mut(&key) {
                        record.state = TriggerState::Complete;
                    }
                    ctx.signaler.notify_finalized(&key);
                }
            }
            CompletedExecutionInstruction::SetTriggerError => {
                if let Some(record) = inner.triggers.get_mut(&trigger.key) {
                    record.state = TriggerState::Error;
                }
            }
        }

        inner.fired.retain(|_, f| {
            !(f.trigger_key == trigger.key && f.instance_id == ctx.instance_id)
        });
        Ok(())
    }

    async fn get_misfired_triggers(
        &self,
        state: TriggerState,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TriggerKey>> {
        let inner = self.inner.lock().await;
        let mut candidates: Vec<&Trigger> = inner
            .triggers
            .values()
            .filter(|r| {
                r.state == state
                    && r.trigger.misfire_instruction != MisfireInstruction::IgnoreMisfire
                    && r.trigger.next_fire_time.is_some_and(|next| next < cutoff)
            })
            .map(|r| &r.trigger)
            .collect();
        candidates.sort_by(|a, b| acquisition_order(a, b));
        Ok(candidates
            .into_iter()
            .take(limit)
            .map(|t| t.key.clone())
            .collect())
    }

    async fn recover_misfires(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<MisfireSweep> {
        let ctx = self.ctx()?;
        let now = self.now();
        let mut inner = self.inner.lock().await;

        let mut candidates: Vec<(TriggerKey, Trigger)> = inner
            .triggers
            .values()
            .filter(|r| {
                r.state == TriggerState::Waiting
                    && r.trigger.misfire_instruction != MisfireInstruction::IgnoreMisfire
                    && r.trigger.next_fire_time.is_some_and(|next| next < cutoff)
            })
            .map(|r| (r.trigger.key.clone(), r.trigger.clone()))
            .collect();
        candidates.sort_by(|a, b| acquisition_order(&a.1, &b.1));

        let has_more = candidates.len() > limit;
        candidates.truncate(limit);

        let mut sweep = MisfireSweep {
            has_more,
            ..Default::default()
        };
        for (key, _) in candidates {
            let calendar = inner
                .triggers
                .get(&key)
                .and_then(|r| r.trigger.calendar_name.clone())
                .and_then(|name| inner.calendars.get(&name).cloned());
            let Some(record) = inner.triggers.get_mut(&key) else {
                continue;
            };
            ctx.signaler.notify_misfired(&key);
            if let Err(e) = record.trigger.update_after_misfire(now, calendar.as_ref()) {
                warn!(trigger = %key, error = %e, "misfire handling failed, parking trigger in error state");
                record.state = TriggerState::Error;
                continue;
            }
            match record.trigger.next_fire_time {
                None => {
                    record.state = TriggerState::Complete;
                    ctx.signaler.notify_finalized(&key);
                }
                Some(next) => {
                    sweep.earliest_new_time = Some(match sweep.earliest_new_time {
                        Some(t) if t <= next => t,
                        _ => next,
                    });
                }
            }
            sweep.processed += 1;
        }
        Ok(sweep)
    }

    async fn pause_trigger(&self, key: &TriggerKey) -> Result<()> {
        let mut inner = self.inner.lock().await;
        pause_trigger_locked(&mut inner, key);
        Ok(())
    }

    async fn pause_triggers(&self, matcher: &GroupMatcher) -> Result<Vec<String>> {
        let mut inner = self.inner.lock().await;
        remember_matcher(&mut inner.paused_trigger_groups, matcher);
        let groups = trigger_groups_matching(&inner, matcher);
        let keys: Vec<TriggerKey> = inner
            .triggers
            .keys()
            .filter(|k| matcher.matches(&k.group))
            .cloned()
            .collect();
        for key in keys {
            pause_trigger_locked(&mut inner, &key);
        }
        Ok(groups)
    }

    async fn pause_job(&self, key: &JobKey) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let keys: Vec<TriggerKey> = inner
            .triggers
            .iter()
            .filter(|(_, r)| r.trigger.job_key == *key)
            .map(|(k, _)| k.clone())
            .collect();
        for k in keys {
            pause_trigger_locked(&mut inner, &k);
        }
        Ok(())
    }

    async fn pause_jobs(&self, matcher: &GroupMatcher) -> Result<Vec<String>> {
        let mut inner = self.inner.lock().await;
        remember_matcher(&mut inner.paused_job_groups, matcher);
        let mut groups: Vec<String> = inner
            .jobs
            .keys()
            .filter(|k| matcher.matches(&k.group))
            .map(|k| k.group.clone())
            .collect();
        groups.sort();
        groups.dedup();
        let keys: Vec<TriggerKey> = inner
            .triggers
            .iter()
            .filter(|(_, r)| matcher.matches(&r.trigger.job_key.group))
            .map(|(k, _)| k.clone())
            .collect();
        for k in keys {
            pause_trigger_locked(&mut inner, &k);
        }
        Ok(groups)
    }

    async fn resume_trigger(&self, key: &TriggerKey) -> Result<()> {
        let ctx = self.ctx()?;
        let now = self.now();
        let mut inner = self.inner.lock().await;
        if let Some(next) = resume_trigger_locked(&mut inner, key, now, ctx.misfire_threshold) {
            ctx.signaler.signal_scheduling_change(Some(next));
        }
        Ok(())
    }

    async fn resume_triggers(&self, matcher: &GroupMatcher) -> Result<Vec<String>> {
        let ctx = self.ctx()?;
        let now = self.now();
        let mut inner = self.inner.lock().await;
        inner
            .paused_trigger_groups
            .retain(|stored| !resume_covers(stored, matcher));
        let groups = trigger_groups_matching(&inner, matcher);
        let keys: Vec<TriggerKey> = inner
            .triggers
            .keys()
            .filter(|k| matcher.matches(&k.group))
            .cloned()
            .collect();
        let mut earliest: Option<DateTime<Utc>> = None;
        for key in keys {
            if let Some(next) = resume_trigger_locked(&mut inner, &key, now, ctx.misfire_threshold)
            {
                earliest = Some(match earliest {
                    Some(t) if t <= next => t,
                    _ => next,
                });
            }
        }
        if earliest.is_some() {
            ctx.signaler.signal_scheduling_change(earliest);
        }
        Ok(groups)
    }

    async fn resume_job(&self, key: &JobKey) -> Result<()> {
        let ctx = self.ctx()?;
        let now = self.now();
        let mut inner = self.inner.lock().await;
        let keys: Vec<TriggerKey> = inner
            .triggers
            .iter()
            .filter(|(_, r)| r.trigger.job_key == *key)
            .map(|(k, _)| k.clone())
            .collect();
        for k in keys {
            resume_trigger_locked(&mut inner, &k, now, ctx.misfire_threshold);
        }
        ctx.signaler.signal_scheduling_change(None);
        Ok(())
    }

    async fn resume_jobs(&self, matcher: &GroupMatcher) -> Result<Vec<String>> {
        let ctx = self.ctx()?;
        let now = self.now();
        let mut inner = self.inner.lock().await;
        inner
            .paused_job_groups
            .retain(|stored| !resume_covers(stored, matcher));
        let mut groups: Vec<String> = inner
            .jobs
            .keys()
            .filter(|k| matcher.matches(&k.group))
            .map(|k| k.group.clone())
            .collect();
        groups.sort();
        groups.dedup();
        let keys: Vec<TriggerKey> = inner
            .triggers
            .iter()
            .filter(|(_, r)| matcher.matches(&r.trigger.job_key.group))
            .map(|(k, _)| k.clone())
            .collect();
        for k in keys {
            resume_trigger_locked(&mut inner, &k, now, ctx.misfire_threshold);
        }
        ctx.signaler.signal_scheduling_change(None);
        Ok(groups)
    }

    async fn pause_all(&self) -> Result<()> {
        self.pause_triggers(&GroupMatcher::Any).await?;
        Ok(())
    }

    async fn resume_all(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.paused_trigger_groups.clear();
        inner.paused_job_groups.clear();
        drop(inner);
        self.resume_triggers(&GroupMatcher::Any).await?;
        Ok(())
    }

    async fn paused_trigger_groups(&self) -> Result<Vec<GroupMatcher>> {
        let inner = self.inner.lock().await;
        Ok(inner.paused_trigger_groups.clone())
    }

    async fn check_in(&self, now: DateTime<Utc>) -> Result<()> {
        let ctx = self.ctx()?;
        let mut inner = self.inner.lock().await;
        inner.states.insert(
            ctx.instance_id.clone(),
            SchedulerStateRecord {
                instance_id: ctx.instance_id.clone(),
                last_check_in: now,
                check_in_interval_ms: ctx.check_in_interval.num_milliseconds(),
            },
        );
        Ok(())
    }

    async fn find_failed_instances(&self, now: DateTime<Utc>) -> Result<Vec<SchedulerStateRecord>> {
        let ctx = self.ctx()?;
        let inner = self.inner.lock().await;
        Ok(inner
            .states
            .values()
            .filter(|s| {
                s.instance_id != ctx.instance_id
                    && now - s.last_check_in
                        > Duration::milliseconds(s.check_in_interval_ms) + ctx.check_in_tolerance
            })
            .cloned()
            .collect())
    }

    async fn recover_jobs(&self, instance_id: &str) -> Result<RecoveryReport> {
        let ctx = self.ctx()?;
        let now = self.now();
        let mut inner = self.inner.lock().await;

        if inner.recovery_seq == 0 {
            inner.recovery_seq = now.timestamp_millis() as u64;
        }

        let rows: Vec<FiredTrigger> = inner
            .fired
            .values()
            .filter(|f| f.instance_id == instance_id)
            .cloned()
            .collect();

        let mut report = RecoveryReport::default();
        for row in &rows {
            if row.state == FiredState::Executing && row.requests_recovery {
                let job = row.job_key.as_ref().and_then(|k| inner.jobs.get(k)).cloned();
                if let Some(job) = job {
                    let seq = inner.recovery_seq;
                    inner.recovery_seq += 1;

                    let mut data = job.data.clone();
                    data.put(RECOVERY_ORIGINAL_TRIGGER_NAME, row.trigger_key.name.clone());
                    data.put(
                        RECOVERY_ORIGINAL_TRIGGER_GROUP,
                        row.trigger_key.group.clone(),
                    );
                    data.put(RECOVERY_ORIGINAL_FIRE_TIME, row.fired_at.to_rfc3339());
                    data.put(
                        RECOVERY_ORIGINAL_SCHEDULED_FIRE_TIME,
                        row.scheduled_at.to_rfc3339(),
                    );

                    let mut recovery = Trigger::builder()
                        .key(TriggerKey::new(
                            format!("recover_{instance_id}_{seq}"),
                            RECOVERY_TRIGGER_GROUP,
                        ))
                        .job_key(job.key.clone())
                        .priority(row.priority)
                        .start_time(row.scheduled_at)
                        .misfire_instruction(MisfireInstruction::IgnoreMisfire)
                        .schedule(Schedule::Simple(SimpleSchedule::once()))
                        .data(data)
                        .build();
                    recovery.next_fire_time = Some(row.scheduled_at);

                    store_trigger_locked(&mut inner, recovery, false)?;
                    report.recovery_triggers += 1;
                }
            }

            match row.state {
                FiredState::Acquired => {
                    if let Some(record) = inner.triggers.get_mut(&row.trigger_key) {
                        if record.state == TriggerState::Acquired {
                            record.state = TriggerState::Waiting;
                            report.released_triggers += 1;
                        }
                    }
                }
                FiredState::Executing => {
                    if row.non_concurrent {
                        if let Some(job_key) = row.job_key.clone() {
                            release_blocked_peers_locked(&mut inner, &job_key);
                        }
                    }
                    if let Some(record) = inner.triggers.get_mut(&row.trigger_key) {
                        if record.state.is_blocked() {
                            record.state = TriggerState::Waiting;
                        }
                    }
                    report.released_triggers += 1;
                }
            }
        }

        inner.fired.retain(|_, f| f.instance_id != instance_id);
        inner.states.remove(instance_id);

        if report.recovery_triggers > 0 || report.released_triggers > 0 {
            ctx.signaler.signal_scheduling_change(None);
        }
        Ok(report)
    }

    async fn fired_triggers(&self, instance_id: &str) -> Result<Vec<FiredTrigger>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .fired
            .values()
            .filter(|f| f.instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn clear_all_scheduling_data(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.jobs.clear();
        inner.triggers.clear();
        inner.calendars.clear();
        inner.fired.clear();
        inner.paused_trigger_groups.clear();
        inner.paused_job_groups.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::SchedulerSignal;
    use chrono::TimeZone;

    struct FixedClock(DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 3, 9, 0, 0).unwrap()
    }

    async fn store_at(now: DateTime<Utc>) -> MemoryJobStore {
        let store = MemoryJobStore::new(Arc::new(FixedClock(now)));
        store
            .initialize(StoreContext {
                instance_id: "node-test".into(),
                signaler: Arc::new(SchedulerSignal::new()),
                misfire_threshold: Duration::seconds(60),
                check_in_interval: Duration::seconds(15),
                check_in_tolerance: Duration::seconds(15),
            })
            .await
            .unwrap();
        store
    }

    fn sample_job(name: &str) -> JobDefinition {
        JobDefinition::builder()
            .key(JobKey::named(name))
            .job_type("sample")
            .build()
    }

    fn one_shot(name: &str, job: &str, fire_at: DateTime<Utc>) -> Trigger {
        let mut t = Trigger::builder()
            .key(TriggerKey::named(name))
            .job_key(JobKey::named(job))
            .start_time(fire_at)
            .schedule(Schedule::Simple(SimpleSchedule::once()))
            .build();
        t.next_fire_time = Some(fire_at);
        t
    }

    #[tokio::test]
    async fn stored_job_and_trigger_round_trip() {
        let store = store_at(base_time()).await;
        let job = sample_job("j");
        let trigger = one_shot("t", "j", base_time());
        store
            .store_job_and_trigger(job.clone(), trigger.clone(), false)
            .await
            .unwrap();

        assert_eq!(store.retrieve_job(&job.key).await.unwrap(), Some(job));
        assert_eq!(
            store.retrieve_trigger(&trigger.key).await.unwrap(),
            Some(trigger.clone())
        );
        assert_eq!(
            store.trigger_state(&trigger.key).await.unwrap(),
            TriggerState::Waiting
        );
    }

    #[tokio::test]
    async fn duplicate_without_replace_is_rejected() {
        let store = store_at(base_time()).await;
        store
            .store_job_and_trigger(sample_job("j"), one_shot("t", "j", base_time()), false)
            .await
            .unwrap();

        let err = store
            .store_job_and_trigger(sample_job("j"), one_shot("t", "j", base_time()), false)
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::JobAlreadyExists { .. }));
    }

    #[tokio::test]
    async fn acquire_moves_to_acquired_and_writes_fired_row() {
        let store = store_at(base_time()).await;
        store
            .store_job_and_trigger(sample_job("j"), one_shot("t", "j", base_time()), false)
            .await
            .unwrap();

        let acquired = store
            .acquire_next_triggers(base_time(), 10, Duration::zero())
            .await
            .unwrap();
        assert_eq!(acquired.len(), 1);
        assert_eq!(
            store.trigger_state(&acquired[0].key).await.unwrap(),
            TriggerState::Acquired
        );

        let fired = store.fired_triggers("node-test").await.unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].state, FiredState::Acquired);
        assert_eq!(fired[0].scheduled_at, base_time());
        assert!(fired[0].job_key.is_none());
    }

    #[tokio::test]
    async fn released_trigger_returns_to_waiting() {
        let store = store_at(base_time()).await;
        store
            .store_job_and_trigger(sample_job("j"), one_shot("t", "j", base_time()), false)
            .await
            .unwrap();
        let acquired = store
            .acquire_next_triggers(base_time(), 1, Duration::zero())
            .await
            .unwrap();

        store.release_acquired_trigger(&acquired[0]).await.unwrap();
        assert_eq!(
            store.trigger_state(&acquired[0].key).await.unwrap(),
            TriggerState::Waiting
        );
        assert!(store.fired_triggers("node-test").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn firing_one_shot_completes_it() {
        let store = store_at(base_time()).await;
        store
            .store_job_and_trigger(sample_job("j"), one_shot("t", "j", base_time()), false)
            .await
            .unwrap();
        let acquired = store
            .acquire_next_triggers(base_time(), 1, Duration::zero())
            .await
            .unwrap();

        let results = store.triggers_fired(acquired).await.unwrap();
        let TriggerFiredResult::Fired(bundle) = &results[0] else {
            panic!("expected a fired bundle");
        };
        assert_eq!(bundle.scheduled_fire_time, base_time());
        assert_eq!(bundle.next_fire_time, None);
        assert_eq!(
            store.trigger_state(&bundle.trigger.key).await.unwrap(),
            TriggerState::Complete
        );

        let fired = store.fired_triggers("node-test").await.unwrap();
        assert_eq!(fired[0].state, FiredState::Executing);
        assert_eq!(fired[0].job_key, Some(JobKey::named("j")));
    }

    #[tokio::test]
    async fn non_concurrent_job_blocks_peer_triggers() {
        let store = store_at(base_time()).await;
        let mut job = sample_job("j");
        job.concurrent_execution_disallowed = true;
        store.store_job(job, false).await.unwrap();
        let every = |name: &str| {
            let mut t = Trigger::builder()
                .key(TriggerKey::named(name))
                .job_key(JobKey::named("j"))
                .start_time(base_time())
                .schedule(Schedule::Simple(SimpleSchedule::every(
                    std::time::Duration::from_secs(1),
                )))
                .build();
            t.next_fire_time = Some(base_time());
            t
        };
        store.store_trigger(every("a"), false).await.unwrap();
        store.store_trigger(every("b"), false).await.unwrap();

        // Only one trigger of the job is acquired per batch.
        let acquired = store
            .acquire_next_triggers(base_time(), 10, Duration::zero())
            .await
            .unwrap();
        assert_eq!(acquired.len(), 1);

        let results = store.triggers_fired(acquired).await.unwrap();
        let TriggerFiredResult::Fired(bundle) = &results[0] else {
            panic!("expected a fired bundle");
        };

        let fired_key = bundle.trigger.key.clone();
        let peer = if fired_key.name == "a" { "b" } else { "a" };
        assert_eq!(
            store.trigger_state(&fired_key).await.unwrap(),
            TriggerState::Blocked
        );
        assert_eq!(
            store.trigger_state(&TriggerKey::named(peer)).await.unwrap(),
            TriggerState::Blocked
        );

        // Nothing further can be acquired while the job executes.
        assert!(store
            .acquire_next_triggers(base_time() + Duration::seconds(5), 10, Duration::zero())
            .await
            .unwrap()
            .is_empty());

        store
            .triggered_job_complete(
                &bundle.trigger,
                &bundle.job,
                CompletedExecutionInstruction::Noop,
            )
            .await
            .unwrap();
        assert_eq!(
            store.trigger_state(&fired_key).await.unwrap(),
            TriggerState::Waiting
        );
        assert_eq!(
            store.trigger_state(&TriggerKey::named(peer)).await.unwrap(),
            TriggerState::Waiting
        );
    }

    #[tokio::test]
    async fn delete_instruction_removes_spent_trigger_and_job() {
        let store = store_at(base_time()).await;
        store
            .store_job_and_trigger(sample_job("j"), one_shot("t", "j", base_time()), false)
            .await
            .unwrap();
        let acquired = store
            .acquire_next_triggers(base_time(), 1, Duration::zero())
            .await
            .unwrap();
        let results = store.triggers_fired(acquired).await.unwrap();
        let TriggerFiredResult::Fired(bundle) = &results[0] else {
            panic!("expected a fired bundle");
        };

        store
            .triggered_job_complete(
                &bundle.trigger,
                &bundle.job,
                CompletedExecutionInstruction::DeleteTrigger,
            )
            .await
            .unwrap();

        assert_eq!(
            store.trigger_state(&bundle.trigger.key).await.unwrap(),
            TriggerState::Deleted
        );
        // Non-durable job with no triggers left is deleted too.
        assert!(store.retrieve_job(&bundle.job.key).await.unwrap().is_none());
        assert!(store.fired_triggers("node-test").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn paused_group_matcher_covers_future_triggers() {
        let store = store_at(base_time()).await;
        store.store_job(sample_job("j"), false).await.unwrap();

        let paused = store
            .pause_triggers(&GroupMatcher::group_starts_with("g"))
            .await
            .unwrap();
        assert!(paused.is_empty());

        let mut trigger = one_shot("late", "j", base_time());
        trigger.key = TriggerKey::new("late", "gX");
        store.store_trigger(trigger.clone(), false).await.unwrap();

        assert_eq!(
            store.trigger_state(&trigger.key).await.unwrap(),
            TriggerState::Paused
        );
    }

    #[tokio::test]
    async fn misfire_sweep_promotes_stale_one_shot() {
        let now = base_time() + Duration::seconds(300);
        let store = store_at(now).await;
        store
            .store_job_and_trigger(sample_job("j"), one_shot("t", "j", base_time()), false)
            .await
            .unwrap();

        let sweep = store
            .recover_misfires(now - Duration::seconds(60), 20)
            .await
            .unwrap();
        assert_eq!(sweep.processed, 1);
        assert_eq!(sweep.earliest_new_time, Some(now));

        let trigger = store
            .retrieve_trigger(&TriggerKey::named("t"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(trigger.next_fire_time, Some(now));
    }

    #[tokio::test]
    async fn recovery_synthesizes_breadcrumbed_trigger() {
        let store = store_at(base_time()).await;
        let mut job = sample_job("j");
        job.requests_recovery = true;
        job.durable = true;
        store.store_job(job, false).await.unwrap();
        store
            .store_trigger(one_shot("t", "j", base_time()), false)
            .await
            .unwrap();

        let acquired = store
            .acquire_next_triggers(base_time(), 1, Duration::zero())
            .await
            .unwrap();
        store.triggers_fired(acquired).await.unwrap();

        // Another handle on the same registry plays the surviving node.
        let survivor = store.share();
        survivor
            .initialize(StoreContext {
                instance_id: "node-b".into(),
                signaler: Arc::new(SchedulerSignal::new()),
                misfire_threshold: Duration::seconds(60),
                check_in_interval: Duration::seconds(15),
                check_in_tolerance: Duration::seconds(15),
            })
            .await
            .unwrap();

        let report = survivor.recover_jobs("node-test").await.unwrap();
        assert_eq!(report.recovery_triggers, 1);
        assert!(survivor
            .fired_triggers("node-test")
            .await
            .unwrap()
            .is_empty());

        let recovered = survivor
            .trigger_keys(&GroupMatcher::group_equals(RECOVERY_TRIGGER_GROUP))
            .await
            .unwrap();
        assert_eq!(recovered.len(), 1);
        let trigger = survivor
            .retrieve_trigger(&recovered[0])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            trigger.data.get_str(RECOVERY_ORIGINAL_TRIGGER_NAME),
            Some("t")
        );
        assert_eq!(
            trigger.data.get_str(RECOVERY_ORIGINAL_TRIGGER_GROUP),
            Some("DEFAULT")
        );
        assert!(trigger.data.contains_key(RECOVERY_ORIGINAL_FIRE_TIME));
        assert!(trigger
            .data
            .contains_key(RECOVERY_ORIGINAL_SCHEDULED_FIRE_TIME));
        assert_eq!(trigger.start_time, base_time());
        assert_eq!(
            trigger.misfire_instruction,
            MisfireInstruction::IgnoreMisfire
        );
    }

    #[tokio::test]
    async fn clear_keeps_liveness_records() {
        let store = store_at(base_time()).await;
        store.check_in(base_time()).await.unwrap();
        store
            .store_job_and_trigger(sample_job("j"), one_shot("t", "j", base_time()), false)
            .await
            .unwrap();

        store.clear_all_scheduling_data().await.unwrap();
        assert!(store
            .trigger_keys(&GroupMatcher::Any)
            .await
            .unwrap()
            .is_empty());
        assert!(store.job_keys(&GroupMatcher::Any).await.unwrap().is_empty());

        // The liveness record survives a clear: a peer still sees this
        // instance and, much later, reports it failed.
        let peer = store.share();
        peer.initialize(StoreContext {
            instance_id: "node-b".into(),
            signaler: Arc::new(SchedulerSignal::new()),
            misfire_threshold: Duration::seconds(60),
            check_in_interval: Duration::seconds(15),
            check_in_tolerance: Duration::seconds(15),
        })
        .await
        .unwrap();
        let failed = peer
            .find_failed_instances(base_time() + Duration::seconds(3600))
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].instance_id, "node-test");
    }
}
