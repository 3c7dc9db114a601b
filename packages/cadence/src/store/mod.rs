//! The transactional job store contract.
//!
//! The store owns jobs, triggers, calendars, fired-trigger rows, paused-group
//! records, and per-instance liveness records. Every operation commits as a
//! whole or leaves state unchanged. The scheduler loop, misfire handler, and
//! cluster manager are all written against [`JobStore`]; any implementation
//! honoring the contract plugs in unchanged.
//!
//! Two implementations ship:
//! - [`MemoryJobStore`](memory::MemoryJobStore): one coarse async mutex
//! - [`PostgresJobStore`](postgres::PostgresJobStore): row locks on a two-row
//!   lock table, `TRIGGER_ACCESS` for scheduling writes and `STATE_ACCESS`
//!   for check-in; a single operation never takes both

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::calendar::Calendar;
use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::job::{JobDefinition, JobKey};
use crate::signal::SchedulerSignaler;
use crate::trigger::{Trigger, TriggerKey, TriggerState};

pub mod memory;
pub mod postgres;

/// Group that recovery triggers are created in after an instance failure.
pub const RECOVERY_TRIGGER_GROUP: &str = "RECOVERING_JOBS";

/// Group used for the synthetic one-shot triggers behind `trigger_job`.
pub const MANUAL_TRIGGER_GROUP: &str = "MANUAL_TRIGGERS";

/// Data-map keys a recovery trigger carries about the fire it replaces.
pub const RECOVERY_ORIGINAL_TRIGGER_NAME: &str = "recovery.original_trigger_name";
pub const RECOVERY_ORIGINAL_TRIGGER_GROUP: &str = "recovery.original_trigger_group";
pub const RECOVERY_ORIGINAL_FIRE_TIME: &str = "recovery.original_fire_time";
pub const RECOVERY_ORIGINAL_SCHEDULED_FIRE_TIME: &str = "recovery.original_scheduled_fire_time";

/// Selects trigger or job groups for the pause/resume and listing operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum GroupMatcher {
    Equals(String),
    Prefix(String),
    Any,
}

impl GroupMatcher {
    pub fn group_equals(group: impl Into<String>) -> Self {
        Self::Equals(group.into())
    }

    pub fn group_starts_with(prefix: impl Into<String>) -> Self {
        Self::Prefix(prefix.into())
    }

    pub fn matches(&self, group: &str) -> bool {
        match self {
            GroupMatcher::Equals(g) => group == g,
            GroupMatcher::Prefix(p) => group.starts_with(p.as_str()),
            GroupMatcher::Any => true,
        }
    }
}

/// State of a fired-trigger row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum FiredState {
    Acquired,
    Executing,
}

/// Durable record of an in-progress or just-acquired fire.
///
/// Written when a trigger is acquired, updated to `Executing` when fired,
/// deleted on completion. Its purpose is surviving a crash so another
/// instance can recover the work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FiredTrigger {
    pub entry_id: Uuid,
    pub trigger_key: TriggerKey,
    /// Bound when the trigger actually fires; `None` while merely acquired.
    pub job_key: Option<JobKey>,
    pub instance_id: String,
    pub state: FiredState,
    pub fired_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub priority: i32,
    pub non_concurrent: bool,
    pub requests_recovery: bool,
}

/// Per-instance liveness record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStateRecord {
    pub instance_id: String,
    pub last_check_in: DateTime<Utc>,
    pub check_in_interval_ms: i64,
}

/// Everything the runner needs to execute one fire.
#[derive(Debug, Clone)]
pub struct TriggerFiredBundle {
    pub fire_id: Uuid,
    /// Trigger with its schedule already advanced past this fire.
    pub trigger: Trigger,
    pub job: JobDefinition,
    pub calendar: Option<Calendar>,
    pub fire_time: DateTime<Utc>,
    pub scheduled_fire_time: DateTime<Utc>,
    /// The fire before this one, if any.
    pub previous_fire_time: Option<DateTime<Utc>>,
    pub next_fire_time: Option<DateTime<Utc>>,
}

/// Outcome of firing one acquired trigger.
#[derive(Debug, Clone)]
pub enum TriggerFiredResult {
    Fired(Box<TriggerFiredBundle>),
    /// The trigger was deleted underneath the acquisition.
    Removed { key: TriggerKey },
}

/// Directive applied by `triggered_job_complete` after an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletedExecutionInstruction {
    /// Nothing beyond deleting the fired row; the schedule already advanced
    /// at fire time.
    Noop,
    /// Keep the fired row; the runner re-executes the job immediately.
    ReExecuteJob,
    /// Complete the trigger that fired.
    SetTriggerComplete,
    /// Remove the trigger if it has no next fire remaining.
    DeleteTrigger,
    /// Complete every trigger referencing the job.
    SetAllJobTriggersComplete,
    /// Park the trigger in the error state.
    SetTriggerError,
}

/// Result of one misfire sweep.
#[derive(Debug, Clone, Default)]
pub struct MisfireSweep {
    pub processed: usize,
    /// Earliest recomputed fire time, for waking the scheduler loop.
    pub earliest_new_time: Option<DateTime<Utc>>,
    /// Whether the sweep hit its batch limit with misfires left over.
    pub has_more: bool,
}

/// Result of recovering one failed instance.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// Recovery triggers synthesized for jobs requesting recovery.
    pub recovery_triggers: usize,
    /// Triggers returned to a runnable state.
    pub released_triggers: usize,
}

/// Identity and policy handed to a store by the scheduler that owns it.
#[derive(Clone)]
pub struct StoreContext {
    pub instance_id: String,
    pub signaler: Arc<dyn SchedulerSignaler>,
    pub misfire_threshold: Duration,
    pub check_in_interval: Duration,
    pub check_in_tolerance: Duration,
}

impl StoreContext {
    pub fn for_config(config: &SchedulerConfig, signaler: Arc<dyn SchedulerSignaler>) -> Self {
        Self {
            instance_id: config.instance_id.clone(),
            signaler,
            misfire_threshold: Duration::milliseconds(config.misfire_threshold.as_millis() as i64),
            check_in_interval: Duration::milliseconds(config.check_in_interval.as_millis() as i64),
            check_in_tolerance: Duration::milliseconds(
                config.check_in_tolerance.as_millis() as i64
            ),
        }
    }
}

/// The transactional store contract.
///
/// Implementations must make each operation atomic: under concurrent callers
/// a trigger moves `Waiting -> Acquired` exactly once per due instant, and a
/// failed operation leaves no partial writes behind.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Bind this store handle to a scheduler instance. Called once by the
    /// scheduler before any other operation.
    async fn initialize(&self, ctx: StoreContext) -> Result<()>;

    // ------------------------------------------------------------------
    // Jobs, triggers, calendars
    // ------------------------------------------------------------------

    /// Upsert a job. Fails with `JobAlreadyExists` when `replace` is false
    /// and the key is taken.
    async fn store_job(&self, job: JobDefinition, replace: bool) -> Result<()>;

    /// Insert a trigger in `Waiting`, or `Paused` when its group (or its
    /// job's group) is remembered paused. Fails with `TriggerAlreadyExists`
    /// when `replace` is false and the key is taken.
    async fn store_trigger(&self, trigger: Trigger, replace: bool) -> Result<()>;

    /// Store job and trigger in one transaction.
    async fn store_job_and_trigger(
        &self,
        job: JobDefinition,
        trigger: Trigger,
        replace: bool,
    ) -> Result<()>;

    async fn retrieve_job(&self, key: &JobKey) -> Result<Option<JobDefinition>>;

    async fn retrieve_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>>;

    /// Remove the trigger; when its job is not durable and has no other
    /// triggers, the job goes too. Returns false when the trigger was absent.
    async fn remove_trigger(&self, key: &TriggerKey) -> Result<bool>;

    /// Remove the job and every trigger referencing it.
    async fn remove_job(&self, key: &JobKey) -> Result<bool>;

    /// Delete the old trigger and insert the new one (same job) in `Waiting`.
    /// Returns false when the old trigger was absent.
    async fn replace_trigger(&self, key: &TriggerKey, new_trigger: Trigger) -> Result<bool>;

    /// Current state; `Deleted` when the trigger does not exist.
    async fn trigger_state(&self, key: &TriggerKey) -> Result<TriggerState>;

    async fn triggers_for_job(&self, key: &JobKey) -> Result<Vec<Trigger>>;

    async fn job_keys(&self, matcher: &GroupMatcher) -> Result<Vec<JobKey>>;

    async fn trigger_keys(&self, matcher: &GroupMatcher) -> Result<Vec<TriggerKey>>;

    async fn store_calendar(&self, name: &str, calendar: Calendar, replace: bool) -> Result<()>;

    async fn retrieve_calendar(&self, name: &str) -> Result<Option<Calendar>>;

    /// Refuses (with `CalendarInUse`) while any trigger references the name.
    async fn remove_calendar(&self, name: &str) -> Result<bool>;

    // ------------------------------------------------------------------
    // Acquire, fire, complete
    // ------------------------------------------------------------------

    /// Claim up to `max_count` due triggers for this instance.
    ///
    /// Eligible: `Waiting` with `next_fire_time <= no_later_than +
    /// time_window`. Ordered by `(next_fire_time asc, priority desc, name
    /// asc)`. Each claim atomically moves the trigger to `Acquired` and
    /// writes a fired-trigger row; claims lost to a concurrent instance are
    /// silently skipped.
    async fn acquire_next_triggers(
        &self,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: Duration,
    ) -> Result<Vec<Trigger>>;

    /// Undo an acquisition: `Acquired -> Waiting`, fired row deleted.
    async fn release_acquired_trigger(&self, trigger: &Trigger) -> Result<()>;

    /// Fire the acquired triggers: advance each schedule, settle the trigger
    /// state (`Complete` / `Blocked` / `Waiting`), flip the fired row to
    /// `Executing`, and return the execution bundles.
    async fn triggers_fired(&self, triggers: Vec<Trigger>) -> Result<Vec<TriggerFiredResult>>;

    /// Finish one execution: apply the directive, persist the job data map
    /// when the job opted in, release blocked peers, delete the fired row.
    async fn triggered_job_complete(
        &self,
        trigger: &Trigger,
        job: &JobDefinition,
        instruction: CompletedExecutionInstruction,
    ) -> Result<()>;

    // ------------------------------------------------------------------
    // Misfires
    // ------------------------------------------------------------------

    /// Triggers in `state` whose deadline predates `cutoff`, excluding those
    /// with the ignore policy, in acquisition order.
    async fn get_misfired_triggers(
        &self,
        state: TriggerState,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TriggerKey>>;

    /// One transactional misfire sweep: reclassify up to `limit` misfired
    /// triggers per their policies, completing those with no fire left.
    async fn recover_misfires(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<MisfireSweep>;

    // ------------------------------------------------------------------
    // Pause / resume
    // ------------------------------------------------------------------

    async fn pause_trigger(&self, key: &TriggerKey) -> Result<()>;

    /// Pause matching trigger groups and remember the matcher so triggers
    /// added later into matching groups start `Paused`. Returns the group
    /// names that had triggers paused.
    async fn pause_triggers(&self, matcher: &GroupMatcher) -> Result<Vec<String>>;

    async fn pause_job(&self, key: &JobKey) -> Result<()>;

    async fn pause_jobs(&self, matcher: &GroupMatcher) -> Result<Vec<String>>;

    async fn resume_trigger(&self, key: &TriggerKey) -> Result<()>;

    async fn resume_triggers(&self, matcher: &GroupMatcher) -> Result<Vec<String>>;

    async fn resume_job(&self, key: &JobKey) -> Result<()>;

    async fn resume_jobs(&self, matcher: &GroupMatcher) -> Result<Vec<String>>;

    async fn pause_all(&self) -> Result<()>;

    async fn resume_all(&self) -> Result<()>;

    async fn paused_trigger_groups(&self) -> Result<Vec<GroupMatcher>>;

    // ------------------------------------------------------------------
    // Cluster
    // ------------------------------------------------------------------

    /// Record this instance's heartbeat.
    async fn check_in(&self, now: DateTime<Utc>) -> Result<()>;

    /// Peers whose `last_check_in` is older than their interval plus the
    /// tolerance. Never includes this instance.
    async fn find_failed_instances(&self, now: DateTime<Utc>) -> Result<Vec<SchedulerStateRecord>>;

    /// Recover a failed instance in one transaction: synthesize recovery
    /// triggers for executing fires of recoverable jobs, return the
    /// underlying triggers to a runnable state, drop the instance's fired
    /// rows and liveness record.
    async fn recover_jobs(&self, instance_id: &str) -> Result<RecoveryReport>;

    /// Fired rows currently bound to an instance.
    async fn fired_triggers(&self, instance_id: &str) -> Result<Vec<FiredTrigger>>;

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Delete all jobs, triggers, calendars, paused-group records, and fired
    /// rows. Liveness records survive.
    async fn clear_all_scheduling_data(&self) -> Result<()>;
}

/// Thread-safe store handle.
pub type SharedJobStore = Arc<dyn JobStore>;

/// Whether a resume with `resume` uncovers a remembered pause `stored`.
pub(crate) fn resume_covers(stored: &GroupMatcher, resume: &GroupMatcher) -> bool {
    match (stored, resume) {
        (_, GroupMatcher::Any) => true,
        (GroupMatcher::Equals(s), GroupMatcher::Equals(r)) => s == r,
        (GroupMatcher::Equals(s), GroupMatcher::Prefix(r)) => s.starts_with(r.as_str()),
        (GroupMatcher::Prefix(s), GroupMatcher::Prefix(r)) => s.starts_with(r.as_str()),
        _ => false,
    }
}

/// Acquisition order: `(next_fire_time asc, priority desc, name asc)`.
pub(crate) fn acquisition_order(a: &Trigger, b: &Trigger) -> std::cmp::Ordering {
    a.next_fire_time
        .cmp(&b.next_fire_time)
        .then_with(|| b.priority.cmp(&a.priority))
        .then_with(|| a.key.name.cmp(&b.key.name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::{Schedule, SimpleSchedule};
    use chrono::TimeZone;

    #[test]
    fn matcher_semantics() {
        assert!(GroupMatcher::group_equals("g").matches("g"));
        assert!(!GroupMatcher::group_equals("g").matches("gX"));
        assert!(GroupMatcher::group_starts_with("g").matches("gX"));
        assert!(!GroupMatcher::group_starts_with("g").matches("other"));
        assert!(GroupMatcher::Any.matches("anything"));
    }

    #[test]
    fn matcher_roundtrips_through_json() {
        let m = GroupMatcher::group_starts_with("batch-");
        let json = serde_json::to_string(&m).unwrap();
        assert_eq!(serde_json::from_str::<GroupMatcher>(&json).unwrap(), m);
    }

    #[test]
    fn acquisition_order_is_time_then_priority_then_name() {
        let base = Utc.with_ymd_and_hms(2024, 6, 3, 9, 0, 0).unwrap();
        let mk = |name: &str, next: DateTime<Utc>, priority: i32| {
            let mut t = Trigger::builder()
                .key(TriggerKey::named(name))
                .job_key(JobKey::named("j"))
                .start_time(base)
                .priority(priority)
                .schedule(Schedule::Simple(SimpleSchedule::once()))
                .build();
            t.next_fire_time = Some(next);
            t
        };

        let mut triggers = vec![
            mk("c", base + Duration::seconds(10), 5),
            mk("a", base, 5),
            mk("b", base, 9),
            mk("d", base, 9),
        ];
        triggers.sort_by(acquisition_order);

        let names: Vec<&str> = triggers.iter().map(|t| t.key.name.as_str()).collect();
        assert_eq!(names, vec!["b", "d", "a", "c"]);
    }
}
