//! Trigger model and state machine.
//!
//! A trigger binds a schedule to exactly one job. The store owns trigger
//! state; the enum here encodes which transitions a store is permitted to
//! perform. `Deleted` is never persisted, it is the terminal answer for a
//! trigger that no longer exists.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::calendar::Calendar;
use crate::error::{Result, SchedulerError};
use crate::job::{JobDataMap, JobKey, DEFAULT_GROUP};
use crate::schedule::{MisfireInstruction, Schedule};

/// Default trigger priority; larger fires earlier on equal fire times.
pub const DEFAULT_PRIORITY: i32 = 5;

/// Identity of a trigger: `(name, group)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TriggerKey {
    pub name: String,
    pub group: String,
}

impl TriggerKey {
    pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
        }
    }

    /// Key in the default group.
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, DEFAULT_GROUP)
    }
}

impl fmt::Display for TriggerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

/// Persistable states of a trigger plus the `Deleted` terminal signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum TriggerState {
    Waiting,
    Acquired,
    Executing,
    Complete,
    Paused,
    Blocked,
    PausedBlocked,
    Error,
    /// Returned when the trigger no longer exists; never written to a store.
    Deleted,
}

impl TriggerState {
    /// Whether a store may move a trigger from `self` to `to`.
    ///
    /// Peers of a non-concurrent job are parked from `Waiting`/`Acquired` into
    /// `Blocked` (and `Paused` into `PausedBlocked`) while the job executes,
    /// so those edges are legal alongside the scheduling pipeline itself.
    pub fn can_transition_to(self, to: TriggerState) -> bool {
        use TriggerState::*;
        matches!(
            (self, to),
            (Waiting, Acquired)
                | (Waiting, Paused)
                | (Waiting, Complete)
                | (Waiting, Blocked)
                | (Acquired, Executing)
                | (Acquired, Waiting)
                | (Acquired, Paused)
                | (Acquired, Blocked)
                | (Executing, Waiting)
                | (Executing, Blocked)
                | (Executing, Complete)
                | (Executing, Error)
                | (Blocked, Waiting)
                | (Blocked, PausedBlocked)
                | (Paused, Waiting)
                | (Paused, PausedBlocked)
                | (PausedBlocked, Blocked)
                | (PausedBlocked, Paused)
                | (_, Deleted)
        )
    }

    pub fn is_paused(self) -> bool {
        matches!(self, TriggerState::Paused | TriggerState::PausedBlocked)
    }

    pub fn is_blocked(self) -> bool {
        matches!(self, TriggerState::Blocked | TriggerState::PausedBlocked)
    }
}

/// A schedule attached to a job.
///
/// Invariant: `start_time <= next_fire_time <= end_time` whenever all three
/// are defined. A trigger whose `next_fire_time` is `None` is complete or in
/// error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Trigger {
    pub key: TriggerKey,
    pub job_key: JobKey,

    #[builder(default, setter(strip_option))]
    pub description: Option<String>,

    /// Name of the calendar whose excluded instants are skipped.
    #[builder(default, setter(strip_option))]
    pub calendar_name: Option<String>,

    #[builder(default = DEFAULT_PRIORITY)]
    pub priority: i32,

    pub start_time: DateTime<Utc>,

    #[builder(default, setter(strip_option))]
    pub end_time: Option<DateTime<Utc>>,

    #[builder(default)]
    pub previous_fire_time: Option<DateTime<Utc>>,

    #[builder(default)]
    pub next_fire_time: Option<DateTime<Utc>>,

    #[builder(default)]
    pub misfire_instruction: MisfireInstruction,

    pub schedule: Schedule,

    /// Entries here override the job's data map at firing time.
    #[builder(default)]
    pub data: JobDataMap,
}

impl Trigger {
    /// Validate identity, schedule, bounds, and misfire-code compatibility.
    pub fn validate(&self) -> Result<()> {
        if self.key.name.is_empty() || self.key.group.is_empty() {
            return Err(self.invalid("trigger name and group must be non-empty"));
        }
        if self.job_key.name.is_empty() || self.job_key.group.is_empty() {
            return Err(self.invalid("job name and group must be non-empty"));
        }
        if let Some(end) = self.end_time {
            if end < self.start_time {
                return Err(self.invalid("end time precedes start time"));
            }
        }
        if !instruction_fits_schedule(self.misfire_instruction, &self.schedule) {
            return Err(self.invalid(&format!(
                "misfire instruction {:?} does not apply to this schedule type",
                self.misfire_instruction
            )));
        }
        self.schedule.validate()
    }

    fn invalid(&self, reason: &str) -> SchedulerError {
        SchedulerError::InvalidTrigger {
            key: self.key.clone(),
            reason: reason.to_string(),
        }
    }

    /// Compute and set the first fire time. Returns `None` when the schedule
    /// will never fire (e.g. fully calendar-excluded window).
    pub fn compute_first_fire_time(
        &mut self,
        calendar: Option<&Calendar>,
    ) -> Result<Option<DateTime<Utc>>> {
        self.next_fire_time = self
            .schedule
            .first_fire_time(self.start_time, self.end_time, calendar)?;
        Ok(self.next_fire_time)
    }

    /// Advance the schedule for one fire: the due time becomes
    /// `previous_fire_time` and the next computed time (skipping
    /// calendar-excluded instants) becomes `next_fire_time`.
    pub fn triggered(&mut self, calendar: Option<&Calendar>) -> Result<()> {
        let fired_at = self.next_fire_time;
        self.previous_fire_time = fired_at;
        self.schedule.record_fire();
        self.next_fire_time = match fired_at {
            Some(t) => self
                .schedule
                .next_fire_after(t, self.start_time, self.end_time, calendar)?,
            None => None,
        };
        Ok(())
    }

    /// Whether another fire remains.
    pub fn may_fire_again(&self) -> bool {
        self.next_fire_time.is_some()
    }

    /// Whether the trigger's deadline has slipped past the threshold.
    pub fn has_misfired(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        match self.next_fire_time {
            Some(next) => next + threshold < now,
            None => false,
        }
    }

    /// Apply the trigger's misfire policy at `now`, recomputing
    /// `next_fire_time`. `Smart` resolves to a schedule-type-specific code
    /// first; `IgnoreMisfire` leaves the stale time in place.
    pub fn update_after_misfire(
        &mut self,
        now: DateTime<Utc>,
        calendar: Option<&Calendar>,
    ) -> Result<()> {
        use MisfireInstruction::*;

        let mut instruction = match self.misfire_instruction {
            Smart => self.schedule.resolve_smart_policy(),
            other => other,
        };
        // FireNow only makes sense for a one-shot; a repeating schedule keeps
        // its counts and reschedules from now instead.
        if instruction == FireNow && !is_one_shot(&self.schedule) {
            instruction = RescheduleNowWithExistingCount;
        }

        match instruction {
            Smart => unreachable!("smart policy resolved above"),
            IgnoreMisfire => Ok(()),
            FireNow | FireOnceNow => {
                self.next_fire_time = Some(now);
                Ok(())
            }
            DoNothing => {
                self.next_fire_time =
                    self.schedule
                        .next_fire_after(now, self.start_time, self.end_time, calendar)?;
                Ok(())
            }
            RescheduleNextWithExistingCount => {
                self.next_fire_time =
                    self.schedule
                        .next_fire_after(now, self.start_time, self.end_time, calendar)?;
                Ok(())
            }
            RescheduleNextWithRemainingCount => {
                let new_fire =
                    self.schedule
                        .next_fire_after(now, self.start_time, self.end_time, calendar)?;
                if let (Some(new_fire), Some(missed_from)) = (new_fire, self.next_fire_time) {
                    let missed = occurrences_between(&self.schedule, missed_from, new_fire);
                    if let Schedule::Simple(s) = &mut self.schedule {
                        s.times_triggered = s.times_triggered.saturating_add(missed);
                    }
                }
                self.next_fire_time = new_fire;
                Ok(())
            }
            RescheduleNowWithExistingCount => {
                self.reschedule_from_now(now, 0);
                Ok(())
            }
            RescheduleNowWithRemainingCount => {
                let missed = self
                    .next_fire_time
                    .map(|from| occurrences_between(&self.schedule, from, now))
                    .unwrap_or(0);
                self.reschedule_from_now(now, missed);
                Ok(())
            }
        }
    }

    /// Re-anchor a simple schedule at `now`, folding fires already taken (and
    /// optionally missed ones) into a reduced repeat count.
    fn reschedule_from_now(&mut self, now: DateTime<Utc>, missed: u32) {
        if let Schedule::Simple(s) = &mut self.schedule {
            if let crate::schedule::Repeat::Times(count) = s.repeat {
                if count != 0 {
                    let taken = s.times_triggered.saturating_add(missed);
                    s.repeat = crate::schedule::Repeat::Times(count.saturating_sub(taken));
                    s.times_triggered = 0;
                }
            }
        }
        if self.end_time.is_some_and(|end| end < now) {
            self.next_fire_time = None;
        } else {
            self.start_time = now;
            self.next_fire_time = Some(now);
        }
    }
}

fn is_one_shot(schedule: &Schedule) -> bool {
    matches!(
        schedule,
        Schedule::Simple(s) if s.repeat == crate::schedule::Repeat::Times(0)
    )
}

/// Number of schedule occurrences in `(from, until]` for a simple schedule.
fn occurrences_between(schedule: &Schedule, from: DateTime<Utc>, until: DateTime<Utc>) -> u32 {
    match schedule {
        Schedule::Simple(s) if s.interval_ms > 0 && until > from => {
            ((until - from).num_milliseconds() / s.interval_ms) as u32
        }
        _ => 0,
    }
}

fn instruction_fits_schedule(instruction: MisfireInstruction, schedule: &Schedule) -> bool {
    use MisfireInstruction::*;
    match instruction {
        Smart | IgnoreMisfire => true,
        FireNow
        | RescheduleNowWithExistingCount
        | RescheduleNowWithRemainingCount
        | RescheduleNextWithExistingCount
        | RescheduleNextWithRemainingCount => matches!(schedule, Schedule::Simple(_)),
        FireOnceNow | DoNothing => matches!(schedule, Schedule::Cron(_)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::{CronSchedule, Repeat, SimpleSchedule};
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 3, h, m, s).unwrap()
    }

    fn one_shot_at(start: DateTime<Utc>) -> Trigger {
        Trigger::builder()
            .key(TriggerKey::named("t"))
            .job_key(JobKey::named("j"))
            .start_time(start)
            .schedule(Schedule::Simple(SimpleSchedule::once()))
            .build()
    }

    #[test]
    fn pipeline_transitions_are_legal() {
        use TriggerState::*;
        assert!(Waiting.can_transition_to(Acquired));
        assert!(Acquired.can_transition_to(Executing));
        assert!(Executing.can_transition_to(Waiting));
        assert!(Executing.can_transition_to(Blocked));
        assert!(Executing.can_transition_to(Complete));
        assert!(Blocked.can_transition_to(Waiting));
    }

    #[test]
    fn pause_resume_transitions_are_legal() {
        use TriggerState::*;
        assert!(Waiting.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Waiting));
        assert!(Blocked.can_transition_to(PausedBlocked));
        assert!(PausedBlocked.can_transition_to(Blocked));
        assert!(PausedBlocked.can_transition_to(Paused));
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        use TriggerState::*;
        assert!(!Complete.can_transition_to(Waiting));
        assert!(!Paused.can_transition_to(Acquired));
        assert!(!Waiting.can_transition_to(Executing));
        assert!(!Error.can_transition_to(Waiting));
    }

    #[test]
    fn anything_can_be_deleted() {
        use TriggerState::*;
        for state in [Waiting, Acquired, Executing, Complete, Paused, Blocked, Error] {
            assert!(state.can_transition_to(Deleted));
        }
    }

    #[test]
    fn triggered_advances_previous_and_next() {
        let mut trigger = Trigger::builder()
            .key(TriggerKey::named("t"))
            .job_key(JobKey::named("j"))
            .start_time(at(9, 0, 0))
            .schedule(Schedule::Simple(SimpleSchedule::every(
                std::time::Duration::from_secs(60),
            )))
            .build();
        trigger.compute_first_fire_time(None).unwrap();

        trigger.triggered(None).unwrap();
        assert_eq!(trigger.previous_fire_time, Some(at(9, 0, 0)));
        assert_eq!(trigger.next_fire_time, Some(at(9, 1, 0)));
    }

    #[test]
    fn one_shot_completes_after_single_fire() {
        let mut trigger = one_shot_at(at(9, 0, 0));
        trigger.compute_first_fire_time(None).unwrap();

        trigger.triggered(None).unwrap();
        assert_eq!(trigger.previous_fire_time, Some(at(9, 0, 0)));
        assert!(!trigger.may_fire_again());
    }

    #[test]
    fn misfire_detection_uses_threshold() {
        let mut trigger = one_shot_at(at(9, 0, 0));
        trigger.compute_first_fire_time(None).unwrap();

        assert!(!trigger.has_misfired(at(9, 0, 30), Duration::seconds(60)));
        assert!(trigger.has_misfired(at(9, 2, 0), Duration::seconds(60)));
    }

    #[test]
    fn smart_misfire_on_one_shot_fires_now() {
        let mut trigger = one_shot_at(at(9, 0, 0));
        trigger.compute_first_fire_time(None).unwrap();

        let now = at(9, 5, 0);
        trigger.update_after_misfire(now, None).unwrap();
        assert_eq!(trigger.next_fire_time, Some(now));
    }

    #[test]
    fn ignore_misfire_keeps_stale_time() {
        let mut trigger = one_shot_at(at(9, 0, 0));
        trigger.misfire_instruction = MisfireInstruction::IgnoreMisfire;
        trigger.compute_first_fire_time(None).unwrap();

        trigger.update_after_misfire(at(9, 5, 0), None).unwrap();
        assert_eq!(trigger.next_fire_time, Some(at(9, 0, 0)));
    }

    #[test]
    fn reschedule_now_with_remaining_count_drops_missed_fires() {
        let mut trigger = Trigger::builder()
            .key(TriggerKey::named("t"))
            .job_key(JobKey::named("j"))
            .start_time(at(9, 0, 0))
            .misfire_instruction(MisfireInstruction::RescheduleNowWithRemainingCount)
            .schedule(Schedule::Simple(SimpleSchedule::every_with_repeats(
                std::time::Duration::from_secs(60),
                10,
            )))
            .build();
        trigger.compute_first_fire_time(None).unwrap();

        // Three whole intervals were missed by 9:03.
        let now = at(9, 3, 0);
        trigger.update_after_misfire(now, None).unwrap();

        assert_eq!(trigger.next_fire_time, Some(now));
        assert_eq!(trigger.start_time, now);
        match &trigger.schedule {
            Schedule::Simple(s) => assert_eq!(s.repeat, Repeat::Times(7)),
            other => panic!("unexpected schedule {other:?}"),
        }
    }

    #[test]
    fn cron_do_nothing_advances_past_now() {
        let mut trigger = Trigger::builder()
            .key(TriggerKey::named("t"))
            .job_key(JobKey::named("j"))
            .start_time(at(9, 0, 0))
            .misfire_instruction(MisfireInstruction::DoNothing)
            .schedule(Schedule::Cron(CronSchedule::new("0 * * * * *")))
            .build();
        trigger.compute_first_fire_time(None).unwrap();

        trigger.update_after_misfire(at(9, 4, 30), None).unwrap();
        assert_eq!(trigger.next_fire_time, Some(at(9, 5, 0)));
    }

    #[test]
    fn cron_misfire_code_on_simple_schedule_is_invalid() {
        let mut trigger = one_shot_at(at(9, 0, 0));
        trigger.misfire_instruction = MisfireInstruction::FireOnceNow;
        assert!(matches!(
            trigger.validate(),
            Err(SchedulerError::InvalidTrigger { .. })
        ));
    }

    #[test]
    fn end_before_start_is_invalid() {
        let mut trigger = one_shot_at(at(9, 0, 0));
        trigger.end_time = Some(at(8, 0, 0));
        assert!(trigger.validate().is_err());
    }
}
