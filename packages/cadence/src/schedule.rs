//! Schedule computation for the supported trigger types.
//!
//! The engine consumes schedules only through the operations here: first fire
//! time, next fire after an instant, misfire-policy resolution, and the
//! may-fire-again check. Two types are shipped:
//!
//! - [`SimpleSchedule`]: fixed interval with an optional repeat count
//! - [`CronSchedule`]: cron expression, optionally in a named IANA zone
//!
//! All computed instants are UTC. Zone-aware cron schedules resolve their zone
//! once per computation and convert back; an unknown zone id is a validation
//! error, never a silent fallback.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::calendar::Calendar;
use crate::error::{Result, SchedulerError};

/// How far past a calendar-excluded stretch the engine searches before giving
/// up on a schedule.
const CALENDAR_SEARCH_HORIZON_DAYS: i64 = 366 * 5;

/// Misfire handling codes.
///
/// `Smart` resolves to a type-specific code when the misfire is processed:
/// a one-shot simple schedule picks `FireNow`, an indefinitely repeating one
/// picks `RescheduleNextWithRemainingCount`, a finite repeat picks
/// `RescheduleNowWithExistingCount`, and a cron schedule picks `FireOnceNow`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum MisfireInstruction {
    /// Let the schedule type pick a policy from its parameters.
    #[default]
    Smart,
    /// Keep the stale `next_fire_time`; the trigger fires late.
    IgnoreMisfire,
    /// Simple: fire immediately.
    FireNow,
    /// Simple: fire immediately, keep the configured repeat count.
    RescheduleNowWithExistingCount,
    /// Simple: fire immediately, drop the repeats that were missed.
    RescheduleNowWithRemainingCount,
    /// Simple: skip to the next scheduled time at or after now, keep counts.
    RescheduleNextWithExistingCount,
    /// Simple: skip to the next scheduled time at or after now, drop missed
    /// repeats.
    RescheduleNextWithRemainingCount,
    /// Cron: fire immediately, then continue on the expression.
    FireOnceNow,
    /// Cron: skip the missed instants, continue at the next included time.
    DoNothing,
}

/// Repeat behavior of a [`SimpleSchedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Repeat {
    Forever,
    /// Number of repeats after the first fire; `Times(0)` fires exactly once.
    Times(u32),
}

/// Fixed-interval schedule anchored at the trigger's start time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimpleSchedule {
    pub interval_ms: i64,
    pub repeat: Repeat,
    /// Fires recorded so far; used by the remaining-count misfire policies.
    #[serde(default)]
    pub times_triggered: u32,
}

impl SimpleSchedule {
    /// Fire exactly once at the trigger's start time.
    pub fn once() -> Self {
        Self {
            interval_ms: 0,
            repeat: Repeat::Times(0),
            times_triggered: 0,
        }
    }

    /// Fire every `interval`, forever.
    pub fn every(interval: std::time::Duration) -> Self {
        Self {
            interval_ms: interval.as_millis() as i64,
            repeat: Repeat::Forever,
            times_triggered: 0,
        }
    }

    /// Fire at the start time and then `repeats` more times.
    pub fn every_with_repeats(interval: std::time::Duration, repeats: u32) -> Self {
        Self {
            interval_ms: interval.as_millis() as i64,
            repeat: Repeat::Times(repeats),
            times_triggered: 0,
        }
    }

    fn interval(&self) -> Duration {
        Duration::milliseconds(self.interval_ms)
    }

    fn validate(&self) -> Result<(), String> {
        match self.repeat {
            Repeat::Times(0) => Ok(()),
            _ if self.interval_ms <= 0 => {
                Err("repeating schedule requires a positive interval".into())
            }
            _ => Ok(()),
        }
    }

    /// Index of the next occurrence strictly after `after`, or None when the
    /// repeat count is exhausted.
    fn next_occurrence_after(
        &self,
        after: DateTime<Utc>,
        start: DateTime<Utc>,
    ) -> Option<(u32, DateTime<Utc>)> {
        if after < start {
            return Some((0, start));
        }
        if self.interval_ms <= 0 {
            // One-shot: nothing fires after the start time.
            return None;
        }
        let elapsed_ms = (after - start).num_milliseconds();
        let n = (elapsed_ms / self.interval_ms + 1) as u32;
        if let Repeat::Times(count) = self.repeat {
            if n > count {
                return None;
            }
        }
        Some((n, start + self.interval() * n as i32))
    }

    fn occurrence_after_index(&self, n: u32, start: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if let Repeat::Times(count) = self.repeat {
            if n > count {
                return None;
            }
        }
        Some(start + self.interval() * n as i32)
    }
}

/// Cron-expression schedule (seconds granularity), optionally zone-aware.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronSchedule {
    pub expression: String,
    /// IANA zone id the expression is evaluated in; UTC when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

impl CronSchedule {
    pub fn new(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            timezone: None,
        }
    }

    pub fn in_timezone(expression: impl Into<String>, zone: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            timezone: Some(zone.into()),
        }
    }

    fn parsed(&self) -> Result<cron::Schedule> {
        cron::Schedule::from_str(&self.expression).map_err(|e| SchedulerError::InvalidSchedule {
            expression: self.expression.clone(),
            reason: e.to_string(),
        })
    }

    fn zone(&self) -> Result<chrono_tz::Tz> {
        match &self.timezone {
            None => Ok(chrono_tz::UTC),
            Some(id) => id
                .parse::<chrono_tz::Tz>()
                .map_err(|_| SchedulerError::UnknownTimeZone { zone: id.clone() }),
        }
    }
}

/// A trigger's schedule: the state the engine persists plus the computation
/// boundary it consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    Simple(SimpleSchedule),
    Cron(CronSchedule),
}

impl Schedule {
    /// Check expression, interval, and zone validity; returns a reason usable
    /// in a trigger validation error.
    pub fn validate(&self) -> Result<()> {
        match self {
            Schedule::Simple(s) => s.validate().map_err(|reason| {
                SchedulerError::InvalidSchedule {
                    expression: format!("every {}ms", s.interval_ms),
                    reason,
                }
            }),
            Schedule::Cron(c) => {
                c.parsed()?;
                c.zone()?;
                Ok(())
            }
        }
    }

    /// First included fire time at or after `start`, bounded by `end`.
    pub fn first_fire_time(
        &self,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
        calendar: Option<&Calendar>,
    ) -> Result<Option<DateTime<Utc>>> {
        match self {
            Schedule::Simple(s) => {
                let mut n = 0u32;
                let mut candidate = start;
                let horizon = start + Duration::days(CALENDAR_SEARCH_HORIZON_DAYS);
                loop {
                    if exceeds_end(candidate, end) || candidate > horizon {
                        return Ok(None);
                    }
                    if included(calendar, candidate) {
                        return Ok(Some(candidate));
                    }
                    n += 1;
                    candidate = match s.occurrence_after_index(n, start) {
                        Some(t) => t,
                        None => return Ok(None),
                    };
                }
            }
            // `after` is exclusive in the cron iterator; back off one tick so a
            // fire exactly at the start time is produced.
            Schedule::Cron(_) => {
                self.next_fire_after(start - Duration::milliseconds(1), start, end, calendar)
            }
        }
    }

    /// Next included fire time strictly after `after`, bounded by `end`.
    pub fn next_fire_after(
        &self,
        after: DateTime<Utc>,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
        calendar: Option<&Calendar>,
    ) -> Result<Option<DateTime<Utc>>> {
        let horizon = after + Duration::days(CALENDAR_SEARCH_HORIZON_DAYS);
        match self {
            Schedule::Simple(s) => {
                let (mut n, mut candidate) = match s.next_occurrence_after(after, start) {
                    Some(found) => found,
                    None => return Ok(None),
                };
                loop {
                    if exceeds_end(candidate, end) || candidate > horizon {
                        return Ok(None);
                    }
                    if included(calendar, candidate) {
                        return Ok(Some(candidate));
                    }
                    n += 1;
                    candidate = match s.occurrence_after_index(n, start) {
                        Some(t) => t,
                        None => return Ok(None),
                    };
                }
            }
            Schedule::Cron(c) => {
                let schedule = c.parsed()?;
                let zone = c.zone()?;
                let effective_after = after.max(start - Duration::milliseconds(1));
                for t in schedule.after(&effective_after.with_timezone(&zone)) {
                    let candidate = t.with_timezone(&Utc);
                    if exceeds_end(candidate, end) || candidate > horizon {
                        return Ok(None);
                    }
                    if included(calendar, candidate) {
                        return Ok(Some(candidate));
                    }
                }
                Ok(None)
            }
        }
    }

    /// The concrete policy `Smart` stands for on this schedule type.
    pub fn resolve_smart_policy(&self) -> MisfireInstruction {
        match self {
            Schedule::Simple(s) => match s.repeat {
                Repeat::Times(0) => MisfireInstruction::FireNow,
                Repeat::Forever => MisfireInstruction::RescheduleNextWithRemainingCount,
                Repeat::Times(_) => MisfireInstruction::RescheduleNowWithExistingCount,
            },
            Schedule::Cron(_) => MisfireInstruction::FireOnceNow,
        }
    }

    /// Record one fire; simple schedules count fires for the remaining-count
    /// misfire policies.
    pub fn record_fire(&mut self) {
        if let Schedule::Simple(s) = self {
            s.times_triggered = s.times_triggered.saturating_add(1);
        }
    }
}

fn included(calendar: Option<&Calendar>, at: DateTime<Utc>) -> bool {
    calendar.map_or(true, |c| c.is_time_included(at))
}

fn exceeds_end(candidate: DateTime<Utc>, end: Option<DateTime<Utc>>) -> bool {
    end.is_some_and(|e| candidate > e)
}
