//! Calendars exclude instants from trigger schedules.
//!
//! A trigger with a `calendar_name` consults the named calendar while
//! advancing its schedule: candidate fire times the calendar excludes are
//! skipped. Calendars are persisted by the job store, so the variants here are
//! plain data.

use chrono::{DateTime, Datelike, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// A named exclusion rule over UTC instants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Calendar {
    /// Excludes whole days of the week, e.g. weekends.
    Weekly { excluded_days: Vec<Weekday> },
    /// Excludes specific dates, e.g. public holidays.
    Holiday { excluded_dates: Vec<NaiveDate> },
}

impl Calendar {
    /// Whether the instant is allowed as a fire time.
    pub fn is_time_included(&self, at: DateTime<Utc>) -> bool {
        match self {
            Calendar::Weekly { excluded_days } => !excluded_days.contains(&at.weekday()),
            Calendar::Holiday { excluded_dates } => !excluded_dates.contains(&at.date_naive()),
        }
    }

    /// Calendar excluding Saturdays and Sundays.
    pub fn weekends_excluded() -> Self {
        Calendar::Weekly {
            excluded_days: vec![Weekday::Sat, Weekday::Sun],
        }
    }
}
