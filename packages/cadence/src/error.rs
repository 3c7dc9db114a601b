//! Structured error types for the scheduling engine.
//!
//! `SchedulerError` provides pattern-matchable errors instead of generic
//! `anyhow::Error`. `JobExecutionError` is the one error type job handlers may
//! return to steer post-execution behavior.
//!
//! # The Error Boundary Rule
//!
//! > **No `anyhow::Error` ever crosses the store or façade boundary.**
//!
//! - `anyhow` is internal transport inside job handlers (ergonomic for
//!   application code)
//! - `SchedulerError` is the only externalized error (structured for callers)
//!
//! Persistence failures from any store backend are wrapped in
//! [`SchedulerError::Persistence`] so the scheduler loop can apply its
//! retry-and-pause policy without inspecting backend details.

use thiserror::Error;

use crate::job::JobKey;
use crate::trigger::TriggerKey;

/// Result alias used throughout the crate.
pub type Result<T, E = SchedulerError> = std::result::Result<T, E>;

/// Errors surfaced by the scheduler core and its job stores.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Insert without replace of an already-stored job.
    #[error("job '{key}' already exists")]
    JobAlreadyExists { key: JobKey },

    /// Insert without replace of an already-stored trigger.
    #[error("trigger '{key}' already exists")]
    TriggerAlreadyExists { key: TriggerKey },

    /// Insert without replace of an already-stored calendar.
    #[error("calendar '{name}' already exists")]
    CalendarAlreadyExists { name: String },

    /// The referenced job does not exist in the store.
    #[error("job '{key}' not found")]
    JobNotFound { key: JobKey },

    /// The referenced trigger does not exist in the store.
    #[error("trigger '{key}' not found")]
    TriggerNotFound { key: TriggerKey },

    /// The referenced calendar does not exist in the store.
    #[error("calendar '{name}' not found")]
    CalendarNotFound { name: String },

    /// A calendar cannot be removed while triggers reference it.
    #[error("calendar '{name}' is referenced by {count} trigger(s)")]
    CalendarInUse { name: String, count: usize },

    /// A trigger or its schedule failed validation.
    #[error("invalid trigger '{key}': {reason}")]
    InvalidTrigger { key: TriggerKey, reason: String },

    /// A schedule expression could not be parsed.
    #[error("invalid schedule '{expression}': {reason}")]
    InvalidSchedule { expression: String, reason: String },

    /// A schedule references a time zone identifier the host cannot resolve.
    #[error("unknown time zone '{zone}'")]
    UnknownTimeZone { zone: String },

    /// The store could not read or write. Retried by the scheduler loop with
    /// backoff before the loop pauses and tries again.
    #[error("job store operation failed: {source}")]
    Persistence {
        #[source]
        source: anyhow::Error,
    },

    /// Façade-level misuse, e.g. scheduling against a shut-down scheduler.
    #[error("invalid scheduler operation: {0}")]
    Operation(String),
}

impl SchedulerError {
    /// Wrap an arbitrary backend failure as a persistence error.
    pub fn persistence(source: impl Into<anyhow::Error>) -> Self {
        Self::Persistence {
            source: source.into(),
        }
    }

    /// Whether the operation may succeed if retried against the store.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Persistence { .. })
    }
}

impl From<sqlx::Error> for SchedulerError {
    fn from(e: sqlx::Error) -> Self {
        Self::persistence(e)
    }
}

/// Failure returned by a job handler's `execute`.
///
/// The flags steer the post-execution directive the runner hands to
/// `triggered_job_complete`. Any other error type returned by a handler is
/// coerced into a `JobExecutionError` with all flags false.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct JobExecutionError {
    pub message: String,
    /// Re-run the job immediately on the same fire.
    pub refire_immediately: bool,
    /// Complete the trigger that fired this execution.
    pub unschedule_firing_trigger: bool,
    /// Complete every trigger referencing this job.
    pub unschedule_all_triggers: bool,
}

impl JobExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            refire_immediately: false,
            unschedule_firing_trigger: false,
            unschedule_all_triggers: false,
        }
    }

    /// Failure that asks for an immediate re-fire of the same execution.
    pub fn with_refire(message: impl Into<String>) -> Self {
        Self {
            refire_immediately: true,
            ..Self::new(message)
        }
    }

    /// Failure that unschedules the trigger which fired this execution.
    pub fn with_unschedule_firing_trigger(message: impl Into<String>) -> Self {
        Self {
            unschedule_firing_trigger: true,
            ..Self::new(message)
        }
    }

    /// Failure that unschedules every trigger of the job.
    pub fn with_unschedule_all_triggers(message: impl Into<String>) -> Self {
        Self {
            unschedule_all_triggers: true,
            ..Self::new(message)
        }
    }

    /// Coerce an arbitrary handler error, preserving flags when the error
    /// already is a `JobExecutionError`.
    pub fn coerce(error: anyhow::Error) -> Self {
        match error.downcast::<JobExecutionError>() {
            Ok(e) => e,
            Err(other) => Self::new(format!("{other:#}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persistence_errors_are_retryable() {
        let e = SchedulerError::persistence(anyhow::anyhow!("connection reset"));
        assert!(e.is_retryable());
    }

    #[test]
    fn duplicate_job_is_not_retryable() {
        let e = SchedulerError::JobAlreadyExists {
            key: JobKey::new("a", "b"),
        };
        assert!(!e.is_retryable());
    }

    #[test]
    fn coerce_preserves_execution_flags() {
        let original = JobExecutionError::with_refire("transient");
        let coerced = JobExecutionError::coerce(original.into());
        assert!(coerced.refire_immediately);
    }

    #[test]
    fn coerce_defaults_flags_for_foreign_errors() {
        let coerced = JobExecutionError::coerce(anyhow::anyhow!("boom"));
        assert!(!coerced.refire_immediately);
        assert!(!coerced.unschedule_firing_trigger);
        assert!(!coerced.unschedule_all_triggers);
        assert_eq!(coerced.message, "boom");
    }
}
