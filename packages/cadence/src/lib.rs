//! Cadence: an embeddable clustered job scheduling engine.
//!
//! The engine owns a registry of job definitions and triggers, computes when
//! each trigger should fire, and dispatches the associated job exactly when
//! due. Several peer instances may share one durable store; the store's
//! atomic acquire step guarantees every trigger fires at most once per due
//! instant across the cluster, and fired-trigger rows let a surviving
//! instance recover work lost in a crash.
//!
//! # Architecture
//!
//! ```text
//! application ─► Scheduler (façade) ─► JobStore (durable edits)
//!                                          │ Signaler wake-up
//!                                          ▼
//!                                   SchedulerLoop ─► acquire / fire
//!                                          │
//!                                          ▼
//!                                   JobRunnerPool ─► Job::execute
//!                                          │
//!                                          └─► JobStore (complete)
//!
//! MisfireHandler and ClusterManager run as independent timers
//! against the same JobStore.
//! ```
//!
//! # Quick start
//!
//! ```ignore
//! use cadence::{JobRegistry, Scheduler, JobDefinition, JobKey, Trigger,
//!               TriggerKey, Schedule, CronSchedule};
//!
//! let mut registry = JobRegistry::new();
//! registry.register("report:nightly", Arc::new(NightlyReport::new(db)));
//!
//! let scheduler = Scheduler::builder().registry(registry).build().await?;
//! scheduler.start().await?;
//! ```

pub mod calendar;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod job;
pub mod registry;
pub mod runner;
pub mod schedule;
pub mod scheduler;
pub mod signal;
pub mod store;
pub mod testing;
pub mod trigger;

mod cluster;
mod misfire;
mod scheduler_loop;

pub use calendar::Calendar;
pub use clock::{Clock, SharedClock, SystemClock};
pub use config::SchedulerConfig;
pub use context::JobExecutionContext;
pub use error::{JobExecutionError, Result, SchedulerError};
pub use job::{Job, JobDataMap, JobDefinition, JobKey, DEFAULT_GROUP};
pub use registry::{JobRegistry, SharedJobRegistry};
pub use schedule::{CronSchedule, MisfireInstruction, Repeat, Schedule, SimpleSchedule};
pub use scheduler::{LifecycleState, Scheduler, SchedulerBuilder};
pub use signal::{SchedulerEvent, SchedulerSignal, SchedulerSignaler};
pub use store::memory::MemoryJobStore;
pub use store::postgres::PostgresJobStore;
pub use store::{
    CompletedExecutionInstruction, FiredState, FiredTrigger, GroupMatcher, JobStore, MisfireSweep,
    RecoveryReport, SchedulerStateRecord, SharedJobStore, StoreContext, TriggerFiredBundle,
    TriggerFiredResult, MANUAL_TRIGGER_GROUP, RECOVERY_TRIGGER_GROUP,
};
pub use trigger::{Trigger, TriggerKey, TriggerState, DEFAULT_PRIORITY};
