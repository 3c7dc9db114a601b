//! Execution context handed to job handlers.
//!
//! Built by the runner pool from the bundle the store returned at fire time.
//! The context carries the merged data map (trigger entries override job
//! entries), the fire timing, and a cancellation token used for cooperative
//! interruption and shutdown.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::job::{JobDataMap, JobDefinition};
use crate::store::RECOVERY_TRIGGER_GROUP;
use crate::trigger::Trigger;

/// Everything a handler may inspect about the fire it is servicing.
#[derive(Clone)]
pub struct JobExecutionContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    fire_id: Uuid,
    job: JobDefinition,
    trigger: Trigger,
    merged_data: JobDataMap,
    job_data: Mutex<JobDataMap>,
    scheduled_fire_time: DateTime<Utc>,
    fire_time: DateTime<Utc>,
    previous_fire_time: Option<DateTime<Utc>>,
    next_fire_time: Option<DateTime<Utc>>,
    refire_count: u32,
    cancellation: CancellationToken,
}

impl JobExecutionContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        fire_id: Uuid,
        job: JobDefinition,
        trigger: Trigger,
        scheduled_fire_time: DateTime<Utc>,
        fire_time: DateTime<Utc>,
        previous_fire_time: Option<DateTime<Utc>>,
        next_fire_time: Option<DateTime<Utc>>,
        refire_count: u32,
        cancellation: CancellationToken,
    ) -> Self {
        let merged_data = job.data.merged_with(&trigger.data);
        let job_data = Mutex::new(job.data.clone());
        Self {
            inner: Arc::new(ContextInner {
                fire_id,
                job,
                trigger,
                merged_data,
                job_data,
                scheduled_fire_time,
                fire_time,
                previous_fire_time,
                next_fire_time,
                refire_count,
                cancellation,
            }),
        }
    }

    /// Unique id of this fire; stable across immediate re-fires.
    pub fn fire_id(&self) -> Uuid {
        self.inner.fire_id
    }

    pub fn job(&self) -> &JobDefinition {
        &self.inner.job
    }

    pub fn trigger(&self) -> &Trigger {
        &self.inner.trigger
    }

    /// Job data overlaid with the firing trigger's data.
    pub fn merged_data(&self) -> &JobDataMap {
        &self.inner.merged_data
    }

    /// Read the job's own data map as it will be persisted after execution
    /// when the job opted into `persist_data_after_execution`.
    pub fn job_data(&self) -> JobDataMap {
        self.inner.job_data.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Mutate the job's data map; only persisted when the job opted into
    /// `persist_data_after_execution`.
    pub fn update_job_data(&self, f: impl FnOnce(&mut JobDataMap)) {
        let mut guard = self.inner.job_data.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard);
    }

    /// The instant this fire was due.
    pub fn scheduled_fire_time(&self) -> DateTime<Utc> {
        self.inner.scheduled_fire_time
    }

    /// The instant the fire actually happened.
    pub fn fire_time(&self) -> DateTime<Utc> {
        self.inner.fire_time
    }

    pub fn previous_fire_time(&self) -> Option<DateTime<Utc>> {
        self.inner.previous_fire_time
    }

    pub fn next_fire_time(&self) -> Option<DateTime<Utc>> {
        self.inner.next_fire_time
    }

    /// How many times this fire was immediately re-executed already.
    pub fn refire_count(&self) -> u32 {
        self.inner.refire_count
    }

    /// Whether this execution replaces one lost in an instance crash.
    pub fn is_recovering(&self) -> bool {
        self.inner.trigger.key.group == RECOVERY_TRIGGER_GROUP
    }

    /// Cooperative interruption flag; set by `interrupt` on the façade and on
    /// non-waiting shutdown.
    pub fn is_interrupt_requested(&self) -> bool {
        self.inner.cancellation.is_cancelled()
    }

    /// Token resolving when interruption is requested, for use in `select!`.
    pub fn interrupted(&self) -> CancellationToken {
        self.inner.cancellation.clone()
    }

    pub(crate) fn with_refire_count(&self, refire_count: u32) -> Self {
        let inner = &self.inner;
        Self {
            inner: Arc::new(ContextInner {
                fire_id: inner.fire_id,
                job: inner.job.clone(),
                trigger: inner.trigger.clone(),
                merged_data: inner.merged_data.clone(),
                job_data: Mutex::new(self.job_data()),
                scheduled_fire_time: inner.scheduled_fire_time,
                fire_time: inner.fire_time,
                previous_fire_time: inner.previous_fire_time,
                next_fire_time: inner.next_fire_time,
                refire_count,
                cancellation: inner.cancellation.clone(),
            }),
        }
    }
}
