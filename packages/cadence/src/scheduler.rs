//! The scheduler façade.
//!
//! Owns the store handle, the runner pool, and the three background tasks
//! (scheduler loop, misfire handler, cluster manager), and surfaces the
//! administrative operations to application code.
//!
//! # Example
//!
//! ```ignore
//! let mut registry = JobRegistry::new();
//! registry.register("report:nightly", Arc::new(NightlyReport::new(db)));
//!
//! let scheduler = Scheduler::builder()
//!     .registry(registry)
//!     .build()
//!     .await?;
//! scheduler.start().await?;
//!
//! let job = JobDefinition::builder()
//!     .key(JobKey::new("nightly", "reports"))
//!     .job_type("report:nightly")
//!     .build();
//! let trigger = Trigger::builder()
//!     .key(TriggerKey::new("nightly", "reports"))
//!     .job_key(job.key.clone())
//!     .start_time(Utc::now())
//!     .schedule(Schedule::Cron(CronSchedule::new("0 0 2 * * *")))
//!     .build();
//! scheduler.schedule_job(job, trigger).await?;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::calendar::Calendar;
use crate::clock::{SharedClock, SystemClock};
use crate::cluster::ClusterManager;
use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::job::{JobDataMap, JobDefinition, JobKey};
use crate::misfire::MisfireHandler;
use crate::registry::{JobRegistry, SharedJobRegistry};
use crate::runner::JobRunnerPool;
use crate::schedule::{MisfireInstruction, Schedule, SimpleSchedule};
use crate::scheduler_loop::{AcquisitionGate, SchedulerLoop};
use crate::signal::{SchedulerEvent, SchedulerSignal, SchedulerSignaler};
use crate::store::memory::MemoryJobStore;
use crate::store::{GroupMatcher, SharedJobStore, StoreContext, MANUAL_TRIGGER_GROUP};
use crate::trigger::{Trigger, TriggerKey, TriggerState};

/// How long a waiting shutdown lets running jobs finish.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Lifecycle of a scheduler instance. `Shutdown` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    StandBy,
    Running,
    Shutdown,
}

/// Builder for [`Scheduler`].
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    store: Option<SharedJobStore>,
    registry: JobRegistry,
    clock: Option<SharedClock>,
}

impl SchedulerBuilder {
    fn new() -> Self {
        Self {
            config: SchedulerConfig::default(),
            store: None,
            registry: JobRegistry::new(),
            clock: None,
        }
    }

    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Job store backing this instance; defaults to a fresh in-memory store.
    pub fn store(mut self, store: SharedJobStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn registry(mut self, registry: JobRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Time source; defaults to the system clock.
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Wire everything together and initialize the store. The scheduler
    /// comes up in stand-by; call [`Scheduler::start`] to begin acquiring.
    pub async fn build(self) -> Result<Scheduler> {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryJobStore::new(Arc::clone(&clock))));
        let signal = Arc::new(SchedulerSignal::new());
        let registry: SharedJobRegistry = Arc::new(self.registry);

        store
            .initialize(StoreContext::for_config(&self.config, signal.clone()))
            .await?;

        let pool = Arc::new(JobRunnerPool::new(
            self.config.worker_slots,
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&signal),
            Arc::clone(&clock),
        ));

        Ok(Scheduler {
            inner: Arc::new(SchedulerCore {
                config: self.config,
                store,
                registry,
                clock,
                signal,
                pool,
                gate: Arc::new(AcquisitionGate::new()),
                shutdown: CancellationToken::new(),
                lifecycle: StdMutex::new(LifecycleState::StandBy),
                started: AtomicBool::new(false),
                tasks: tokio::sync::Mutex::new(Vec::new()),
            }),
        })
    }
}

struct SchedulerCore {
    config: SchedulerConfig,
    store: SharedJobStore,
    registry: SharedJobRegistry,
    clock: SharedClock,
    signal: Arc<SchedulerSignal>,
    pool: Arc<JobRunnerPool>,
    gate: Arc<AcquisitionGate>,
    shutdown: CancellationToken,
    lifecycle: StdMutex<LifecycleState>,
    started: AtomicBool,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// An embeddable scheduler instance. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerCore>,
}

impl Scheduler {
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::new()
    }

    fn core(&self) -> &SchedulerCore {
        &self.inner
    }

    fn lifecycle_state(&self) -> LifecycleState {
        *self
            .core()
            .lifecycle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn set_lifecycle(&self, state: LifecycleState) {
        *self
            .core()
            .lifecycle
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn ensure_not_shutdown(&self) -> Result<()> {
        if self.lifecycle_state() == LifecycleState::Shutdown {
            return Err(SchedulerError::Operation(
                "scheduler has been shut down".into(),
            ));
        }
        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.lifecycle_state()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.core().config
    }

    /// Direct handle onto the backing store.
    pub fn store(&self) -> SharedJobStore {
        Arc::clone(&self.core().store)
    }

    /// Subscribe to scheduler lifecycle events.
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<SchedulerEvent> {
        self.core().signal.subscribe()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Move stand-by -> running: recover this instance's own orphaned fires
    /// (first start only), spawn the background tasks, open acquisition.
    pub async fn start(&self) -> Result<()> {
        self.ensure_not_shutdown()?;
        let core = self.core();

        if !core.started.swap(true, Ordering::SeqCst) {
            // Orphans from a previous run under the same instance id.
            match core.store.recover_jobs(&core.config.instance_id).await {
                Ok(report) if report.recovery_triggers + report.released_triggers > 0 => {
                    info!(
                        recovery_triggers = report.recovery_triggers,
                        released_triggers = report.released_triggers,
                        "recovered own in-flight work from a previous run"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "own-instance recovery failed during start");
                    core.signal
                        .notify_error("own-instance recovery failed", &anyhow::anyhow!(e));
                }
            }

            let mut tasks = core.tasks.lock().await;
            tasks.push(tokio::spawn(
                SchedulerLoop::new(
                    Arc::clone(&core.store),
                    Arc::clone(&core.pool),
                    Arc::clone(&core.signal),
                    Arc::clone(&core.clock),
                    core.config.clone(),
                    Arc::clone(&core.gate),
                    core.shutdown.clone(),
                )
                .run(),
            ));
            tasks.push(tokio::spawn(
                MisfireHandler::new(
                    Arc::clone(&core.store),
                    Arc::clone(&core.signal),
                    Arc::clone(&core.clock),
                    core.config.clone(),
                    core.shutdown.clone(),
                )
                .run(),
            ));
            if core.config.clustered {
                tasks.push(tokio::spawn(
                    ClusterManager::new(
                        Arc::clone(&core.store),
                        Arc::clone(&core.signal),
                        Arc::clone(&core.clock),
                        core.config.clone(),
                        core.shutdown.clone(),
                    )
                    .run(),
                ));
            }
        }

        self.set_lifecycle(LifecycleState::Running);
        core.gate.open();
        info!(
            scheduler = %core.config.scheduler_name,
            instance_id = %core.config.instance_id,
            "scheduler started"
        );
        Ok(())
    }

    /// Pause acquisition; in-flight jobs continue, timers keep running.
    pub fn standby(&self) -> Result<()> {
        self.ensure_not_shutdown()?;
        self.core().gate.close();
        self.set_lifecycle(LifecycleState::StandBy);
        info!("scheduler placed in stand-by");
        Ok(())
    }

    /// Terminal shutdown. With `wait_for_jobs` the call blocks until running
    /// jobs finish (bounded); otherwise running jobs get their interruption
    /// flag set and are left to wind down on their own.
    pub async fn shutdown(&self, wait_for_jobs: bool) -> Result<()> {
        if self.lifecycle_state() == LifecycleState::Shutdown {
            return Ok(());
        }
        let core = self.core();
        self.set_lifecycle(LifecycleState::Shutdown);
        core.gate.close();
        core.shutdown.cancel();

        if wait_for_jobs {
            core.pool.drain(SHUTDOWN_DRAIN_TIMEOUT).await;
        } else {
            core.pool.interrupt_all().await;
        }

        let mut tasks = core.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
        info!(instance_id = %core.config.instance_id, "scheduler shut down");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    /// Store the job and its trigger; returns the first fire time.
    pub async fn schedule_job(
        &self,
        job: JobDefinition,
        trigger: Trigger,
    ) -> Result<DateTime<Utc>> {
        self.ensure_not_shutdown()?;
        if trigger.job_key != job.key {
            return Err(SchedulerError::InvalidTrigger {
                key: trigger.key.clone(),
                reason: format!(
                    "trigger references job '{}' but was scheduled with '{}'",
                    trigger.job_key, job.key
                ),
            });
        }
        let mut trigger = trigger;
        let first = self.prepare_trigger_first_fire(&mut trigger).await?;
        self.core()
            .store
            .store_job_and_trigger(job, trigger, false)
            .await?;
        self.core().signal.signal_scheduling_change(Some(first));
        Ok(first)
    }

    /// Attach another trigger to an already-stored job.
    pub async fn schedule_trigger(&self, trigger: Trigger) -> Result<DateTime<Utc>> {
        self.ensure_not_shutdown()?;
        let mut trigger = trigger;
        let first = self.prepare_trigger_first_fire(&mut trigger).await?;
        self.core().store.store_trigger(trigger, false).await?;
        self.core().signal.signal_scheduling_change(Some(first));
        Ok(first)
    }

    async fn prepare_trigger_first_fire(&self, trigger: &mut Trigger) -> Result<DateTime<Utc>> {
        trigger.validate()?;
        let calendar = self.resolve_calendar(trigger.calendar_name.as_deref()).await?;
        trigger
            .compute_first_fire_time(calendar.as_ref())?
            .ok_or_else(|| SchedulerError::InvalidTrigger {
                key: trigger.key.clone(),
                reason: "trigger will never fire".into(),
            })
    }

    async fn resolve_calendar(&self, name: Option<&str>) -> Result<Option<Calendar>> {
        match name {
            None => Ok(None),
            Some(name) => self
                .core()
                .store
                .retrieve_calendar(name)
                .await?
                .map(Some)
                .ok_or_else(|| SchedulerError::CalendarNotFound {
                    name: name.to_string(),
                }),
        }
    }

    /// Store a job with no trigger; such jobs must be durable.
    pub async fn add_job(&self, job: JobDefinition, replace: bool) -> Result<()> {
        self.ensure_not_shutdown()?;
        if !job.durable {
            return Err(SchedulerError::Operation(
                "a job stored without a trigger must be durable".into(),
            ));
        }
        self.core().store.store_job(job, replace).await
    }

    /// Remove a trigger; deletes its job too when the job is non-durable and
    /// has no other triggers. Returns false when the trigger was absent.
    pub async fn unschedule_job(&self, trigger_key: &TriggerKey) -> Result<bool> {
        self.ensure_not_shutdown()?;
        let removed = self.core().store.remove_trigger(trigger_key).await?;
        if removed {
            self.core().signal.signal_scheduling_change(None);
        }
        Ok(removed)
    }

    /// Remove a job and all of its triggers.
    pub async fn delete_job(&self, job_key: &JobKey) -> Result<bool> {
        self.ensure_not_shutdown()?;
        let removed = self.core().store.remove_job(job_key).await?;
        if removed {
            self.core().signal.notify_job_deleted(job_key);
            self.core().signal.signal_scheduling_change(None);
        }
        Ok(removed)
    }

    /// Swap a trigger for a new one on the same job. Returns the new first
    /// fire time, or `None` when the old trigger was not found.
    pub async fn reschedule_job(
        &self,
        trigger_key: &TriggerKey,
        new_trigger: Trigger,
    ) -> Result<Option<DateTime<Utc>>> {
        self.ensure_not_shutdown()?;
        let mut new_trigger = new_trigger;
        let first = self.prepare_trigger_first_fire(&mut new_trigger).await?;
        if self
            .core()
            .store
            .replace_trigger(trigger_key, new_trigger)
            .await?
        {
            self.core().signal.signal_scheduling_change(Some(first));
            Ok(Some(first))
        } else {
            Ok(None)
        }
    }

    /// Fire the job once, now, with an optional data override.
    pub async fn trigger_job(&self, job_key: &JobKey, data: Option<JobDataMap>) -> Result<()> {
        self.ensure_not_shutdown()?;
        let core = self.core();
        if core.store.retrieve_job(job_key).await?.is_none() {
            return Err(SchedulerError::JobNotFound {
                key: job_key.clone(),
            });
        }
        let now = core.clock.now();
        let mut trigger = Trigger::builder()
            .key(TriggerKey::new(
                format!("manual-{}", Uuid::new_v4()),
                MANUAL_TRIGGER_GROUP,
            ))
            .job_key(job_key.clone())
            .start_time(now)
            .misfire_instruction(MisfireInstruction::IgnoreMisfire)
            .schedule(Schedule::Simple(SimpleSchedule::once()))
            .data(data.unwrap_or_default())
            .build();
        trigger.next_fire_time = Some(now);
        core.store.store_trigger(trigger, false).await?;
        core.signal.signal_scheduling_change(Some(now));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Pause / resume
    // ------------------------------------------------------------------

    pub async fn pause_trigger(&self, key: &TriggerKey) -> Result<()> {
        self.ensure_not_shutdown()?;
        self.core().store.pause_trigger(key).await
    }

    /// Pause matching groups; the matcher is remembered so triggers added
    /// into matching groups later start paused.
    pub async fn pause_triggers(&self, matcher: &GroupMatcher) -> Result<Vec<String>> {
        self.ensure_not_shutdown()?;
        self.core().store.pause_triggers(matcher).await
    }

    pub async fn pause_job(&self, key: &JobKey) -> Result<()> {
        self.ensure_not_shutdown()?;
        self.core().store.pause_job(key).await
    }

    pub async fn pause_jobs(&self, matcher: &GroupMatcher) -> Result<Vec<String>> {
        self.ensure_not_shutdown()?;
        self.core().store.pause_jobs(matcher).await
    }

    pub async fn resume_trigger(&self, key: &TriggerKey) -> Result<()> {
        self.ensure_not_shutdown()?;
        self.core().store.resume_trigger(key).await
    }

    pub async fn resume_triggers(&self, matcher: &GroupMatcher) -> Result<Vec<String>> {
        self.ensure_not_shutdown()?;
        self.core().store.resume_triggers(matcher).await
    }

    pub async fn resume_job(&self, key: &JobKey) -> Result<()> {
        self.ensure_not_shutdown()?;
        self.core().store.resume_job(key).await
    }

    pub async fn resume_jobs(&self, matcher: &GroupMatcher) -> Result<Vec<String>> {
        self.ensure_not_shutdown()?;
        self.core().store.resume_jobs(matcher).await
    }

    pub async fn pause_all(&self) -> Result<()> {
        self.ensure_not_shutdown()?;
        self.core().store.pause_all().await
    }

    pub async fn resume_all(&self) -> Result<()> {
        self.ensure_not_shutdown()?;
        self.core().store.resume_all().await
    }

    // ------------------------------------------------------------------
    // Introspection and control
    // ------------------------------------------------------------------

    pub async fn get_job(&self, key: &JobKey) -> Result<Option<JobDefinition>> {
        self.core().store.retrieve_job(key).await
    }

    pub async fn get_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>> {
        self.core().store.retrieve_trigger(key).await
    }

    pub async fn trigger_state(&self, key: &TriggerKey) -> Result<TriggerState> {
        self.core().store.trigger_state(key).await
    }

    pub async fn add_calendar(
        &self,
        name: &str,
        calendar: Calendar,
        replace: bool,
    ) -> Result<()> {
        self.ensure_not_shutdown()?;
        self.core().store.store_calendar(name, calendar, replace).await
    }

    pub async fn get_calendar(&self, name: &str) -> Result<Option<Calendar>> {
        self.core().store.retrieve_calendar(name).await
    }

    pub async fn delete_calendar(&self, name: &str) -> Result<bool> {
        self.ensure_not_shutdown()?;
        self.core().store.remove_calendar(name).await
    }

    /// Flip the interruption flag on every running execution of the job.
    /// Returns true when at least one execution matched.
    pub async fn interrupt(&self, job_key: &JobKey) -> Result<bool> {
        self.ensure_not_shutdown()?;
        Ok(self.core().pool.interrupt_job(job_key).await)
    }

    /// Flip the interruption flag on one fire by its id.
    pub async fn interrupt_fire(&self, fire_id: Uuid) -> Result<bool> {
        self.ensure_not_shutdown()?;
        Ok(self.core().pool.interrupt_fire(fire_id).await)
    }

    /// Number of jobs executing right now on this instance.
    pub async fn currently_executing(&self) -> usize {
        self.core().pool.running_count().await
    }

    /// Delete all jobs, triggers, and calendars; liveness records survive.
    pub async fn clear(&self) -> Result<()> {
        self.ensure_not_shutdown()?;
        self.core().store.clear_all_scheduling_data().await?;
        self.core().signal.signal_scheduling_change(None);
        Ok(())
    }

    /// Registered job handler types.
    pub fn registered_job_types(&self) -> Vec<String> {
        self.core()
            .registry
            .registered_types()
            .into_iter()
            .map(str::to_string)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn standby_scheduler() -> Scheduler {
        Scheduler::builder().build().await.unwrap()
    }

    fn one_shot_pair(name: &str) -> (JobDefinition, Trigger) {
        let job = JobDefinition::builder()
            .key(JobKey::named(name))
            .job_type("sample")
            .build();
        let trigger = Trigger::builder()
            .key(TriggerKey::named(name))
            .job_key(job.key.clone())
            .start_time(Utc::now() + chrono::Duration::seconds(60))
            .schedule(Schedule::Simple(SimpleSchedule::once()))
            .build();
        (job, trigger)
    }

    #[tokio::test]
    async fn builder_yields_standby_scheduler() {
        let scheduler = standby_scheduler().await;
        assert_eq!(scheduler.state(), LifecycleState::StandBy);
    }

    #[tokio::test]
    async fn schedule_returns_first_fire_time() {
        let scheduler = standby_scheduler().await;
        let (job, trigger) = one_shot_pair("j");
        let expected = trigger.start_time;

        let first = scheduler.schedule_job(job, trigger).await.unwrap();
        assert_eq!(first, expected);
    }

    #[tokio::test]
    async fn mismatched_trigger_job_key_is_rejected() {
        let scheduler = standby_scheduler().await;
        let (job, mut trigger) = one_shot_pair("j");
        trigger.job_key = JobKey::named("other");

        assert!(matches!(
            scheduler.schedule_job(job, trigger).await,
            Err(SchedulerError::InvalidTrigger { .. })
        ));
    }

    #[tokio::test]
    async fn add_job_requires_durability() {
        let scheduler = standby_scheduler().await;
        let job = JobDefinition::builder()
            .key(JobKey::named("j"))
            .job_type("sample")
            .build();

        assert!(matches!(
            scheduler.add_job(job, false).await,
            Err(SchedulerError::Operation(_))
        ));
    }

    #[tokio::test]
    async fn operations_after_shutdown_are_rejected() {
        let scheduler = standby_scheduler().await;
        scheduler.shutdown(false).await.unwrap();
        assert_eq!(scheduler.state(), LifecycleState::Shutdown);

        let (job, trigger) = one_shot_pair("j");
        assert!(matches!(
            scheduler.schedule_job(job, trigger).await,
            Err(SchedulerError::Operation(_))
        ));
    }

    #[tokio::test]
    async fn reschedule_missing_trigger_returns_none() {
        let scheduler = standby_scheduler().await;
        let (job, trigger) = one_shot_pair("j");
        scheduler.schedule_job(job, trigger.clone()).await.unwrap();

        let mut replacement = trigger.clone();
        replacement.key = TriggerKey::named("replacement");
        let missing = TriggerKey::named("never-stored");
        assert_eq!(
            scheduler
                .reschedule_job(&missing, replacement)
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn trigger_job_requires_existing_job() {
        let scheduler = standby_scheduler().await;
        assert!(matches!(
            scheduler.trigger_job(&JobKey::named("ghost"), None).await,
            Err(SchedulerError::JobNotFound { .. })
        ));
    }
}
