//! Bounded pool of runner slots executing fired jobs.
//!
//! ```text
//! SchedulerLoop
//!     │  TriggerFiredBundle + slot permit
//!     └─► runner task
//!             ├─► build JobExecutionContext
//!             ├─► handler.execute(ctx)          (re-fires on request)
//!             ├─► release the slot permit
//!             └─► store.triggered_job_complete(trigger, job, directive)
//! ```
//!
//! The permit is released before the completing store call so the scheduler
//! loop can acquire the next batch while the store write is in flight. The
//! pool never serializes executions itself; non-concurrent jobs are enforced
//! by the store through the blocked states.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::context::JobExecutionContext;
use crate::error::JobExecutionError;
use crate::job::JobKey;
use crate::registry::SharedJobRegistry;
use crate::signal::{SchedulerEvent, SchedulerSignal, SchedulerSignaler};
use crate::store::{CompletedExecutionInstruction, SharedJobStore, TriggerFiredBundle};

struct RunningJob {
    job_key: JobKey,
    cancel: CancellationToken,
}

/// Bounded set of worker slots; one permit per concurrently executing job.
pub struct JobRunnerPool {
    slots: Arc<Semaphore>,
    store: SharedJobStore,
    registry: SharedJobRegistry,
    signal: Arc<SchedulerSignal>,
    clock: SharedClock,
    running: Arc<RwLock<HashMap<Uuid, RunningJob>>>,
}

impl JobRunnerPool {
    pub fn new(
        worker_slots: usize,
        store: SharedJobStore,
        registry: SharedJobRegistry,
        signal: Arc<SchedulerSignal>,
        clock: SharedClock,
    ) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(worker_slots.max(1))),
            store,
            registry,
            signal,
            clock,
            running: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Slots free right now.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Block until a slot is free. Returns `None` when the pool is closed.
    pub async fn acquire_slot(&self) -> Option<tokio::sync::OwnedSemaphorePermit> {
        Arc::clone(&self.slots).acquire_owned().await.ok()
    }

    /// Number of jobs currently executing.
    pub async fn running_count(&self) -> usize {
        self.running.read().await.len()
    }

    /// Flip the interruption flag on every execution of the job. Returns
    /// true when at least one matched.
    pub async fn interrupt_job(&self, key: &JobKey) -> bool {
        let running = self.running.read().await;
        let mut matched = false;
        for entry in running.values() {
            if entry.job_key == *key {
                entry.cancel.cancel();
                matched = true;
            }
        }
        matched
    }

    /// Flip the interruption flag on one fire. Returns true when it matched.
    pub async fn interrupt_fire(&self, fire_id: Uuid) -> bool {
        let running = self.running.read().await;
        match running.get(&fire_id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Request interruption of everything currently executing.
    pub async fn interrupt_all(&self) {
        let running = self.running.read().await;
        for entry in running.values() {
            entry.cancel.cancel();
        }
    }

    /// Wait until every running job finished, up to `timeout`.
    pub async fn drain(&self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.running_count().await > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining = self.running_count().await,
                    "timed out waiting for running jobs to finish"
                );
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Run a fired bundle on its own task, consuming the slot permit the
    /// caller already holds.
    pub fn spawn(
        self: &Arc<Self>,
        bundle: TriggerFiredBundle,
        permit: tokio::sync::OwnedSemaphorePermit,
        shutdown: &CancellationToken,
    ) {
        let pool = Arc::clone(self);
        let job_cancel = shutdown.child_token();
        tokio::spawn(async move {
            pool.run_one(bundle, permit, job_cancel).await;
        });
    }

    async fn run_one(
        &self,
        bundle: TriggerFiredBundle,
        permit: tokio::sync::OwnedSemaphorePermit,
        cancel: CancellationToken,
    ) {
        let fire_id = bundle.fire_id;
        let trigger_key = bundle.trigger.key.clone();
        let job_key = bundle.job.key.clone();

        self.running.write().await.insert(
            fire_id,
            RunningJob {
                job_key: job_key.clone(),
                cancel: cancel.clone(),
            },
        );

        let ctx = JobExecutionContext::new(
            fire_id,
            bundle.job.clone(),
            bundle.trigger.clone(),
            bundle.scheduled_fire_time,
            bundle.fire_time,
            bundle.previous_fire_time,
            bundle.next_fire_time,
            0,
            cancel,
        );

        let outcome = self.execute_with_refires(&bundle, ctx).await;

        // Free the slot before the completing store call so acquisition can
        // overlap the write.
        drop(permit);

        let (instruction, final_job_data) = outcome;
        let mut job = bundle.job.clone();
        if let Some(data) = final_job_data {
            job.data = data;
        }
        if let Err(e) = self
            .store
            .triggered_job_complete(&bundle.trigger, &job, instruction)
            .await
        {
            error!(trigger = %trigger_key, job = %job_key, error = %e, "failed to complete fired job");
            self.signal
                .notify_error("completing fired job failed", &anyhow::anyhow!(e));
        }

        self.running.write().await.remove(&fire_id);
    }

    /// Execute the handler, honoring immediate re-fire requests, and derive
    /// the post-execution directive.
    async fn execute_with_refires(
        &self,
        bundle: &TriggerFiredBundle,
        ctx: JobExecutionContext,
    ) -> (CompletedExecutionInstruction, Option<crate::job::JobDataMap>) {
        let trigger_key = bundle.trigger.key.clone();
        let job_key = bundle.job.key.clone();

        let Some(handler) = self.registry.handler_for(&bundle.job.job_type) else {
            error!(
                job = %job_key,
                job_type = %bundle.job.job_type,
                "no handler registered for job type"
            );
            self.signal.emit(SchedulerEvent::JobExecutionFailed {
                trigger: trigger_key,
                job: job_key,
                error: format!("no handler registered for '{}'", bundle.job.job_type),
                refired: false,
            });
            return (CompletedExecutionInstruction::SetTriggerError, None);
        };

        let mut ctx = ctx;
        let mut refire_count = 0u32;
        loop {
            let started = self.clock.now();
            let result = handler.execute(ctx.clone()).await;
            let duration_ms = (self.clock.now() - started).num_milliseconds().max(0) as u64;

            match result {
                Ok(()) => {
                    debug!(trigger = %trigger_key, job = %job_key, duration_ms, "job executed");
                    self.signal.emit(SchedulerEvent::JobExecuted {
                        trigger: trigger_key.clone(),
                        job: job_key.clone(),
                        duration_ms,
                    });
                    let instruction = if bundle.trigger.may_fire_again() {
                        CompletedExecutionInstruction::Noop
                    } else {
                        CompletedExecutionInstruction::DeleteTrigger
                    };
                    return (instruction, Some(ctx.job_data()));
                }
                Err(e) => {
                    let failure = JobExecutionError::coerce(e);
                    let refire = failure.refire_immediately && !ctx.is_interrupt_requested();
                    warn!(
                        trigger = %trigger_key,
                        job = %job_key,
                        error = %failure,
                        refire,
                        "job execution failed"
                    );
                    self.signal.emit(SchedulerEvent::JobExecutionFailed {
                        trigger: trigger_key.clone(),
                        job: job_key.clone(),
                        error: failure.message.clone(),
                        refired: refire,
                    });

                    if refire {
                        refire_count += 1;
                        ctx = ctx.with_refire_count(refire_count);
                        continue;
                    }
                    let instruction = if failure.unschedule_all_triggers {
                        CompletedExecutionInstruction::SetAllJobTriggersComplete
                    } else if failure.unschedule_firing_trigger {
                        CompletedExecutionInstruction::SetTriggerComplete
                    } else if bundle.trigger.may_fire_again() {
                        CompletedExecutionInstruction::Noop
                    } else {
                        CompletedExecutionInstruction::DeleteTrigger
                    };
                    return (instruction, Some(ctx.job_data()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::context::JobExecutionContext;
    use crate::job::{Job, JobDefinition};
    use crate::registry::JobRegistry;
    use crate::schedule::{Schedule, SimpleSchedule};
    use crate::signal::SchedulerSignal;
    use crate::store::memory::MemoryJobStore;
    use crate::store::{JobStore, StoreContext};
    use crate::trigger::{Trigger, TriggerKey};
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountedFailure {
        attempts: AtomicU32,
        refires: u32,
    }

    #[async_trait::async_trait]
    impl Job for CountedFailure {
        async fn execute(&self, ctx: JobExecutionContext) -> anyhow::Result<()> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.refires {
                Err(JobExecutionError::with_refire(format!(
                    "attempt {attempt} (refire {})",
                    ctx.refire_count()
                ))
                .into())
            } else {
                Ok(())
            }
        }
    }

    async fn pool_with(handler: Arc<dyn Job>) -> (Arc<JobRunnerPool>, TriggerFiredBundle) {
        let signal = Arc::new(SchedulerSignal::new());
        let store = Arc::new(MemoryJobStore::default());
        store
            .initialize(StoreContext {
                instance_id: "test".into(),
                signaler: Arc::clone(&signal) as Arc<dyn crate::signal::SchedulerSignaler>,
                misfire_threshold: chrono::Duration::seconds(60),
                check_in_interval: chrono::Duration::seconds(15),
                check_in_tolerance: chrono::Duration::seconds(15),
            })
            .await
            .unwrap();

        let mut registry = JobRegistry::new();
        registry.register("counted", handler);

        let pool = Arc::new(JobRunnerPool::new(
            2,
            store,
            Arc::new(registry),
            signal,
            Arc::new(SystemClock),
        ));

        let job = JobDefinition::builder()
            .key(JobKey::named("j"))
            .job_type("counted")
            .build();
        let now = Utc::now();
        let mut trigger = Trigger::builder()
            .key(TriggerKey::named("t"))
            .job_key(job.key.clone())
            .start_time(now)
            .schedule(Schedule::Simple(SimpleSchedule::once()))
            .build();
        trigger.previous_fire_time = Some(now);

        let bundle = TriggerFiredBundle {
            fire_id: Uuid::new_v4(),
            trigger,
            job,
            calendar: None,
            fire_time: now,
            scheduled_fire_time: now,
            previous_fire_time: None,
            next_fire_time: None,
        };
        (pool, bundle)
    }

    #[tokio::test]
    async fn refire_request_reexecutes_until_success() {
        let handler = Arc::new(CountedFailure {
            attempts: AtomicU32::new(0),
            refires: 2,
        });
        let (pool, bundle) = pool_with(handler.clone()).await;

        let ctx = JobExecutionContext::new(
            bundle.fire_id,
            bundle.job.clone(),
            bundle.trigger.clone(),
            bundle.scheduled_fire_time,
            bundle.fire_time,
            None,
            None,
            0,
            CancellationToken::new(),
        );
        let (instruction, _) = pool.execute_with_refires(&bundle, ctx).await;

        assert_eq!(handler.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(instruction, CompletedExecutionInstruction::DeleteTrigger);
    }

    #[tokio::test]
    async fn unregistered_job_type_parks_trigger_in_error() {
        let (pool, mut bundle) = pool_with(Arc::new(CountedFailure {
            attempts: AtomicU32::new(0),
            refires: 0,
        }))
        .await;
        bundle.job.job_type = "unknown".into();

        let ctx = JobExecutionContext::new(
            bundle.fire_id,
            bundle.job.clone(),
            bundle.trigger.clone(),
            bundle.scheduled_fire_time,
            bundle.fire_time,
            None,
            None,
            0,
            CancellationToken::new(),
        );
        let (instruction, _) = pool.execute_with_refires(&bundle, ctx).await;
        assert_eq!(instruction, CompletedExecutionInstruction::SetTriggerError);
    }

    #[tokio::test]
    async fn interrupt_matches_by_job_key() {
        let (pool, _) = pool_with(Arc::new(CountedFailure {
            attempts: AtomicU32::new(0),
            refires: 0,
        }))
        .await;

        let cancel = CancellationToken::new();
        pool.running.write().await.insert(
            Uuid::new_v4(),
            RunningJob {
                job_key: JobKey::named("j"),
                cancel: cancel.clone(),
            },
        );

        assert!(pool.interrupt_job(&JobKey::named("j")).await);
        assert!(cancel.is_cancelled());
        assert!(!pool.interrupt_job(&JobKey::named("other")).await);
    }
}
