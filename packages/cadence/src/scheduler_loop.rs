//! The acquire-wait-fire pipeline.
//!
//! One long-lived task per scheduler instance:
//!
//! ```text
//! loop
//!     ├─► wait for a free runner slot
//!     ├─► acquire_next_triggers(now + idle_wait, n, batch_time_window)
//!     ├─► none?  sleep until idle_wait elapses or the signaler wakes us
//!     ├─► sleep until the earliest acquired fire is due
//!     │     (an earlier candidate signaled meanwhile releases the batch)
//!     ├─► triggers_fired(batch)
//!     └─► hand each bundle to a runner slot
//! ```
//!
//! A wake-up from the signaler only ever cancels the idle or fire-wait
//! sleeps; it never interrupts a running job. Store failures are retried in
//! place a bounded number of times with backoff, after which the loop pauses
//! for the configured interval and starts over; the loop itself never exits
//! on an error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::SharedClock;
use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::runner::JobRunnerPool;
use crate::signal::{SchedulerEvent, SchedulerSignal, SchedulerSignaler};
use crate::store::{SharedJobStore, TriggerFiredResult};
use crate::trigger::Trigger;

/// Gate the façade uses to pause and resume acquisition (stand-by mode).
pub(crate) struct AcquisitionGate {
    running: AtomicBool,
    resumed: Notify,
}

impl AcquisitionGate {
    pub(crate) fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            resumed: Notify::new(),
        }
    }

    pub(crate) fn open(&self) {
        self.running.store(true, Ordering::SeqCst);
        self.resumed.notify_waiters();
    }

    pub(crate) fn close(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub(crate) fn is_open(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

pub(crate) struct SchedulerLoop {
    store: SharedJobStore,
    pool: Arc<JobRunnerPool>,
    signal: Arc<SchedulerSignal>,
    clock: SharedClock,
    config: SchedulerConfig,
    gate: Arc<AcquisitionGate>,
    shutdown: CancellationToken,
}

impl SchedulerLoop {
    pub(crate) fn new(
        store: SharedJobStore,
        pool: Arc<JobRunnerPool>,
        signal: Arc<SchedulerSignal>,
        clock: SharedClock,
        config: SchedulerConfig,
        gate: Arc<AcquisitionGate>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            pool,
            signal,
            clock,
            config,
            gate,
            shutdown,
        }
    }

    pub(crate) async fn run(self) {
        info!(
            instance_id = %self.config.instance_id,
            idle_wait_ms = self.config.idle_wait.as_millis() as u64,
            max_batch_size = self.config.max_batch_size,
            "scheduler loop starting"
        );

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            if !self.gate.is_open() {
                tokio::select! {
                    _ = self.gate.resumed.notified() => {}
                    _ = self.shutdown.cancelled() => break,
                }
                continue;
            }

            // Hold a slot before acquiring anything.
            let permit = tokio::select! {
                permit = self.pool.acquire_slot() => match permit {
                    Some(p) => p,
                    None => break,
                },
                _ = self.shutdown.cancelled() => break,
            };

            // Batch bounded by free slots and configuration.
            let batch_limit = (self.pool.available_slots() + 1)
                .min(self.config.max_batch_size)
                .max(1);
            let now = self.clock.now();
            let no_later_than = now + chrono_ms(self.config.idle_wait);
            let window = chrono_ms(self.config.batch_time_window);

            let batch = match self
                .with_store_retries(|| {
                    self.store
                        .acquire_next_triggers(no_later_than, batch_limit, window)
                })
                .await
            {
                Some(batch) => batch,
                None => continue,
            };

            if batch.is_empty() {
                drop(permit);
                self.idle_wait().await;
                continue;
            }

            debug!(count = batch.len(), "acquired triggers");

            // Wait until the earliest acquired fire is due.
            if !self.wait_until_due(&batch).await {
                self.release_batch(batch).await;
                continue;
            }

            // Fire and hand off to runner slots.
            let results = match self
                .with_store_retries(|| self.store.triggers_fired(batch.clone()))
                .await
            {
                Some(results) => results,
                None => {
                    self.release_batch(batch).await;
                    continue;
                }
            };

            let mut permit = Some(permit);
            for result in results {
                match result {
                    TriggerFiredResult::Fired(bundle) => {
                        self.signal.emit(SchedulerEvent::TriggerFired {
                            trigger: bundle.trigger.key.clone(),
                            job: bundle.job.key.clone(),
                            scheduled_fire_time: bundle.scheduled_fire_time,
                        });
                        let slot = match permit.take() {
                            Some(held) => held,
                            None => match self.pool.acquire_slot().await {
                                Some(p) => p,
                                None => break,
                            },
                        };
                        self.pool.spawn(*bundle, slot, &self.shutdown);
                    }
                    TriggerFiredResult::Removed { key } => {
                        debug!(trigger = %key, "trigger vanished between acquire and fire");
                    }
                }
            }
        }

        info!(instance_id = %self.config.instance_id, "scheduler loop stopped");
    }

    /// Sleep until the idle wait elapses, the signaler wakes us, or shutdown.
    async fn idle_wait(&self) {
        tokio::select! {
            _ = tokio::time::sleep(self.config.idle_wait) => {}
            _ = self.signal.changed() => {
                self.signal.take_candidate();
            }
            _ = self.shutdown.cancelled() => {}
        }
    }

    /// Wait until the earliest fire of the batch is due. Returns false when
    /// the batch should be released instead of fired (earlier candidate
    /// signaled, or shutdown).
    async fn wait_until_due(&self, batch: &[Trigger]) -> bool {
        let earliest = batch
            .iter()
            .filter_map(|t| t.next_fire_time)
            .min()
            .unwrap_or_else(|| self.clock.now());

        loop {
            let now = self.clock.now();
            let remaining = (earliest - now).num_milliseconds();
            if remaining <= 0 {
                return true;
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(remaining as u64)) => return true,
                _ = self.signal.changed() => {
                    if let Some(candidate) = self.signal.take_candidate() {
                        if candidate < earliest {
                            debug!(
                                candidate = %candidate,
                                earliest = %earliest,
                                "earlier candidate signaled, releasing batch"
                            );
                            return false;
                        }
                    }
                }
                _ = self.shutdown.cancelled() => return false,
            }
        }
    }

    async fn release_batch(&self, batch: Vec<Trigger>) {
        for trigger in batch {
            if let Err(e) = self.store.release_acquired_trigger(&trigger).await {
                warn!(trigger = %trigger.key, error = %e, "failed to release acquired trigger");
            }
        }
    }

    /// Run a store operation with bounded in-place retries. `None` means the
    /// retries were exhausted and the loop already paused; the caller should
    /// start its cycle over.
    async fn with_store_retries<T, F, Fut>(&self, mut op: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, SchedulerError>>,
    {
        let mut backoff = Duration::from_millis(100);
        for attempt in 0..self.config.db_retry_attempts.max(1) {
            match op().await {
                Ok(value) => return Some(value),
                Err(e) if e.is_retryable() => {
                    warn!(attempt, error = %e, "store operation failed, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(5));
                }
                Err(e) => {
                    error!(error = %e, "store operation failed");
                    self.signal
                        .notify_error("scheduler loop store operation failed", &anyhow::anyhow!(e));
                    return None;
                }
            }
        }
        error!(
            pause_ms = self.config.db_failure_retry_interval.as_millis() as u64,
            "store retries exhausted, pausing before the next cycle"
        );
        tokio::select! {
            _ = tokio::time::sleep(self.config.db_failure_retry_interval) => {}
            _ = self.shutdown.cancelled() => {}
        }
        None
    }
}

fn chrono_ms(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(d.as_millis() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_starts_closed() {
        let gate = AcquisitionGate::new();
        assert!(!gate.is_open());
        gate.open();
        assert!(gate.is_open());
        gate.close();
        assert!(!gate.is_open());
    }
}
