//! Test helpers: a steerable clock and jobs that record their invocations.
//!
//! These are exported so embedding applications can drive the engine in
//! their own test suites the same way this crate does.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Notify;

use crate::clock::Clock;
use crate::context::JobExecutionContext;
use crate::job::Job;

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One observed fire.
#[derive(Debug, Clone)]
pub struct RecordedFire {
    pub scheduled_fire_time: DateTime<Utc>,
    pub actual_fire_time: DateTime<Utc>,
    pub fire_id: uuid::Uuid,
}

/// Job that records every invocation and wakes anyone waiting on it.
#[derive(Default)]
pub struct RecordingJob {
    fires: Mutex<Vec<RecordedFire>>,
    fired: Notify,
}

impl RecordingJob {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fires(&self) -> Vec<RecordedFire> {
        self.fires.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn fire_count(&self) -> usize {
        self.fires.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Wait until at least `count` fires were recorded.
    pub async fn wait_for_fires(&self, count: usize, timeout: std::time::Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.fire_count() >= count {
                return true;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let _ = tokio::time::timeout(remaining, self.fired.notified()).await;
        }
    }
}

#[async_trait::async_trait]
impl Job for RecordingJob {
    async fn execute(&self, ctx: JobExecutionContext) -> anyhow::Result<()> {
        self.fires
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RecordedFire {
                scheduled_fire_time: ctx.scheduled_fire_time(),
                actual_fire_time: Utc::now(),
                fire_id: ctx.fire_id(),
            });
        self.fired.notify_waiters();
        Ok(())
    }
}

/// Job that holds a slot for a fixed wall-clock time and tracks overlap.
pub struct SlowJob {
    hold_for: std::time::Duration,
    in_flight: AtomicUsize,
    max_observed_overlap: AtomicUsize,
    completions: AtomicUsize,
}

impl SlowJob {
    pub fn holding_for(hold_for: std::time::Duration) -> Self {
        Self {
            hold_for,
            in_flight: AtomicUsize::new(0),
            max_observed_overlap: AtomicUsize::new(0),
            completions: AtomicUsize::new(0),
        }
    }

    /// Largest number of simultaneously running executions seen so far.
    pub fn max_overlap(&self) -> usize {
        self.max_observed_overlap.load(Ordering::SeqCst)
    }

    pub fn completions(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Job for SlowJob {
    async fn execute(&self, _ctx: JobExecutionContext) -> anyhow::Result<()> {
        let concurrent = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_observed_overlap
            .fetch_max(concurrent, Ordering::SeqCst);

        tokio::time::sleep(self.hold_for).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.completions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
