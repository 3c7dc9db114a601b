//! Wake-up signaling and the scheduler event stream.
//!
//! Stores and background timers talk back to the engine through the narrow
//! [`SchedulerSignaler`] interface. Only `signal_scheduling_change` needs
//! low-latency delivery: it wakes the scheduler loop out of its idle or
//! fire-wait sleep and carries a hint about how early the new candidate might
//! fire. Everything else is a fact about the lifecycle, published on a
//! broadcast channel that listeners may subscribe to; slow or absent
//! subscribers never block the engine.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Notify};

use crate::job::JobKey;
use crate::trigger::TriggerKey;

/// Facts about the scheduler lifecycle, published as they happen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SchedulerEvent {
    /// A trigger fired and its job was handed to a runner slot.
    TriggerFired {
        trigger: TriggerKey,
        job: JobKey,
        scheduled_fire_time: DateTime<Utc>,
    },

    /// A trigger's deadline slipped past the misfire threshold.
    TriggerMisfired { trigger: TriggerKey },

    /// A trigger will never fire again.
    TriggerFinalized { trigger: TriggerKey },

    /// Job execution finished cleanly.
    JobExecuted {
        trigger: TriggerKey,
        job: JobKey,
        duration_ms: u64,
    },

    /// Job execution failed.
    JobExecutionFailed {
        trigger: TriggerKey,
        job: JobKey,
        error: String,
        refired: bool,
    },

    /// A job was removed from the store.
    JobDeleted { job: JobKey },

    /// A failed instance's in-flight work was recovered.
    InstanceRecovered {
        instance_id: String,
        recovery_triggers: usize,
    },

    /// A non-fatal internal error the engine logged and survived.
    EngineError { message: String },
}

/// Narrow interface the store and timers use to reach the engine.
pub trait SchedulerSignaler: Send + Sync {
    /// Scheduling data changed in a way that can shift the next fire time.
    /// `candidate_earliest` hints how early the new candidate might fire.
    fn signal_scheduling_change(&self, candidate_earliest: Option<DateTime<Utc>>);

    fn notify_misfired(&self, trigger: &TriggerKey);

    fn notify_finalized(&self, trigger: &TriggerKey);

    fn notify_job_deleted(&self, job: &JobKey);

    fn notify_error(&self, message: &str, cause: &anyhow::Error);
}

/// Capacity of the event channel; laggy subscribers drop oldest events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// The engine's signaler: a loop wake-up plus the event broadcast.
pub struct SchedulerSignal {
    wake: Notify,
    candidate: Mutex<Option<DateTime<Utc>>>,
    events: broadcast::Sender<SchedulerEvent>,
}

impl Default for SchedulerSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerSignal {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            wake: Notify::new(),
            candidate: Mutex::new(None),
            events,
        }
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    /// Publish an event; send errors (no subscribers) are ignored.
    pub fn emit(&self, event: SchedulerEvent) {
        let _ = self.events.send(event);
    }

    /// Future resolving at the next `signal_scheduling_change`. A change
    /// signaled while nobody waits is remembered for the next waiter.
    pub async fn changed(&self) {
        self.wake.notified().await;
    }

    /// Take the earliest candidate fire time recorded since the last take.
    pub fn take_candidate(&self) -> Option<DateTime<Utc>> {
        self.candidate
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    fn record_candidate(&self, candidate: Option<DateTime<Utc>>) {
        if let Some(candidate) = candidate {
            let mut slot = self.candidate.lock().unwrap_or_else(|e| e.into_inner());
            match *slot {
                Some(existing) if existing <= candidate => {}
                _ => *slot = Some(candidate),
            }
        }
    }
}

impl SchedulerSignaler for SchedulerSignal {
    fn signal_scheduling_change(&self, candidate_earliest: Option<DateTime<Utc>>) {
        self.record_candidate(candidate_earliest);
        self.wake.notify_one();
    }

    fn notify_misfired(&self, trigger: &TriggerKey) {
        self.emit(SchedulerEvent::TriggerMisfired {
            trigger: trigger.clone(),
        });
    }

    fn notify_finalized(&self, trigger: &TriggerKey) {
        self.emit(SchedulerEvent::TriggerFinalized {
            trigger: trigger.clone(),
        });
    }

    fn notify_job_deleted(&self, job: &JobKey) {
        self.emit(SchedulerEvent::JobDeleted { job: job.clone() });
    }

    fn notify_error(&self, message: &str, cause: &anyhow::Error) {
        self.emit(SchedulerEvent::EngineError {
            message: format!("{message}: {cause:#}"),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn earliest_candidate_wins() {
        let signal = SchedulerSignal::new();
        let early = Utc.with_ymd_and_hms(2024, 6, 3, 9, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 6, 3, 10, 0, 0).unwrap();

        signal.signal_scheduling_change(Some(late));
        signal.signal_scheduling_change(Some(early));
        assert_eq!(signal.take_candidate(), Some(early));
        assert_eq!(signal.take_candidate(), None);
    }

    #[tokio::test]
    async fn change_signaled_before_wait_is_not_lost() {
        let signal = SchedulerSignal::new();
        signal.signal_scheduling_change(None);

        // Must resolve immediately thanks to the stored permit.
        tokio::time::timeout(std::time::Duration::from_millis(50), signal.changed())
            .await
            .expect("wake-up was lost");
    }

    #[tokio::test]
    async fn events_reach_subscribers() {
        let signal = SchedulerSignal::new();
        let mut rx = signal.subscribe();

        signal.notify_finalized(&TriggerKey::named("t"));
        match rx.recv().await.unwrap() {
            SchedulerEvent::TriggerFinalized { trigger } => {
                assert_eq!(trigger, TriggerKey::named("t"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
