//! Background sweeper reclassifying triggers whose deadlines slipped.
//!
//! A trigger has misfired when it sits in `Waiting` with
//! `next_fire_time + misfire_threshold < now`. Each sweep asks the store to
//! reclassify a bounded batch under its scheduling lock; when the batch came
//! back full the sweeper loops immediately, otherwise it sleeps
//! `min(threshold, 60s)`. Errors are logged and the sweeper keeps going.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::clock::SharedClock;
use crate::config::SchedulerConfig;
use crate::signal::{SchedulerSignal, SchedulerSignaler};
use crate::store::SharedJobStore;

pub(crate) struct MisfireHandler {
    store: SharedJobStore,
    signal: Arc<SchedulerSignal>,
    clock: SharedClock,
    config: SchedulerConfig,
    shutdown: CancellationToken,
}

impl MisfireHandler {
    pub(crate) fn new(
        store: SharedJobStore,
        signal: Arc<SchedulerSignal>,
        clock: SharedClock,
        config: SchedulerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            signal,
            clock,
            config,
            shutdown,
        }
    }

    fn sleep_interval(&self) -> Duration {
        self.config.misfire_threshold.min(Duration::from_secs(60))
    }

    pub(crate) async fn run(self) {
        info!(
            threshold_ms = self.config.misfire_threshold.as_millis() as u64,
            "misfire handler starting"
        );
        let threshold = chrono::Duration::milliseconds(
            self.config.misfire_threshold.as_millis() as i64,
        );

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let cutoff = self.clock.now() - threshold;
            match self
                .store
                .recover_misfires(cutoff, self.config.max_misfires_per_sweep)
                .await
            {
                Ok(sweep) => {
                    if sweep.processed > 0 {
                        debug!(
                            processed = sweep.processed,
                            has_more = sweep.has_more,
                            "misfire sweep reclassified triggers"
                        );
                    }
                    if let Some(earliest) = sweep.earliest_new_time {
                        self.signal.signal_scheduling_change(Some(earliest));
                    }
                    // A full batch means more misfires are pending; go again
                    // without sleeping.
                    if sweep.has_more {
                        continue;
                    }
                }
                Err(e) => {
                    error!(error = %e, "misfire sweep failed");
                    self.signal
                        .notify_error("misfire sweep failed", &anyhow::anyhow!(e));
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.sleep_interval()) => {}
                _ = self.shutdown.cancelled() => break,
            }
        }

        info!("misfire handler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::store::memory::MemoryJobStore;

    #[test]
    fn sleep_interval_is_capped_at_one_minute() {
        let signal = Arc::new(SchedulerSignal::new());
        let mut config = SchedulerConfig::default();
        config.misfire_threshold = Duration::from_secs(300);
        let handler = MisfireHandler::new(
            Arc::new(MemoryJobStore::default()),
            signal,
            Arc::new(SystemClock),
            config,
            CancellationToken::new(),
        );
        assert_eq!(handler.sleep_interval(), Duration::from_secs(60));
    }

    #[test]
    fn short_threshold_drives_the_sweep_cadence() {
        let signal = Arc::new(SchedulerSignal::new());
        let mut config = SchedulerConfig::default();
        config.misfire_threshold = Duration::from_millis(250);
        let handler = MisfireHandler::new(
            Arc::new(MemoryJobStore::default()),
            signal,
            Arc::new(SystemClock),
            config,
            CancellationToken::new(),
        );
        assert_eq!(handler.sleep_interval(), Duration::from_millis(250));
    }
}
