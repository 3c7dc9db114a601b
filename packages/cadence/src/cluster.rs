//! Cluster membership and fail-over recovery.
//!
//! Every instance heartbeats its liveness record on a fixed period. A peer
//! whose record is older than its own interval plus a tolerance is failed;
//! the first instance to notice recovers it: recovery triggers for executing
//! fires of jobs that request it, the underlying triggers back to a runnable
//! state, and the peer's fired rows and liveness record removed. The store
//! runs the whole recovery under its scheduling lock, so concurrent sweeps on
//! two survivors cannot both recover the same peer.
//!
//! Membership is anchored on the store and deliberately weakly consistent;
//! clock skew between nodes beyond the check-in interval risks false failure
//! detection, which the tolerance absorbs.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::clock::SharedClock;
use crate::config::SchedulerConfig;
use crate::signal::{SchedulerEvent, SchedulerSignal, SchedulerSignaler};
use crate::store::SharedJobStore;

pub(crate) struct ClusterManager {
    store: SharedJobStore,
    signal: Arc<SchedulerSignal>,
    clock: SharedClock,
    config: SchedulerConfig,
    shutdown: CancellationToken,
}

impl ClusterManager {
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

    pub(crate) async fn run(self) {
        info!(
            instance_id = %self.config.instance_id,
            check_in_interval_ms = self.config.check_in_interval.as_millis() as u64,
            "cluster manager starting"
        );

        // First heartbeat before anyone can consider us failed.
        self.check_in().await;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.check_in_interval) => {}
                _ = self.shutdown.cancelled() => break,
            }

            self.check_in().await;
            self.recover_failed_peers().await;
        }

        info!(instance_id = %self.config.instance_id, "cluster manager stopped");
    }

    async fn check_in(&self) {
        if let Err(e) = self.store.check_in(self.clock.now()).await {
            error!(error = %e, "cluster check-in failed");
            self.signal
                .notify_error("cluster check-in failed", &anyhow::anyhow!(e));
        }
    }

    async fn recover_failed_peers(&self) {
        let failed = match self.store.find_failed_instances(self.clock.now()).await {
            Ok(failed) => failed,
            Err(e) => {
                error!(error = %e, "failed-instance scan failed");
                return;
            }
        };

        for peer in failed {
            warn!(
                failed_instance = %peer.instance_id,
                last_check_in = %peer.last_check_in,
                "peer missed its check-in, recovering its in-flight work"
            );
            match self.store.recover_jobs(&peer.instance_id).await {
                Ok(report) => {
                    info!(
                        failed_instance = %peer.instance_id,
                        recovery_triggers = report.recovery_triggers,
                        released_triggers = report.released_triggers,
                        "peer recovered"
                    );
                    self.signal.emit(SchedulerEvent::InstanceRecovered {
                        instance_id: peer.instance_id.clone(),
                        recovery_triggers: report.recovery_triggers,
                    });
                }
                Err(e) => {
                    error!(
                        failed_instance = %peer.instance_id,
                        error = %e,
                        "peer recovery failed"
                    );
                    self.signal
                        .notify_error("cluster peer recovery failed", &anyhow::anyhow!(e));
                }
            }
        }
    }
}
