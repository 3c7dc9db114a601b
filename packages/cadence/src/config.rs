//! Scheduler configuration.

use std::time::Duration;

use uuid::Uuid;

/// Tuning knobs for one scheduler instance.
///
/// The defaults suit a clustered deployment with a relational store; tests
/// and single-process embeddings usually shrink the waits.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Logical scheduler name, shared by all instances of one cluster.
    pub scheduler_name: String,
    /// Unique id of this instance within the cluster.
    pub instance_id: String,
    /// Number of runner slots executing jobs concurrently.
    pub worker_slots: usize,
    /// How far ahead the loop looks when acquiring, and how long it idles
    /// with nothing due.
    pub idle_wait: Duration,
    /// Upper bound on one acquire batch.
    pub max_batch_size: usize,
    /// Extra window past `now + idle_wait` a batch may reach into. Zero means
    /// strictly-due only.
    pub batch_time_window: Duration,
    /// How far a deadline may slip before the trigger counts as misfired.
    pub misfire_threshold: Duration,
    /// Upper bound on misfires reclassified per sweep.
    pub max_misfires_per_sweep: usize,
    /// Bounded in-place retries of a failing store operation.
    pub db_retry_attempts: u32,
    /// Pause after the in-place retries are exhausted.
    pub db_failure_retry_interval: Duration,
    /// Whether this instance participates in a clustered store.
    pub clustered: bool,
    /// Cluster heartbeat period.
    pub check_in_interval: Duration,
    /// Slack added to a peer's interval before declaring it failed. Keep at
    /// least one full interval to tolerate clock skew between nodes.
    pub check_in_tolerance: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scheduler_name: "cadence".to_string(),
            instance_id: default_instance_id(),
            worker_slots: 10,
            idle_wait: Duration::from_secs(30),
            max_batch_size: 1,
            batch_time_window: Duration::ZERO,
            misfire_threshold: Duration::from_secs(60),
            max_misfires_per_sweep: 20,
            db_retry_attempts: 4,
            db_failure_retry_interval: Duration::from_secs(15),
            clustered: false,
            check_in_interval: Duration::from_secs(15),
            check_in_tolerance: Duration::from_secs(15),
        }
    }
}

impl SchedulerConfig {
    /// Create a config with a specific instance id.
    pub fn with_instance_id(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            ..Default::default()
        }
    }

    /// Enable clustering with the given heartbeat period; the failure
    /// tolerance follows the period.
    pub fn with_clustering(mut self, check_in_interval: Duration) -> Self {
        self.clustered = true;
        self.check_in_interval = check_in_interval;
        self.check_in_tolerance = check_in_interval;
        self
    }
}

fn default_instance_id() -> String {
    format!("instance-{}", Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = SchedulerConfig::default();
        assert_eq!(config.worker_slots, 10);
        assert_eq!(config.idle_wait, Duration::from_secs(30));
        assert_eq!(config.max_batch_size, 1);
        assert_eq!(config.batch_time_window, Duration::ZERO);
        assert_eq!(config.misfire_threshold, Duration::from_secs(60));
        assert_eq!(config.check_in_interval, Duration::from_secs(15));
        assert!(!config.clustered);
    }

    #[test]
    fn instance_ids_are_unique_by_default() {
        let a = SchedulerConfig::default();
        let b = SchedulerConfig::default();
        assert_ne!(a.instance_id, b.instance_id);
    }

    #[test]
    fn clustering_sets_tolerance_to_one_interval() {
        let config =
            SchedulerConfig::default().with_clustering(Duration::from_secs(5));
        assert!(config.clustered);
        assert_eq!(config.check_in_tolerance, Duration::from_secs(5));
    }
}
