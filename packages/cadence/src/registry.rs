//! Registry mapping job type strings to handlers.
//!
//! Each application registers its handlers at startup. When a trigger fires,
//! the runner pool looks up the job definition's `job_type` here and invokes
//! the handler; an unregistered type fails the execution without touching the
//! schedule.

use std::collections::HashMap;
use std::sync::Arc;

use crate::job::Job;

/// Registry that maps job type strings to handler instances.
///
/// # Example
///
/// ```ignore
/// let mut registry = JobRegistry::new();
/// registry.register("email:digest", Arc::new(DigestJob::new(mailer)));
///
/// let scheduler = Scheduler::builder()
///     .registry(registry)
///     .build()
///     .await?;
/// ```
#[derive(Default)]
pub struct JobRegistry {
    handlers: HashMap<String, Arc<dyn Job>>,
}

impl JobRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for a job type. A second registration for the same
    /// type replaces the first.
    pub fn register(&mut self, job_type: impl Into<String>, handler: Arc<dyn Job>) {
        self.handlers.insert(job_type.into(), handler);
    }

    /// Handler for the given job type, if registered.
    pub fn handler_for(&self, job_type: &str) -> Option<Arc<dyn Job>> {
        self.handlers.get(job_type).cloned()
    }

    /// Check if a job type is registered.
    pub fn is_registered(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Get all registered job types.
    pub fn registered_types(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}

/// Thread-safe registry wrapped in Arc.
pub type SharedJobRegistry = Arc<JobRegistry>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::JobExecutionContext;

    struct NoopJob;

    #[async_trait::async_trait]
    impl Job for NoopJob {
        async fn execute(&self, _ctx: JobExecutionContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn register_and_check() {
        let mut registry = JobRegistry::new();
        registry.register("noop", Arc::new(NoopJob));

        assert!(registry.is_registered("noop"));
        assert!(!registry.is_registered("unknown"));
        assert!(registry.handler_for("noop").is_some());
    }

    #[test]
    fn registered_types_lists_entries() {
        let mut registry = JobRegistry::new();
        registry.register("noop", Arc::new(NoopJob));

        assert_eq!(registry.registered_types(), vec!["noop"]);
    }
}
