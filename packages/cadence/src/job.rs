//! Job model: identity, data map, definition, and the execute seam.
//!
//! A [`JobDefinition`] describes *what* to run and under which policies; it
//! carries no schedule. Schedules live on triggers, and several triggers may
//! reference one job. The [`Job`] trait is the single seam application code
//! implements; handlers are registered by job type string in the
//! [`JobRegistry`](crate::registry::JobRegistry).

use std::collections::BTreeMap;
use std::fmt;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use typed_builder::TypedBuilder;

use crate::context::JobExecutionContext;

/// Group name used when none is given.
pub const DEFAULT_GROUP: &str = "DEFAULT";

/// Identity of a job: `(name, group)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub name: String,
    pub group: String,
}

impl JobKey {
    pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
        }
    }

    /// Key in the default group.
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, DEFAULT_GROUP)
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

/// String-keyed data map carried by jobs and triggers.
///
/// Values are JSON so any store backend can persist the map without knowing
/// the application's types. A trigger's map overrides the job's entries at
/// firing time (see [`JobExecutionContext::merged_data`]).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobDataMap(BTreeMap<String, Value>);

impl JobDataMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(Value::as_i64)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Overlay `other` on top of this map, entry by entry.
    pub fn merged_with(&self, other: &JobDataMap) -> JobDataMap {
        let mut out = self.clone();
        for (k, v) in other.iter() {
            out.0.insert(k.clone(), v.clone());
        }
        out
    }
}

impl FromIterator<(String, Value)> for JobDataMap {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Durable description of a job and its execution policies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct JobDefinition {
    pub key: JobKey,

    /// Handler discriminator; must match a registered handler at fire time.
    pub job_type: String,

    #[builder(default, setter(strip_option))]
    pub description: Option<String>,

    #[builder(default)]
    pub data: JobDataMap,

    /// Keep the job stored even when it has no triggers.
    #[builder(default = false)]
    pub durable: bool,

    /// Write the (possibly mutated) data map back after each execution.
    #[builder(default = false)]
    pub persist_data_after_execution: bool,

    /// At most one execution of this job at a time, cluster-wide.
    #[builder(default = false)]
    pub concurrent_execution_disallowed: bool,

    /// After a crash mid-execution, synthesize a replacement fire.
    #[builder(default = false)]
    pub requests_recovery: bool,
}

/// The seam application code implements.
///
/// Handlers receive an owned [`JobExecutionContext`] and return
/// `anyhow::Result`; returning a
/// [`JobExecutionError`](crate::error::JobExecutionError) steers
/// post-execution behavior, any other error is treated as a plain failure.
/// Long-running handlers should poll `ctx.is_interrupt_requested()` and bail
/// out cooperatively.
#[async_trait::async_trait]
pub trait Job: Send + Sync {
    async fn execute(&self, ctx: JobExecutionContext) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_key_display_is_group_dot_name() {
        let key = JobKey::new("cleanup", "maintenance");
        assert_eq!(key.to_string(), "maintenance.cleanup");
    }

    #[test]
    fn named_key_uses_default_group() {
        assert_eq!(JobKey::named("cleanup").group, DEFAULT_GROUP);
    }

    #[test]
    fn data_map_merge_prefers_overlay() {
        let mut base = JobDataMap::new();
        base.put("retries", 3);
        base.put("target", "base");

        let mut overlay = JobDataMap::new();
        overlay.put("target", "overlay");

        let merged = base.merged_with(&overlay);
        assert_eq!(merged.get_i64("retries"), Some(3));
        assert_eq!(merged.get_str("target"), Some("overlay"));
    }

    #[test]
    fn data_map_roundtrips_through_json() {
        let mut map = JobDataMap::new();
        map.put("flag", true);
        map.put("count", 7);

        let json = serde_json::to_string(&map).unwrap();
        let back: JobDataMap = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
    }

    #[test]
    fn definition_builder_defaults_are_off() {
        let job = JobDefinition::builder()
            .key(JobKey::named("cleanup"))
            .job_type("cleanup")
            .build();

        assert!(!job.durable);
        assert!(!job.persist_data_after_execution);
        assert!(!job.concurrent_execution_disallowed);
        assert!(!job.requests_recovery);
    }
}
