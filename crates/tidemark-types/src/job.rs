//! Job specification model.
//!
//! A [`JobSpec`] is the typed form of one declarative job document:
//! trigger behavior, metadata, and the task union describing what to move
//! where. Specs are immutable once loaded by the registry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::source::TaskSpec;

/// Opaque, namespace-qualified job identifier (e.g. `"bronze.shop.orders"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobName(String);

impl JobName {
    /// Create a new job name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Borrow the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl<S: Into<String>> From<S> for JobName {
    fn from(value: S) -> Self {
        Self(value.into())
    }
}

/// Fixed-delay retry policy for failed run attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Number of retries after the first attempt. Zero means fail fast.
    #[serde(default)]
    pub count: u32,
    /// Delay between attempts, in minutes.
    #[serde(default = "default_retry_delay")]
    pub delay_in_minute: u64,
}

fn default_retry_delay() -> u64 {
    5
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            count: 0,
            delay_in_minute: default_retry_delay(),
        }
    }
}

/// Trigger, concurrency, and retry behavior for a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BehaviorSpec {
    /// Cron trigger expression. Both 5-field and 6-field forms are accepted.
    pub cron: String,
    /// Logical times before this instant never fire.
    pub start_date: DateTime<Utc>,
    /// When false, missed intervals collapse to the most recent one.
    #[serde(default)]
    pub catchup: bool,
    /// When true, a run for logical time T waits for T-1 to reach a
    /// terminal state, and a failed predecessor blocks successors.
    #[serde(default)]
    pub depends_on_past: bool,
    /// Wall-clock budget for one attempt, in minutes.
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u64,
    /// Cap on concurrently non-terminal runs of this job. Must be >= 1.
    #[serde(default = "default_max_active_runs")]
    pub max_active_runs: u32,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_timeout_minutes() -> u64 {
    60
}

fn default_max_active_runs() -> u32 {
    1
}

/// One declarative ingestion job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Globally unique, namespace-qualified name.
    pub name: JobName,
    pub behavior: BehaviorSpec,
    /// Scheduling hint only: higher weight dispatches first among queued
    /// runs competing for global run slots.
    #[serde(default = "default_priority_weight")]
    pub priority_weight: i32,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub owner: Option<String>,
    pub task: TaskSpec,
}

fn default_priority_weight() -> i32 {
    1
}

impl JobSpec {
    /// Attempt timeout as a [`std::time::Duration`].
    #[must_use]
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.behavior.timeout_minutes * 60)
    }

    /// Retry delay as a [`std::time::Duration`].
    #[must_use]
    pub fn retry_delay(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.behavior.retry.delay_in_minute * 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_name_display_and_as_str() {
        let name = JobName::new("bronze.shop.orders");
        assert_eq!(name.as_str(), "bronze.shop.orders");
        assert_eq!(name.to_string(), "bronze.shop.orders");
    }

    #[test]
    fn job_name_eq_and_hash() {
        use std::collections::HashSet;
        let a = JobName::new("j1");
        let b = JobName::new("j1");
        assert_eq!(a, b);
        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn retry_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.count, 0);
        assert_eq!(policy.delay_in_minute, 5);
    }

    #[test]
    fn behavior_spec_deserializes_with_defaults() {
        let yaml = r#"
cron: "0 2 * * *"
start_date: "2026-01-01T00:00:00Z"
"#;
        let behavior: BehaviorSpec = serde_yaml::from_str(yaml).unwrap();
        assert!(!behavior.catchup);
        assert!(!behavior.depends_on_past);
        assert_eq!(behavior.max_active_runs, 1);
        assert_eq!(behavior.timeout_minutes, 60);
        assert_eq!(behavior.retry.count, 0);
    }
}
