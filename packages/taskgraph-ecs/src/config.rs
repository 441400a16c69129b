//! Scheduler configuration.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What to do with explicit ordering hints between tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HintPolicy {
    /// Every hint becomes an edge.
    #[default]
    Enforce,
    /// Hints only order tasks whose access conflicts anyway; the rest are
    /// dropped.
    ConflictsOnly,
}

/// Settings for a `Scheduler`.
///
/// Every field has a default, so a partial document deserializes:
///
/// ```
/// use taskgraph_ecs::{HintPolicy, SchedulerConfig};
///
/// let config: SchedulerConfig = serde_json::from_str(r#"{ "workers": 2 }"#).unwrap();
/// assert_eq!(config.workers, 2);
/// assert_eq!(config.hint_policy, HintPolicy::Enforce);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of worker threads. Zero means one.
    pub workers: usize,
    /// How ordering hints are treated.
    pub hint_policy: HintPolicy,
    /// Check at runtime that no two running tasks hold conflicting access.
    pub access_checks: bool,
    /// Log the running tasks when none completes for this many milliseconds.
    pub stall_warning_ms: Option<u64>,
    /// Prefix of worker thread names.
    pub thread_name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            workers: std::thread::available_parallelism().map_or(1, NonZeroUsize::get),
            hint_policy: HintPolicy::default(),
            access_checks: cfg!(debug_assertions),
            stall_warning_ms: Some(5_000),
            thread_name: "taskgraph-worker".to_owned(),
        }
    }
}

impl SchedulerConfig {
    /// Set the number of worker threads.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the hint policy.
    #[must_use]
    pub fn with_hint_policy(mut self, hint_policy: HintPolicy) -> Self {
        self.hint_policy = hint_policy;
        self
    }

    /// Turn the runtime access checks on or off.
    #[must_use]
    pub fn with_access_checks(mut self, access_checks: bool) -> Self {
        self.access_checks = access_checks;
        self
    }

    /// Set or clear the stall warning interval.
    #[must_use]
    pub fn with_stall_warning(mut self, stall_warning: Option<Duration>) -> Self {
        self.stall_warning_ms = stall_warning.map(|d| d.as_millis() as u64);
        self
    }

    /// Set the worker thread name prefix.
    #[must_use]
    pub fn with_thread_name(mut self, thread_name: impl Into<String>) -> Self {
        self.thread_name = thread_name.into();
        self
    }

    /// The stall warning interval, if any.
    pub fn stall_warning(&self) -> Option<Duration> {
        self.stall_warning_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    /// The effective number of worker threads.
    pub fn worker_count(&self) -> usize {
        self.workers.max(1)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_builders() {
        let config = SchedulerConfig::default()
            .with_workers(0)
            .with_hint_policy(HintPolicy::ConflictsOnly)
            .with_access_checks(true)
            .with_stall_warning(Some(Duration::from_millis(250)))
            .with_thread_name("sim");

        assert_eq!(config.worker_count(), 1);
        assert_eq!(config.hint_policy, HintPolicy::ConflictsOnly);
        assert!(config.access_checks);
        assert_eq!(config.stall_warning(), Some(Duration::from_millis(250)));
        assert_eq!(config.thread_name, "sim");
    }

    #[test]
    fn test_deserialize() {
        let config: SchedulerConfig = serde_json::from_str(r#"{
            "workers": 3,
            "hint_policy": "conflicts_only",
            "stall_warning_ms": null
        }"#).unwrap();

        assert_eq!(config.workers, 3);
        assert_eq!(config.hint_policy, HintPolicy::ConflictsOnly);
        assert_eq!(config.stall_warning(), None);
        assert_eq!(config.thread_name, SchedulerConfig::default().thread_name);
    }
}
