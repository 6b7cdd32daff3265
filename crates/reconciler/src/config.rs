//! Controller configuration.

use std::time::Duration;

use keel_core::config::duration_secs;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Retry policy for transient cluster failures during apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub use_jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_ms: 500,
            max_backoff_ms: 30_000,
            use_jitter: true,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_attempts: u32, base_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            max_attempts,
            base_backoff_ms,
            max_backoff_ms,
            use_jitter: true,
        }
    }

    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.use_jitter = false;
        self
    }

    /// Delay before retrying after the given (1-based) failed attempt.
    #[must_use]
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let factor = 2_u64.saturating_pow(attempt.saturating_sub(1));
        let exponential_delay = self.base_backoff_ms.saturating_mul(factor);
        let capped_delay = exponential_delay.min(self.max_backoff_ms);

        if self.use_jitter {
            let jitter_range = (capped_delay / 4).max(1);
            let jitter = rand::random::<u64>() % jitter_range.saturating_mul(2);
            Duration::from_millis(capped_delay.saturating_add(jitter))
        } else {
            Duration::from_millis(capped_delay)
        }
    }

    #[must_use]
    pub fn is_retryable(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Configuration for the reconciliation controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// How often each application re-resolves its source revision.
    #[serde(with = "duration_secs")]
    pub sync_interval: Duration,
    /// How often the live-state observer polls the cluster.
    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,
    /// How long observation may fail before the snapshot is marked stale.
    #[serde(with = "duration_secs")]
    pub stale_after: Duration,
    /// How often health is re-evaluated.
    #[serde(with = "duration_secs")]
    pub health_interval: Duration,
    /// How long a resource may stay below target before it is Degraded.
    #[serde(with = "duration_secs")]
    pub health_grace_period: Duration,
    /// Per-attempt timeout for a single cluster call during apply. A call
    /// that does not answer in time is retried as `ClusterUnreachable`.
    #[serde(with = "duration_secs")]
    pub apply_timeout: Duration,
    /// How long a sync waits for an applied workload to become ready before
    /// reporting it Progressing. Zero reports the cluster's first answer.
    #[serde(with = "duration_secs")]
    pub converge_timeout: Duration,
    /// Retry policy for transient apply failures.
    pub retry: RetryPolicy,
    /// Number of sync operations kept per application.
    pub history_limit: usize,
    /// Number of manifest sets kept in the fetch cache.
    pub manifest_cache_capacity: u64,
    /// JSON pointers ignored by the diff, on top of the built-in list.
    pub ignore_differences: Vec<String>,
    /// Suspend automated sync while an application is Degraded.
    pub suspend_on_degraded: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(180),
            poll_interval: Duration::from_secs(180),
            stale_after: Duration::from_secs(600),
            health_interval: Duration::from_secs(30),
            health_grace_period: Duration::from_secs(600),
            apply_timeout: Duration::from_secs(30),
            converge_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            history_limit: 10,
            manifest_cache_capacity: 256,
            ignore_differences: Vec::new(),
            suspend_on_degraded: false,
        }
    }
}

impl ControllerConfig {
    /// Check the configuration for values the controller cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` describing the first bad value.
    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("sync_interval", self.sync_interval),
            ("poll_interval", self.poll_interval),
            ("health_interval", self.health_interval),
            ("apply_timeout", self.apply_timeout),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, d)| d.is_zero()) {
            return Err(Error::invalid_config(format!("{name} must be positive")));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::invalid_config("retry.max_attempts must be at least 1"));
        }
        if self.retry.base_backoff_ms > self.retry.max_backoff_ms {
            return Err(Error::invalid_config(
                "retry.base_backoff_ms exceeds retry.max_backoff_ms",
            ));
        }
        if self.history_limit == 0 {
            return Err(Error::invalid_config("history_limit must be at least 1"));
        }
        if let Some(bad) = self
            .ignore_differences
            .iter()
            .find(|p| !p.starts_with('/'))
        {
            return Err(Error::invalid_config(format!(
                "ignore pointer '{bad}' must start with '/'"
            )));
        }
        Ok(())
    }
}
