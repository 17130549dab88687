//! Runtime configuration.

use std::time::Duration;

use serde::Deserialize;

/// Runtime configuration shared by every component of a node.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Maximum concurrently running jobs per queue.
    pub queue_concurrency: usize,

    /// Maximum concurrently running tasks inside one runner.
    pub runner_parallelism: usize,

    /// Maximum runners registered at once (0 = unlimited).
    pub max_concurrent_runners: usize,

    /// Correlation timeout for request/response rounds (milliseconds).
    pub correlation_timeout_ms: u64,

    /// Default timeout when awaiting remote task completion (seconds, 0 = none).
    pub future_timeout_secs: u64,

    /// Treat a correlation that timed out with partial responses as a failure.
    pub require_all_responses: bool,

    /// Drop error responses before post-processing.
    pub drop_error_responses: bool,

    /// Replace every task executable with a no-op.
    pub dry_run: bool,
}

impl RuntimeConfig {
    pub fn correlation_timeout(&self) -> Duration {
        Duration::from_millis(self.correlation_timeout_ms)
    }

    pub fn future_timeout(&self) -> Option<Duration> {
        (self.future_timeout_secs > 0).then(|| Duration::from_secs(self.future_timeout_secs))
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            queue_concurrency: 5,
            runner_parallelism: 5,
            max_concurrent_runners: 0,
            correlation_timeout_ms: 10_000,
            future_timeout_secs: 0,
            require_all_responses: false,
            drop_error_responses: false,
            dry_run: false,
        }
    }
}
