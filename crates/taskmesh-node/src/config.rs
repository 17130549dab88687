//! Node daemon configuration.

use clap::Args;
use serde_json::{Map, Value};
use tracing::Level;

use taskmesh_runtime::RuntimeConfig;

/// Options shared by every command.
#[derive(Debug, Clone, Args)]
pub struct NodeArgs {
    /// Number of in-process worker nodes
    #[arg(short, long, default_value_t = 3)]
    pub nodes: usize,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, default_value = "info")]
    pub log_level: Level,

    /// Maximum concurrently running requests per node
    #[arg(long, default_value_t = 5)]
    pub queue_concurrency: usize,

    /// Maximum concurrently running tasks per runner
    #[arg(long, default_value_t = 5)]
    pub parallelism: usize,

    /// Maximum runners per node (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    pub max_runners: usize,

    /// Correlation timeout in milliseconds
    #[arg(long, default_value_t = 10_000)]
    pub timeout_ms: u64,

    /// Completion timeout in seconds (0 = wait forever)
    #[arg(long, default_value_t = 0)]
    pub future_timeout_secs: u64,

    /// Fail a dispatch when any target does not acknowledge
    #[arg(long)]
    pub require_all: bool,

    /// Replace every task body with a no-op
    #[arg(long)]
    pub dry_run: bool,
}

impl NodeArgs {
    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            queue_concurrency: self.queue_concurrency,
            runner_parallelism: self.parallelism,
            max_concurrent_runners: self.max_runners,
            correlation_timeout_ms: self.timeout_ms,
            future_timeout_secs: self.future_timeout_secs,
            require_all_responses: self.require_all,
            dry_run: self.dry_run,
            ..Default::default()
        }
    }
}

/// Parse `key=value` pairs. Values are JSON when they parse as JSON and
/// plain strings otherwise.
pub fn parse_params(pairs: &[String]) -> Result<Map<String, Value>, String> {
    let mut params = Map::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| format!("invalid parameter '{pair}', expected key=value"))?;
        if key.is_empty() {
            return Err(format!("invalid parameter '{pair}', empty key"));
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        params.insert(key.to_string(), value);
    }
    Ok(params)
}
