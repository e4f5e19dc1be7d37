//! Operator configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming the worker thread prefix.
pub const ENV_WORKER_PREFIX: &str = "BATCHFORGE_WORKER_PREFIX";
/// Environment variable with the default stop/shutdown wait in milliseconds.
pub const ENV_STOP_TIMEOUT_MS: &str = "BATCHFORGE_STOP_TIMEOUT_MS";
/// Environment variable pointing at a checkpoint directory.
pub const ENV_CHECKPOINT_DIR: &str = "BATCHFORGE_CHECKPOINT_DIR";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Worker threads are named `<prefix>-<execution id>`
    pub worker_prefix: String,
    /// How long `stop_and_wait` and `shutdown` wait by default
    pub stop_timeout: Duration,
    /// Directory for file checkpoints; `None` keeps them in memory
    pub checkpoint_dir: Option<PathBuf>,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            worker_prefix: "batch-worker".to_string(),
            stop_timeout: Duration::from_secs(30),
            checkpoint_dir: None,
        }
    }
}

impl OperatorConfig {
    pub fn with_worker_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.worker_prefix = prefix.into();
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = Some(dir.into());
        self
    }

    /// Defaults overridden by `BATCHFORGE_*` environment variables.
    /// Malformed values fall back to the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(prefix) = lookup(ENV_WORKER_PREFIX).filter(|p| !p.trim().is_empty()) {
            config.worker_prefix = prefix.trim().to_string();
        }
        if let Some(ms) = lookup(ENV_STOP_TIMEOUT_MS).and_then(|v| v.trim().parse::<u64>().ok()) {
            config.stop_timeout = Duration::from_millis(ms);
        }
        if let Some(dir) = lookup(ENV_CHECKPOINT_DIR).filter(|d| !d.trim().is_empty()) {
            config.checkpoint_dir = Some(PathBuf::from(dir));
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn environment_overrides_defaults() {
        let env = HashMap::from([
            (ENV_WORKER_PREFIX, "nightly"),
            (ENV_STOP_TIMEOUT_MS, "250"),
            (ENV_CHECKPOINT_DIR, "/var/lib/batch"),
        ]);
        let config = OperatorConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.worker_prefix, "nightly");
        assert_eq!(config.stop_timeout, Duration::from_millis(250));
        assert_eq!(config.checkpoint_dir, Some(PathBuf::from("/var/lib/batch")));
    }

    #[test]
    fn malformed_values_keep_defaults() {
        let config = OperatorConfig::from_lookup(|k| (k == ENV_STOP_TIMEOUT_MS).then(|| "soon".to_string()));
        assert_eq!(config, OperatorConfig::default());
    }
}
