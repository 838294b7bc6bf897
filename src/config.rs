//! Scheduler configuration.
//!
//! Every option has a default, so a JSON config file only needs to name the
//! options it changes:
//!
//! ```
//! # use shufflite::ShuffleConfig;
//! let config = ShuffleConfig::from_json_str(r#"{ "parallel_copies": 4 }"#).unwrap();
//! assert_eq!(config.parallel_copies, 4);
//! assert_eq!(config.fetch_failures_limit, 5);
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShuffleError};
use crate::fetch::ConnectionParams;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShuffleConfig {
    /// Number of fetch tasks allowed to run at once.
    pub parallel_copies: usize,
    /// Read outputs of maps that ran on this host straight from local disk.
    pub optimize_local_fetch: bool,
    /// Notify upstream after every `fetch_failures_limit` failures of an attempt.
    pub fetch_failures_limit: u32,
    /// Notify upstream on every read or connect error.
    pub notify_read_error: bool,
    /// Upper bound on outputs handed to one fetch task.
    pub max_task_output_at_once: usize,
    /// Distinct failed attempts after which the health check may abort.
    pub max_failed_unique_fetches: usize,
    /// Name of the producing vertex, used in logs and diagnostics.
    pub source_name: String,
    /// Host name of this consumer, for the local-fetch optimization.
    pub local_hostname: String,
    /// Port the shuffle service listens on.
    pub shuffle_port: u16,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub keep_alive: bool,
    /// Seed for host selection. Random when unset.
    pub rng_seed: Option<u64>,
}

impl Default for ShuffleConfig {
    fn default() -> Self {
        Self {
            parallel_copies: 20,
            optimize_local_fetch: true,
            fetch_failures_limit: 5,
            notify_read_error: true,
            max_task_output_at_once: 20,
            max_failed_unique_fetches: 5,
            source_name: "map".into(),
            local_hostname: "localhost".into(),
            shuffle_port: 13562,
            connect_timeout_ms: 180_000,
            read_timeout_ms: 180_000,
            keep_alive: true,
            rng_seed: None,
        }
    }
}

impl ShuffleConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: ShuffleConfig =
            serde_json::from_str(json).map_err(|e| ShuffleError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.parallel_copies == 0 {
            return Err(ShuffleError::Config(
                "parallel_copies must be at least 1".into(),
            ));
        }
        if self.fetch_failures_limit == 0 {
            return Err(ShuffleError::Config(
                "fetch_failures_limit must be at least 1".into(),
            ));
        }
        if self.max_failed_unique_fetches == 0 {
            return Err(ShuffleError::Config(
                "max_failed_unique_fetches must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Size of the fetch pool for a shuffle of `num_inputs` inputs.
    pub fn num_fetchers(&self, num_inputs: usize) -> usize {
        self.parallel_copies.min(num_inputs)
    }

    /// Per-attempt failure count after which the attempt is reported failed.
    pub fn abort_failure_limit(&self, num_inputs: usize) -> u32 {
        30.max(num_inputs / 10) as u32
    }

    pub fn max_task_output_at_once(&self) -> usize {
        self.max_task_output_at_once.max(1)
    }

    pub fn connection_params(&self) -> ConnectionParams {
        ConnectionParams {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            keep_alive: self.keep_alive,
            local_disk_fetch: self.optimize_local_fetch,
            local_hostname: self.local_hostname.clone(),
            shuffle_port: self.shuffle_port,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ShuffleConfig::default();
        config.validate().unwrap();
        assert_eq!(config.parallel_copies, 20);
        assert!(config.notify_read_error);
    }

    #[test]
    fn fetch_pool_never_exceeds_inputs() {
        let config = ShuffleConfig::default();
        assert_eq!(config.num_fetchers(3), 3);
        assert_eq!(config.num_fetchers(500), 20);
    }

    #[test]
    fn abort_limit_scales_with_large_shuffles() {
        let config = ShuffleConfig::default();
        assert_eq!(config.abort_failure_limit(10), 30);
        assert_eq!(config.abort_failure_limit(1000), 100);
    }

    #[test]
    fn zero_reporting_interval_is_rejected() {
        let err = ShuffleConfig::from_json_str(r#"{ "fetch_failures_limit": 0 }"#).unwrap_err();
        assert!(matches!(err, ShuffleError::Config(_)));
    }

    #[test]
    fn batch_cap_is_at_least_one() {
        let config = ShuffleConfig {
            max_task_output_at_once: 0,
            ..Default::default()
        };
        assert_eq!(config.max_task_output_at_once(), 1);
    }

    #[test]
    fn unknown_json_is_a_config_error() {
        let err = ShuffleConfig::from_json_str("not json").unwrap_err();
        assert!(matches!(err, ShuffleError::Config(_)));
    }
}
