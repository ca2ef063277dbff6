//! Scheduler configuration.

use crate::error::ConfigError;
use crate::topology;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default stack size for each fiber: 512 KiB.
pub const DEFAULT_STACK_SIZE: usize = 512 * 1024;

/// Pooled fibers created per worker thread when `num_fibers` is not set.
pub const FIBERS_PER_THREAD: usize = 10;

/// Options read by [`JobSystem::new`](crate::JobSystem::new).
///
/// Every field is optional when deserializing; missing ones take their
/// default value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Worker threads, including the thread that calls `run`. Default: the
    /// number of logical cores.
    pub num_threads: usize,
    /// Pooled fibers. Default: `FIBERS_PER_THREAD * num_threads`.
    pub num_fibers: Option<usize>,
    /// Stack size of every pooled fiber in bytes.
    pub stack_size: usize,
    /// Pin worker thread `i` to core `i`.
    pub thread_affinity: bool,
    pub high_priority_queue_size: usize,
    pub normal_priority_queue_size: usize,
    pub low_priority_queue_size: usize,
    /// Shut the scheduler down as soon as the main callback returns.
    pub shutdown_after_main: bool,
    /// Sleep between idle polls once spinning gave up, in microseconds.
    pub idle_sleep_us: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            num_threads: topology::logical_cores(),
            num_fibers: None,
            stack_size: DEFAULT_STACK_SIZE,
            thread_affinity: false,
            high_priority_queue_size: 512,
            normal_priority_queue_size: 2048,
            low_priority_queue_size: 4096,
            shutdown_after_main: true,
            idle_sleep_us: 1000,
        }
    }
}

impl SchedulerConfig {
    /// Configuration with `num_threads` workers and everything else default.
    pub fn with_threads(num_threads: usize) -> Self {
        SchedulerConfig {
            num_threads,
            ..SchedulerConfig::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Worker thread count, never below one.
    pub fn threads(&self) -> usize {
        self.num_threads.max(1)
    }

    /// Resolved number of pooled fibers.
    pub fn fibers(&self) -> usize {
        self.num_fibers
            .unwrap_or_else(|| self.threads() * FIBERS_PER_THREAD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SchedulerConfig::default();
        assert!(config.num_threads >= 1);
        assert_eq!(config.fibers(), config.num_threads * FIBERS_PER_THREAD);
        assert_eq!(config.stack_size, DEFAULT_STACK_SIZE);
        assert_eq!(config.high_priority_queue_size, 512);
        assert_eq!(config.normal_priority_queue_size, 2048);
        assert_eq!(config.low_priority_queue_size, 4096);
        assert!(config.shutdown_after_main);
        assert!(!config.thread_affinity);
    }

    #[test]
    fn test_partial_json() {
        let config = SchedulerConfig::from_json_str(
            r#"{ "num_threads": 3, "num_fibers": 7, "thread_affinity": true }"#,
        )
        .unwrap();
        assert_eq!(config.num_threads, 3);
        assert_eq!(config.fibers(), 7);
        assert!(config.thread_affinity);
        assert_eq!(config.stack_size, DEFAULT_STACK_SIZE);
    }

    #[test]
    fn test_invalid_json() {
        let err = SchedulerConfig::from_json_str(r#"{ "num_threads": "many" }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = SchedulerConfig::from_path("/nonexistent/fiber-jobs.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_zero_threads_clamped() {
        let config = SchedulerConfig::with_threads(0);
        assert_eq!(config.threads(), 1);
        assert_eq!(config.fibers(), FIBERS_PER_THREAD);
    }
}
