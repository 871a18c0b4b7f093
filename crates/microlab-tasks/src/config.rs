use microlab_core::error_recovery::RetryPolicy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_valid::Validate;
use std::path::PathBuf;
use std::time::Duration;

fn default_workers() -> usize {
    4
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    250
}

fn default_retry_max_ms() -> u64 {
    10_000
}

fn default_contention_delay_ms() -> u64 {
    250
}

fn default_max_contention_retries() -> u32 {
    40
}

fn default_poll_interval_ms() -> u64 {
    500
}

/// `[tasks]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Validate)]
pub struct TaskConfig {
    /// Concurrent workers.
    #[serde(default = "default_workers")]
    #[validate(minimum = 1)]
    #[validate(maximum = 64)]
    pub workers: usize,

    /// Retries after the first attempt for transient failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First backoff delay; doubles per retry.
    #[serde(default = "default_retry_base_ms")]
    #[validate(minimum = 1)]
    pub retry_base_ms: u64,

    /// Upper bound on a single backoff delay.
    #[serde(default = "default_retry_max_ms")]
    #[validate(minimum = 1)]
    pub retry_max_ms: u64,

    /// Requeue delay when the device is held by another operation.
    #[serde(default = "default_contention_delay_ms")]
    pub contention_delay_ms: u64,

    /// Requeues on a busy device before the task fails.
    #[serde(default = "default_max_contention_retries")]
    pub max_contention_retries: u32,

    /// Poll period of heat, cool and maintain operations.
    #[serde(default = "default_poll_interval_ms")]
    #[validate(minimum = 10)]
    pub poll_interval_ms: u64,

    /// redb file. Without one, tasks live in memory only.
    #[serde(default)]
    pub database: Option<PathBuf>,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
            contention_delay_ms: default_contention_delay_ms(),
            max_contention_retries: default_max_contention_retries(),
            poll_interval_ms: default_poll_interval_ms(),
            database: None,
        }
    }
}

impl TaskConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.retry_base_ms),
            Duration::from_millis(self.retry_max_ms.max(self.retry_base_ms)),
        )
    }

    pub fn contention_delay(&self) -> Duration {
        Duration::from_millis(self.contention_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
