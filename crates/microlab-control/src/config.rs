use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_valid::Validate;
use std::time::Duration;

fn default_period_ms() -> u64 {
    1000
}

fn default_failure_threshold() -> u32 {
    3
}

/// `[control]` section: which controller the loop runs and how often.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Validate)]
pub struct ControlLoopConfig {
    /// Temperature controller device id. Its thermometer is the one it was
    /// configured against.
    #[validate(min_length = 1)]
    pub controller: String,

    /// Tick period in milliseconds.
    #[serde(default = "default_period_ms")]
    #[validate(minimum = 10)]
    pub period_ms: u64,

    /// Consecutive failed reads before the loop forces idle and raises a fault.
    #[serde(default = "default_failure_threshold")]
    #[validate(minimum = 1)]
    pub failure_threshold: u32,

    /// Target applied at start-up; without one the loop only monitors.
    #[serde(default)]
    pub target: Option<f64>,
}

impl ControlLoopConfig {
    pub fn new(controller: impl Into<String>) -> Self {
        Self {
            controller: controller.into(),
            period_ms: default_period_ms(),
            failure_threshold: default_failure_threshold(),
            target: None,
        }
    }

    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config: ControlLoopConfig = toml::from_str("controller = \"ctrl\"").unwrap();
        assert_eq!(config, ControlLoopConfig::new("ctrl"));
        assert_eq!(config.period(), Duration::from_secs(1));
        assert_eq!(config.failure_threshold, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_threshold_is_invalid() {
        let config: ControlLoopConfig =
            toml::from_str("controller = \"ctrl\"\nfailure_threshold = 0").unwrap();
        assert!(config.validate().is_err());
    }
}
