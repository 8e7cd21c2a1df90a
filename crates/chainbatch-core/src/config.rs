//! Batcher configuration.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// When a dispatch permit is returned to the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermitPolicy {
    /// Hold the permit until every item of the batch is resolved.
    /// Bounds the number of worker calls executing at once.
    #[default]
    UntilComplete,
    /// Release the permit as soon as the worker call has been issued.
    /// Bounds the rate of dispatch, not the number of calls in flight.
    UntilDispatched,
}

impl fmt::Display for PermitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UntilComplete => write!(f, "until_complete"),
            Self::UntilDispatched => write!(f, "until_dispatched"),
        }
    }
}

impl FromStr for PermitPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "until_complete" => Ok(Self::UntilComplete),
            "until_dispatched" => Ok(Self::UntilDispatched),
            other => Err(ConfigError::UnknownPermitPolicy(other.to_string())),
        }
    }
}

/// Count/time thresholds and the dispatch permit pool size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatcherConfig {
    /// Seal a batch as soon as it holds this many items.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Seal a non-empty batch after this many milliseconds.
    #[serde(default = "default_max_batch_wait_ms")]
    pub max_batch_wait_ms: u64,
    /// Size of the permit pool (worker calls dispatched concurrently).
    #[serde(default = "default_max_concurrent_dispatches")]
    pub max_concurrent_dispatches: usize,
    #[serde(default)]
    pub permit_policy: PermitPolicy,
}

fn default_max_batch_size() -> usize { 4 }
fn default_max_batch_wait_ms() -> u64 { 50 }
fn default_max_concurrent_dispatches() -> usize { 1 }

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            max_batch_wait_ms: default_max_batch_wait_ms(),
            max_concurrent_dispatches: default_max_concurrent_dispatches(),
            permit_policy: PermitPolicy::default(),
        }
    }
}

impl BatcherConfig {
    /// The time threshold as a `Duration`.
    pub fn max_batch_wait(&self) -> Duration {
        Duration::from_millis(self.max_batch_wait_ms)
    }

    pub fn with_max_batch_size(mut self, n: usize) -> Self {
        self.max_batch_size = n;
        self
    }

    /// Sub-millisecond remainders round up, so any non-zero wait stays non-zero.
    pub fn with_max_batch_wait(mut self, wait: Duration) -> Self {
        let ms = wait.as_nanos().div_ceil(1_000_000);
        self.max_batch_wait_ms = u64::try_from(ms).unwrap_or(u64::MAX);
        self
    }

    pub fn with_max_concurrent_dispatches(mut self, n: usize) -> Self {
        self.max_concurrent_dispatches = n;
        self
    }

    pub fn with_permit_policy(mut self, policy: PermitPolicy) -> Self {
        self.permit_policy = policy;
        self
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.max_batch_wait_ms == 0 {
            return Err(ConfigError::ZeroBatchWait);
        }
        if self.max_concurrent_dispatches == 0 {
            return Err(ConfigError::ZeroDispatches);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = BatcherConfig::default();
        assert_eq!(config.max_batch_size, 4);
        assert_eq!(config.max_batch_wait(), Duration::from_millis(50));
        assert_eq!(config.permit_policy, PermitPolicy::UntilComplete);
        config.validate().unwrap();
    }

    #[test]
    fn missing_fields_take_defaults() {
        let config: BatcherConfig =
            serde_json::from_str(r#"{ "max_batch_size": 10, "permit_policy": "until_dispatched" }"#)
                .unwrap();
        assert_eq!(config.max_batch_size, 10);
        assert_eq!(config.max_batch_wait_ms, 50);
        assert_eq!(config.max_concurrent_dispatches, 1);
        assert_eq!(config.permit_policy, PermitPolicy::UntilDispatched);
    }

    #[test]
    fn validate_rejects_zeroes() {
        let base = BatcherConfig::default();
        assert_eq!(
            base.clone().with_max_batch_size(0).validate(),
            Err(ConfigError::ZeroBatchSize)
        );
        assert_eq!(
            base.clone().with_max_batch_wait(Duration::ZERO).validate(),
            Err(ConfigError::ZeroBatchWait)
        );
        assert_eq!(
            base.with_max_concurrent_dispatches(0).validate(),
            Err(ConfigError::ZeroDispatches)
        );
    }

    #[test]
    fn batch_wait_rounds_up_to_whole_millis() {
        let config = BatcherConfig::default().with_max_batch_wait(Duration::from_micros(500));
        assert_eq!(config.max_batch_wait_ms, 1);
        config.validate().unwrap();

        let config = BatcherConfig::default().with_max_batch_wait(Duration::from_micros(2_001));
        assert_eq!(config.max_batch_wait(), Duration::from_millis(3));

        let config = BatcherConfig::default().with_max_batch_wait(Duration::from_millis(40));
        assert_eq!(config.max_batch_wait_ms, 40);
    }

    #[test]
    fn permit_policy_parsing() {
        assert_eq!("until-complete".parse::<PermitPolicy>(), Ok(PermitPolicy::UntilComplete));
        assert_eq!(
            "UNTIL_DISPATCHED".parse::<PermitPolicy>(),
            Ok(PermitPolicy::UntilDispatched)
        );
        assert!(matches!(
            "sometimes".parse::<PermitPolicy>(),
            Err(ConfigError::UnknownPermitPolicy(_))
        ));
        assert_eq!(PermitPolicy::UntilDispatched.to_string(), "until_dispatched");
    }
}
