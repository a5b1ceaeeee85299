//! Scheduler configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use frost_resilience::{CircuitBreakerConfig, RetryConfig};

use crate::SchedulerError;

/// Settings for a [`Scheduler`](crate::Scheduler).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How often the polling loop wakes to dispatch due jobs.
    #[serde(rename = "poll_interval_ms", with = "frost_resilience::millis")]
    pub poll_interval: Duration,
    /// Maximum job bodies executing at once.
    pub workers: usize,
    /// Evict terminal jobs this long after they finish.
    #[serde(rename = "retention_ms", with = "frost_resilience::millis::option")]
    pub retention: Option<Duration>,
    /// Retry policy for jobs that do not set their own.
    pub default_retry: Option<RetryConfig>,
    /// Gate job runs per job name through a circuit breaker.
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            workers: 4,
            retention: None,
            default_retry: None,
            circuit_breaker: None,
        }
    }
}

impl SchedulerConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    pub fn with_default_retry(mut self, retry: RetryConfig) -> Self {
        self.default_retry = Some(retry);
        self
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.workers == 0 {
            return Err(SchedulerError::InvalidConfig(
                "workers must be at least 1".to_string(),
            ));
        }
        if self.workers > tokio::sync::Semaphore::MAX_PERMITS {
            return Err(SchedulerError::InvalidConfig(format!(
                "workers must be at most {}",
                tokio::sync::Semaphore::MAX_PERMITS
            )));
        }
        if self.poll_interval.is_zero() {
            return Err(SchedulerError::InvalidConfig(
                "poll_interval must be greater than zero".to_string(),
            ));
        }
        if let Some(retry) = &self.default_retry {
            retry.validate()?;
        }
        if let Some(breaker) = &self.circuit_breaker {
            breaker.validate()?;
        }
        Ok(())
    }
}
