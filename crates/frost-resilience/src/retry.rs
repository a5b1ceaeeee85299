//! General-purpose retry engine.
//!
//! Retries a fallible operation with exponential backoff. Each failure is
//! classified first; categories whose recovery strategies do not include a
//! retry stop immediately, and a category-specific config adjuster may
//! reshape the remaining backoff (e.g. slower retries on resource exhaustion).

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ResilienceError;
use crate::taxonomy::{BoxError, ClassifiedError, FailureCategory, FailureTaxonomy};

/// Compute `base * factor^attempt`, capped at `max`.
///
/// Works in nanoseconds so integral bases and factors stay exact.
pub fn backoff_delay(base: Duration, factor: f64, attempt: u32, max: Duration) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let scaled = base.as_nanos() as f64 * factor.powi(exponent);
    if !scaled.is_finite() || scaled >= max.as_nanos() as f64 {
        return max;
    }
    Duration::from_nanos(scaled.round() as u64)
}

/// Backoff parameters for the retry engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    #[serde(with = "crate::millis")]
    pub base_delay: Duration,
    /// Multiplier applied per retry.
    pub backoff_factor: f64,
    /// Upper bound for any single delay.
    #[serde(with = "crate::millis")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        backoff_delay(self.base_delay, self.backoff_factor, attempt, self.max_delay)
    }

    pub fn validate(&self) -> Result<(), ResilienceError> {
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(ResilienceError::InvalidConfig(format!(
                "backoff_factor must be >= 1.0, got {}",
                self.backoff_factor
            )));
        }
        if self.base_delay > self.max_delay {
            return Err(ResilienceError::InvalidConfig(format!(
                "base_delay ({:?}) exceeds max_delay ({:?})",
                self.base_delay, self.max_delay
            )));
        }
        Ok(())
    }
}

/// Mutates retry parameters once a failure of some category is seen.
pub type ConfigAdjuster = Arc<dyn Fn(&mut RetryConfig) + Send + Sync>;

/// A successful run, possibly after retries.
#[derive(Debug)]
pub struct Recovered<T> {
    pub value: T,
    /// Total attempts made, including the successful one.
    pub attempts: u32,
    /// Classification of the last failure before success, if any.
    pub recovered_from: Option<ClassifiedError>,
}

/// The operation kept failing, or failed in a non-retryable way.
#[derive(Debug)]
pub struct RetryExhausted {
    pub error: BoxError,
    pub classification: ClassifiedError,
    pub attempts: u32,
}

impl fmt::Display for RetryExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "gave up after {} attempt(s) ({}): {}",
            self.attempts, self.classification.category, self.error
        )
    }
}

impl std::error::Error for RetryExhausted {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.error.as_ref())
    }
}

/// What to do after a failed attempt.
enum Step {
    Wait(Duration),
    GiveUp(RetryExhausted),
}

/// Per-execution retry bookkeeping shared by the blocking and async paths.
struct RetryRun<'a> {
    engine: &'a RetryEngine,
    config: RetryConfig,
    adjusted: HashSet<FailureCategory>,
    attempt: u32,
    last: Option<ClassifiedError>,
}

impl<'a> RetryRun<'a> {
    fn new(engine: &'a RetryEngine) -> Self {
        Self {
            engine,
            config: engine.config.clone(),
            adjusted: HashSet::new(),
            attempt: 0,
            last: None,
        }
    }

    fn succeed<T>(self, value: T) -> Recovered<T> {
        Recovered {
            value,
            attempts: self.attempt + 1,
            recovered_from: self.last,
        }
    }

    fn fail(&mut self, error: BoxError) -> Step {
        let classification = self.engine.taxonomy.classify(error.as_ref());
        let category = classification.category;

        if self.adjusted.insert(category) {
            if let Some(adjust) = self.engine.adjusters.get(&category) {
                adjust(&mut self.config);
                debug!(%category, config = ?self.config, "adjusted retry config");
            }
        }

        let attempts = self.attempt + 1;
        if !category.is_retryable() {
            warn!(%category, attempts, error = %error, "failure is not retryable");
            return Step::GiveUp(RetryExhausted {
                error,
                classification,
                attempts,
            });
        }
        if self.attempt >= self.config.max_retries {
            warn!(%category, attempts, error = %error, "retries exhausted");
            return Step::GiveUp(RetryExhausted {
                error,
                classification,
                attempts,
            });
        }

        let delay = self.config.delay_for(self.attempt);
        debug!(
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64,
            %category,
            error = %error,
            "retrying after failure"
        );
        self.attempt += 1;
        self.last = Some(classification);
        Step::Wait(delay)
    }
}

/// Retry executor with category-aware config adjustment.
#[derive(Clone)]
pub struct RetryEngine {
    config: RetryConfig,
    taxonomy: FailureTaxonomy,
    adjusters: HashMap<FailureCategory, ConfigAdjuster>,
}

impl fmt::Debug for RetryEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryEngine")
            .field("config", &self.config)
            .field("adjusters", &self.adjusters.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl RetryEngine {
    pub fn new(config: RetryConfig) -> Result<Self, ResilienceError> {
        config.validate()?;
        Ok(Self {
            config,
            taxonomy: FailureTaxonomy::new(),
            adjusters: HashMap::new(),
        })
    }

    /// Engine with the stock adjusters: resource exhaustion doubles the
    /// delays, dependency failures get two extra retries.
    pub fn with_default_adjusters(config: RetryConfig) -> Result<Self, ResilienceError> {
        Ok(Self::new(config)?
            .with_adjuster(FailureCategory::Resource, |c| {
                c.base_delay *= 2;
                c.max_delay *= 2;
            })
            .with_adjuster(FailureCategory::Dependency, |c| {
                c.max_retries += 2;
            }))
    }

    pub fn with_taxonomy(mut self, taxonomy: FailureTaxonomy) -> Self {
        self.taxonomy = taxonomy;
        self
    }

    /// Register the adjuster applied the first time `category` is seen in a run.
    pub fn with_adjuster<F>(mut self, category: FailureCategory, adjust: F) -> Self
    where
        F: Fn(&mut RetryConfig) + Send + Sync + 'static,
    {
        self.adjusters.insert(category, Arc::new(adjust));
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `op` on the current thread, sleeping between attempts.
    pub fn execute_blocking<T, F>(&self, op: F) -> Result<Recovered<T>, RetryExhausted>
    where
        F: FnMut(u32) -> Result<T, BoxError>,
    {
        self.execute_blocking_with(op, std::thread::sleep)
    }

    /// Run `op`, delegating each backoff to `wait`.
    pub fn execute_blocking_with<T, F, W>(
        &self,
        mut op: F,
        mut wait: W,
    ) -> Result<Recovered<T>, RetryExhausted>
    where
        F: FnMut(u32) -> Result<T, BoxError>,
        W: FnMut(Duration),
    {
        let mut run = RetryRun::new(self);
        loop {
            match op(run.attempt) {
                Ok(value) => return Ok(run.succeed(value)),
                Err(error) => match run.fail(error) {
                    Step::Wait(delay) => wait(delay),
                    Step::GiveUp(exhausted) => return Err(exhausted),
                },
            }
        }
    }

    /// Run `op` cooperatively, suspending on `tokio::time::sleep` between attempts.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<Recovered<T>, RetryExhausted>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, BoxError>>,
    {
        self.execute_with(op, tokio::time::sleep).await
    }

    /// Run `op` cooperatively, awaiting `wait` for each backoff.
    pub async fn execute_with<T, F, Fut, W, WFut>(
        &self,
        mut op: F,
        mut wait: W,
    ) -> Result<Recovered<T>, RetryExhausted>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, BoxError>>,
        W: FnMut(Duration) -> WFut,
        WFut: Future<Output = ()>,
    {
        let mut run = RetryRun::new(self);
        loop {
            match op(run.attempt).await {
                Ok(value) => return Ok(run.succeed(value)),
                Err(error) => match run.fail(error) {
                    Step::Wait(delay) => wait(delay).await,
                    Step::GiveUp(exhausted) => return Err(exhausted),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn fast_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_delay_grows_then_caps() {
        let config = fast_config(10);
        assert_eq!(config.delay_for(0), Duration::from_millis(100));
        assert_eq!(config.delay_for(1), Duration::from_millis(200));
        assert_eq!(config.delay_for(3), Duration::from_millis(800));
        assert_eq!(config.delay_for(4), Duration::from_secs(1));
        assert_eq!(config.delay_for(500), Duration::from_secs(1));
    }

    #[test]
    fn test_invalid_factor_rejected() {
        let config = RetryConfig {
            backoff_factor: 0.5,
            ..RetryConfig::default()
        };
        assert!(matches!(
            RetryEngine::new(config),
            Err(ResilienceError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_succeeds_after_transient_failures() {
        let engine = RetryEngine::new(fast_config(3)).unwrap();
        let mut waits = Vec::new();
        let result = engine.execute_blocking_with(
            |attempt| {
                if attempt < 2 {
                    Err::<u32, BoxError>("upstream unavailable".into())
                } else {
                    Ok(attempt)
                }
            },
            |d| waits.push(d),
        );

        let recovered = result.unwrap();
        assert_eq!(recovered.value, 2);
        assert_eq!(recovered.attempts, 3);
        assert_eq!(
            recovered.recovered_from.map(|c| c.category),
            Some(FailureCategory::Dependency)
        );
        assert_eq!(
            waits,
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
    }

    #[test]
    fn test_exhaustion_reports_attempts() {
        let engine = RetryEngine::new(fast_config(2)).unwrap();
        let err = engine
            .execute_blocking_with(
                |_| Err::<(), BoxError>("request timed out".into()),
                |_| {},
            )
            .unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(err.classification.category, FailureCategory::Timeout);
        assert!(err.to_string().contains("3 attempt"));
    }

    #[test]
    fn test_non_retryable_category_stops_immediately() {
        let engine = RetryEngine::new(fast_config(5)).unwrap();
        let mut calls = 0;
        let err = engine
            .execute_blocking_with(
                |_| {
                    calls += 1;
                    Err::<(), BoxError>("permission denied".into())
                },
                |_| panic!("must not wait"),
            )
            .unwrap_err();
        assert_eq!(calls, 1);
        assert_eq!(err.attempts, 1);
        assert_eq!(err.classification.category, FailureCategory::Permission);
    }

    #[test]
    fn test_adjuster_applies_once_per_category() {
        let engine = RetryEngine::new(fast_config(3))
            .unwrap()
            .with_adjuster(FailureCategory::Resource, |c| c.base_delay *= 3);
        let mut waits = Vec::new();
        let _ = engine.execute_blocking_with(
            |_| Err::<(), BoxError>("out of memory".into()),
            |d| waits.push(d),
        );
        assert_eq!(
            waits,
            vec![
                Duration::from_millis(300),
                Duration::from_millis(600),
                Duration::from_secs(1),
            ]
        );
        // The engine's own config is untouched.
        assert_eq!(engine.config().base_delay, Duration::from_millis(100));
    }

    #[test]
    fn test_default_adjusters_extend_dependency_retries() {
        let engine = RetryEngine::with_default_adjusters(fast_config(1)).unwrap();
        let err = engine
            .execute_blocking_with(
                |_| Err::<(), BoxError>("connection refused".into()),
                |_| {},
            )
            .unwrap_err();
        assert_eq!(err.attempts, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_execute_suspends_between_attempts() {
        let engine = RetryEngine::new(fast_config(3)).unwrap();
        let started = tokio::time::Instant::now();
        let recovered = engine
            .execute(|attempt| async move {
                if attempt == 0 {
                    Err::<&str, BoxError>("503 from gateway".into())
                } else {
                    Ok("done")
                }
            })
            .await
            .unwrap();
        assert_eq!(recovered.value, "done");
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    proptest! {
        #[test]
        fn delay_matches_formula_until_cap(base_ms in 1u64..1_000, attempt in 0u32..12) {
            let config = RetryConfig {
                max_retries: 20,
                base_delay: Duration::from_millis(base_ms),
                backoff_factor: 2.0,
                max_delay: Duration::from_secs(3_600),
            };
            let expected = Duration::from_millis(base_ms * (1u64 << attempt));
            prop_assert_eq!(config.delay_for(attempt), expected.min(config.max_delay));
        }

        #[test]
        fn delay_never_exceeds_cap(attempt in 0u32..10_000, factor in 1.0f64..10.0) {
            let config = RetryConfig {
                max_retries: 1,
                base_delay: Duration::from_millis(250),
                backoff_factor: factor,
                max_delay: Duration::from_secs(30),
            };
            prop_assert!(config.delay_for(attempt) <= config.max_delay);
        }

        #[test]
        fn delay_is_non_decreasing(a in 0u32..64, b in 0u32..64) {
            let config = fast_config(1);
            if a <= b {
                prop_assert!(config.delay_for(a) <= config.delay_for(b));
            }
        }
    }
}
