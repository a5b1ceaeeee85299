//! Pipeline-step retry executor.
//!
//! Unlike [`RetryEngine`](crate::RetryEngine), this executor never returns an
//! error: every run ends in a [`RetryResult`], either a success or a
//! dead-letter outcome. Delays are jittered by up to ±`jitter` of the computed
//! backoff so that many steps failing together do not retry in lockstep.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ResilienceError;
use crate::retry::backoff_delay;
use crate::taxonomy::{BoxError, FailureCategory, FailureTaxonomy};

/// Backoff parameters for pipeline steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    #[serde(with = "crate::millis")]
    pub base_delay: Duration,
    pub backoff_factor: f64,
    #[serde(with = "crate::millis")]
    pub max_delay: Duration,
    /// Fractional jitter in `[0, 1]`; `0.5` spreads delays over 50%..150%.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: 0.5,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(ResilienceError::InvalidConfig(format!(
                "backoff_factor must be >= 1.0, got {}",
                self.backoff_factor
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ResilienceError::InvalidConfig(format!(
                "jitter must be within [0, 1], got {}",
                self.jitter
            )));
        }
        Ok(())
    }

    /// Delay before retry `attempt` (0-based), before jitter.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        backoff_delay(self.base_delay, self.backoff_factor, attempt, self.max_delay)
    }

    /// Apply jitter to a computed delay.
    pub fn jittered<R: Rng + ?Sized>(&self, delay: Duration, rng: &mut R) -> Duration {
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = rng.gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        delay.mul_f64(factor)
    }

    /// Jittered delay before retry `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.jittered(self.base_delay_for(attempt), &mut rand::thread_rng())
    }
}

/// A step that failed permanently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Name of the pipeline step.
    pub step: String,
    pub attempts: u32,
    pub category: FailureCategory,
    pub last_error: String,
    /// Every error message, oldest first.
    pub errors: Vec<String>,
    pub failed_at: DateTime<Utc>,
}

/// Final outcome of a retried step.
#[derive(Debug)]
pub enum RetryOutcome<T> {
    Success(T),
    DeadLetter(DeadLetter),
}

/// Result of running a step through the executor.
#[derive(Debug)]
pub struct RetryResult<T> {
    pub outcome: RetryOutcome<T>,
    pub attempts: u32,
    /// Delays actually waited, after jitter.
    pub delays: Vec<Duration>,
}

impl<T> RetryResult<T> {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, RetryOutcome::Success(_))
    }

    pub fn is_dead_letter(&self) -> bool {
        matches!(self.outcome, RetryOutcome::DeadLetter(_))
    }

    pub fn value(&self) -> Option<&T> {
        match &self.outcome {
            RetryOutcome::Success(v) => Some(v),
            RetryOutcome::DeadLetter(_) => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self.outcome {
            RetryOutcome::Success(v) => Some(v),
            RetryOutcome::DeadLetter(_) => None,
        }
    }

    pub fn dead_letter(&self) -> Option<&DeadLetter> {
        match &self.outcome {
            RetryOutcome::DeadLetter(d) => Some(d),
            RetryOutcome::Success(_) => None,
        }
    }
}

enum Step {
    Wait(Duration),
    DeadLetter(DeadLetter),
}

struct StepRun<'a> {
    executor: &'a PipelineRetryExecutor,
    step: &'a str,
    attempt: u32,
    errors: Vec<String>,
    delays: Vec<Duration>,
}

impl<'a> StepRun<'a> {
    fn new(executor: &'a PipelineRetryExecutor, step: &'a str) -> Self {
        Self {
            executor,
            step,
            attempt: 0,
            errors: Vec::new(),
            delays: Vec::new(),
        }
    }

    fn succeed<T>(self, value: T) -> RetryResult<T> {
        if self.attempt > 0 {
            debug!(step = self.step, attempts = self.attempt + 1, "step recovered");
        }
        RetryResult {
            outcome: RetryOutcome::Success(value),
            attempts: self.attempt + 1,
            delays: self.delays,
        }
    }

    fn fail(&mut self, error: BoxError) -> Step {
        let message = error.to_string();
        self.errors.push(message.clone());

        if self.attempt >= self.executor.policy.max_retries {
            let classified = self.executor.taxonomy.classify(error.as_ref());
            let letter = DeadLetter {
                step: self.step.to_string(),
                attempts: self.attempt + 1,
                category: classified.category,
                last_error: message,
                errors: std::mem::take(&mut self.errors),
                failed_at: Utc::now(),
            };
            warn!(
                step = self.step,
                attempts = letter.attempts,
                category = %letter.category,
                error = %letter.last_error,
                "step dead-lettered"
            );
            self.executor.push_dead_letter(letter.clone());
            return Step::DeadLetter(letter);
        }

        let delay = self.executor.policy.delay_for(self.attempt);
        debug!(
            step = self.step,
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64,
            error = %message,
            "retrying step"
        );
        self.attempt += 1;
        self.delays.push(delay);
        Step::Wait(delay)
    }

    fn dead_letter<T>(self, letter: DeadLetter) -> RetryResult<T> {
        RetryResult {
            attempts: letter.attempts,
            outcome: RetryOutcome::DeadLetter(letter),
            delays: self.delays,
        }
    }
}

/// Retry executor for pipeline steps with jitter and dead-letter routing.
#[derive(Debug, Default)]
pub struct PipelineRetryExecutor {
    policy: RetryPolicy,
    taxonomy: FailureTaxonomy,
    dead_letters: Mutex<Vec<DeadLetter>>,
}

impl PipelineRetryExecutor {
    pub fn new(policy: RetryPolicy) -> Result<Self, ResilienceError> {
        policy.validate()?;
        Ok(Self {
            policy,
            taxonomy: FailureTaxonomy::new(),
            dead_letters: Mutex::new(Vec::new()),
        })
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Every dead letter produced so far, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn push_dead_letter(&self, letter: DeadLetter) {
        self.dead_letters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(letter);
    }

    /// Run a step on the current thread, sleeping between attempts.
    pub fn run_blocking<T, F>(&self, step: &str, op: F) -> RetryResult<T>
    where
        F: FnMut(u32) -> Result<T, BoxError>,
    {
        self.run_blocking_with(step, op, std::thread::sleep)
    }

    /// Run a step, delegating each backoff to `wait`.
    pub fn run_blocking_with<T, F, W>(&self, step: &str, mut op: F, mut wait: W) -> RetryResult<T>
    where
        F: FnMut(u32) -> Result<T, BoxError>,
        W: FnMut(Duration),
    {
        let mut run = StepRun::new(self, step);
        loop {
            match op(run.attempt) {
                Ok(value) => return run.succeed(value),
                Err(error) => match run.fail(error) {
                    Step::Wait(delay) => wait(delay),
                    Step::DeadLetter(letter) => return run.dead_letter(letter),
                },
            }
        }
    }

    /// Run a step cooperatively, suspending on `tokio::time::sleep` between attempts.
    pub async fn run<T, F, Fut>(&self, step: &str, op: F) -> RetryResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, BoxError>>,
    {
        self.run_with(step, op, tokio::time::sleep).await
    }

    /// Run a step cooperatively, awaiting `wait` for each backoff.
    pub async fn run_with<T, F, Fut, W, WFut>(
        &self,
        step: &str,
        mut op: F,
        mut wait: W,
    ) -> RetryResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, BoxError>>,
        W: FnMut(Duration) -> WFut,
        WFut: Future<Output = ()>,
    {
        let mut run = StepRun::new(self, step);
        loop {
            match op(run.attempt).await {
                Ok(value) => return run.succeed(value),
                Err(error) => match run.fail(error) {
                    Step::Wait(delay) => wait(delay).await,
                    Step::DeadLetter(letter) => return run.dead_letter(letter),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(10),
            backoff_factor: 2.0,
            max_delay: Duration::from_millis(100),
            jitter: 0.5,
        }
    }

    #[test]
    fn test_always_failing_step_is_dead_lettered() {
        let executor = PipelineRetryExecutor::new(policy(3)).unwrap();
        let mut calls = 0;
        let result: RetryResult<()> = executor.run_blocking_with(
            "extract",
            |_| {
                calls += 1;
                Err("connection reset by peer".into())
            },
            |_| {},
        );

        assert!(result.is_dead_letter());
        assert_eq!(calls, 4);
        assert_eq!(result.attempts, 4);
        assert_eq!(result.delays.len(), 3);

        let letter = result.dead_letter().unwrap();
        assert_eq!(letter.step, "extract");
        assert_eq!(letter.category, FailureCategory::Dependency);
        assert_eq!(letter.errors.len(), 4);
        assert_eq!(executor.dead_letters(), vec![letter.clone()]);
    }

    #[test]
    fn test_success_after_retry_keeps_no_dead_letter() {
        let executor = PipelineRetryExecutor::new(policy(2)).unwrap();
        let result = executor.run_blocking_with(
            "load",
            |attempt| {
                if attempt == 0 {
                    Err("temporarily unavailable".into())
                } else {
                    Ok(42)
                }
            },
            |_| {},
        );
        assert_eq!(result.value(), Some(&42));
        assert_eq!(result.attempts, 2);
        assert!(executor.dead_letters().is_empty());
    }

    #[test]
    fn test_jitter_outside_range_rejected() {
        let bad = RetryPolicy {
            jitter: 1.5,
            ..RetryPolicy::default()
        };
        assert!(PipelineRetryExecutor::new(bad).is_err());
    }

    #[test]
    fn test_zero_jitter_is_exact() {
        let exact = RetryPolicy {
            jitter: 0.0,
            ..policy(3)
        };
        assert_eq!(exact.delay_for(2), Duration::from_millis(40));
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_run_dead_letters_without_error() {
        let executor = PipelineRetryExecutor::new(policy(2)).unwrap();
        let result: RetryResult<()> = executor
            .run("transform", |_| async { Err("assertion failed".into()) })
            .await;
        assert!(result.is_dead_letter());
        assert_eq!(
            result.dead_letter().map(|d| d.category),
            Some(FailureCategory::Logic)
        );
    }

    #[tokio::test]
    async fn test_async_run_uses_supplied_wait() {
        let executor = PipelineRetryExecutor::new(policy(1)).unwrap();
        let waited = std::sync::Arc::new(Mutex::new(Vec::new()));
        let sink = waited.clone();
        let result: RetryResult<u8> = executor
            .run_with(
                "publish",
                |attempt| async move {
                    if attempt == 0 {
                        Err("rate limit".into())
                    } else {
                        Ok(7)
                    }
                },
                move |d| {
                    sink.lock().unwrap().push(d);
                    async {}
                },
            )
            .await;
        assert!(result.is_success());
        assert_eq!(waited.lock().unwrap().len(), 1);
    }

    proptest! {
        #[test]
        fn jitter_stays_within_half_of_base(attempt in 0u32..8, seed in any::<u64>()) {
            let policy = policy(10);
            let base = policy.base_delay_for(attempt);
            let mut rng = StdRng::seed_from_u64(seed);
            let jittered = policy.jittered(base, &mut rng);
            prop_assert!(jittered >= base.mul_f64(0.5).saturating_sub(Duration::from_nanos(1)));
            prop_assert!(jittered <= base.mul_f64(1.5) + Duration::from_nanos(1));
        }

        #[test]
        fn pre_jitter_delay_matches_formula(attempt in 0u32..4) {
            let policy = policy(10);
            let expected = Duration::from_millis(10 * (1u64 << attempt));
            prop_assert_eq!(policy.base_delay_for(attempt), expected.min(policy.max_delay));
        }
    }
}
