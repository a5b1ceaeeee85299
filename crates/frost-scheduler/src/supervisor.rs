//! Failure path for job runs.
//!
//! A run goes through retry (when configured) and its outcome is reported to
//! the circuit breaker. Exhausted failures are diagnosed, and every recovery
//! attempt lands in the healing log.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use frost_resilience::{
    BoxError, CircuitBreaker, CircuitState, Diagnoser, DiagnosisContext, FailureTaxonomy,
    HealingEvent, HealingLog, HealingOutcome, Recovered, RecoveryStrategy, RetryConfig,
    RetryEngine, RetryExhausted, error_chain_message,
};

use crate::job::{RunOutcome, WorkFn};
use crate::{SchedulerConfig, SchedulerError};

/// A job body panicked instead of returning an error.
#[derive(Debug, Error)]
#[error("job body panicked: {0}")]
pub struct JobPanicked(pub String);

/// Everything needed to execute one run, captured at dispatch time.
pub(crate) struct RunRequest {
    pub job_id: String,
    pub name: String,
    pub run: u32,
    pub work: WorkFn,
    pub args: Value,
    pub retry: Option<RetryConfig>,
    pub consecutive_failures: u32,
    pub dependents: usize,
}

pub(crate) struct Execution {
    pub outcome: RunOutcome,
    pub attempts: u32,
}

/// Owns the resilience components a scheduler feeds job outcomes into.
#[derive(Debug)]
pub struct Supervisor {
    taxonomy: FailureTaxonomy,
    diagnoser: Diagnoser,
    breaker: Option<Arc<CircuitBreaker>>,
    healing: Arc<HealingLog>,
    default_retry: Option<RetryConfig>,
}

impl Supervisor {
    pub fn new(config: &SchedulerConfig, healing: Arc<HealingLog>) -> Result<Self, SchedulerError> {
        let breaker = config
            .circuit_breaker
            .clone()
            .map(CircuitBreaker::new)
            .transpose()?
            .map(Arc::new);

        Ok(Self {
            taxonomy: FailureTaxonomy::new(),
            diagnoser: Diagnoser::new(),
            breaker,
            healing,
            default_retry: config.default_retry.clone(),
        })
    }

    pub fn taxonomy(&self) -> &FailureTaxonomy {
        &self.taxonomy
    }

    pub fn diagnoser(&self) -> &Diagnoser {
        &self.diagnoser
    }

    pub fn circuit_breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.breaker.as_ref()
    }

    pub fn healing_log(&self) -> &Arc<HealingLog> {
        &self.healing
    }

    /// Whether the circuit for `name` lets a run through.
    pub fn admit(&self, name: &str) -> bool {
        self.breaker.as_ref().is_none_or(|b| b.allow(name))
    }

    pub(crate) async fn run(&self, request: &RunRequest) -> Execution {
        let outcome = match request.retry.as_ref().or(self.default_retry.as_ref()) {
            Some(config) => self.run_with_retry(request, config).await,
            None => self.run_once(request).await,
        };

        match outcome {
            Ok(recovered) => self.succeeded(request, recovered),
            Err(exhausted) => self.failed(request, exhausted),
        }
    }

    async fn run_once(&self, request: &RunRequest) -> Result<Recovered<Value>, RetryExhausted> {
        match invoke(&request.work, request.args.clone()).await {
            Ok(value) => Ok(Recovered {
                value,
                attempts: 1,
                recovered_from: None,
            }),
            Err(error) => Err(RetryExhausted {
                classification: self.taxonomy.classify(&*error),
                error,
                attempts: 1,
            }),
        }
    }

    async fn run_with_retry(
        &self,
        request: &RunRequest,
        config: &RetryConfig,
    ) -> Result<Recovered<Value>, RetryExhausted> {
        let engine = match RetryEngine::with_default_adjusters(config.clone()) {
            Ok(engine) => engine.with_taxonomy(self.taxonomy.clone()),
            Err(e) => {
                warn!(job_id = %request.job_id, error = %e, "invalid retry config, running once");
                return self.run_once(request).await;
            }
        };

        engine
            .execute(|attempt| {
                if attempt > 0 {
                    debug!(job_id = %request.job_id, attempt, "retrying job");
                }
                invoke(&request.work, request.args.clone())
            })
            .await
    }

    fn context(&self, request: &RunRequest, retries: u32, failures: u32) -> DiagnosisContext {
        let circuit_open = self
            .breaker
            .as_ref()
            .is_some_and(|b| b.state(&request.name) == CircuitState::Open);

        DiagnosisContext::new()
            .component(request.name.clone())
            .retry_count(retries)
            .recent_failures(failures)
            .dependents(request.dependents)
            .circuit_open(circuit_open)
    }

    fn succeeded(&self, request: &RunRequest, recovered: Recovered<Value>) -> Execution {
        if let Some(breaker) = &self.breaker {
            breaker.record_success(&request.name);
        }

        if let Some(classified) = recovered.recovered_from {
            let context = self.context(request, recovered.attempts - 1, 0);
            let diagnosis = self.diagnoser.diagnose_classified(classified, Some(&context));
            info!(
                job_id = %request.job_id,
                attempts = recovered.attempts,
                category = %diagnosis.category,
                "job recovered after retries"
            );
            let event = HealingEvent::new(diagnosis, RecoveryStrategy::Retry, HealingOutcome::Success)
                .with_note(format!(
                    "{} run {} succeeded on attempt {}",
                    request.name, request.run, recovered.attempts
                ));
            self.record(event);
        }

        Execution {
            outcome: RunOutcome::Success {
                output: recovered.value,
            },
            attempts: recovered.attempts,
        }
    }

    fn failed(&self, request: &RunRequest, exhausted: RetryExhausted) -> Execution {
        if let Some(breaker) = &self.breaker {
            breaker.record_failure(&request.name);
        }

        let error = error_chain_message(&*exhausted.error);
        let category = exhausted.classification.category;
        let context = self.context(
            request,
            exhausted.attempts - 1,
            request.consecutive_failures + 1,
        );
        let diagnosis = self
            .diagnoser
            .diagnose_classified(exhausted.classification, Some(&context));

        warn!(
            job_id = %request.job_id,
            name = %request.name,
            run = request.run,
            attempts = exhausted.attempts,
            category = %category,
            severity = %diagnosis.impact.severity,
            error = %error,
            "job run failed"
        );

        // Retries were the recovery taken; otherwise the failure is escalated as-is.
        let action = if exhausted.attempts > 1 {
            RecoveryStrategy::Retry
        } else {
            RecoveryStrategy::Escalate
        };
        let note = diagnosis.root_cause.clone();
        self.record(HealingEvent::new(diagnosis, action, HealingOutcome::Failure).with_note(note));

        Execution {
            outcome: RunOutcome::Failure { error, category },
            attempts: exhausted.attempts,
        }
    }

    fn record(&self, event: HealingEvent) {
        if let Err(e) = self.healing.record(event) {
            warn!(error = %e, "failed to record healing event");
        }
    }
}

/// Call a work function, turning panics into errors.
async fn invoke(work: &WorkFn, args: Value) -> Result<Value, BoxError> {
    let future = match std::panic::catch_unwind(AssertUnwindSafe(|| work(args))) {
        Ok(future) => future,
        Err(panic) => return Err(Box::new(JobPanicked(panic_message(panic.as_ref())))),
    };

    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(Box::new(JobPanicked(panic_message(panic.as_ref())))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
