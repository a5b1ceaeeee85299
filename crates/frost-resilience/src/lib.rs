//! Failure handling for Frost.
//!
//! This crate provides the resilience half of the scheduler:
//! - Classifies errors into a fixed failure taxonomy
//! - Retries operations with category-aware exponential backoff
//! - Tracks per-worker health behind a circuit breaker
//! - Diagnoses failures and records every healing attempt

mod circuit;
mod diagnosis;
mod error;
mod healing;
pub mod millis;
mod policy;
mod retry;
mod taxonomy;

pub use circuit::{AgentHealth, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use diagnosis::{
    Diagnoser, Diagnosis, DiagnosisContext, ImpactAssessment, ImpactScope, RecoveryStep, Severity,
};
pub use error::ResilienceError;
pub use healing::{HealingEvent, HealingLog, HealingOutcome, HealingSummary, OutcomeCounts};
pub use policy::{DeadLetter, PipelineRetryExecutor, RetryOutcome, RetryPolicy, RetryResult};
pub use retry::{
    ConfigAdjuster, Recovered, RetryConfig, RetryEngine, RetryExhausted, backoff_delay,
};
pub use taxonomy::{
    BoxError, ClassifiedError, FailureCategory, FailureTaxonomy, RECOVERY_MAP, RecoveryStrategy,
    error_chain_message, recovery_strategies,
};
