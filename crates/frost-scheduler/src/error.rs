//! Error types for the scheduler.

use thiserror::Error;

use frost_resilience::ResilienceError;

/// Errors that can occur in scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Job already exists.
    #[error("job already exists: {0}")]
    JobExists(String),

    /// Job not found.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// Job is executing and cannot be started again.
    #[error("job is already running: {0}")]
    JobRunning(String),

    /// The job already reached its `max_runs`.
    #[error("job has no runs left: {0}")]
    RunsExhausted(String),

    /// A prerequisite has not completed yet.
    #[error("job is waiting on its dependencies: {0}")]
    DependenciesPending(String),

    /// A prerequisite failed, was cancelled or no longer exists.
    #[error("job {job_id} is blocked: {reason}")]
    JobBlocked { job_id: String, reason: String },

    /// Malformed or never-firing trigger.
    #[error("invalid trigger: {0}")]
    InvalidTrigger(String),

    /// Invalid job or scheduler configuration.
    #[error("invalid job configuration: {0}")]
    InvalidConfig(String),

    /// No work function registered under this name.
    #[error("unknown function: {0}")]
    UnknownFunction(String),

    /// Adding the dependency would create a cycle.
    #[error("dependency cycle: {0}")]
    DependencyCycle(String),

    /// `start` called twice.
    #[error("scheduler is already running")]
    AlreadyRunning,

    /// The polling loop is not running.
    #[error("scheduler is not running")]
    NotRunning,

    /// Resilience component setup failed.
    #[error(transparent)]
    Resilience(#[from] ResilienceError),

    /// State file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// State file encoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
