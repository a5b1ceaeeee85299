//! Job model.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use frost_resilience::{BoxError, FailureCategory, RetryConfig};

use crate::Trigger;

/// A job body: takes the job's bound arguments, yields an output value.
pub type WorkFn = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, BoxError>> + Send + Sync>;

/// Wrap an async closure as a [`WorkFn`].
pub fn work_fn<F, Fut>(f: F) -> WorkFn
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
{
    Arc::new(move |args| Box::pin(f(args)))
}

/// Current status of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for its next fire time.
    #[default]
    Pending,
    /// A run is executing.
    Running,
    /// Last run succeeded and no further runs are scheduled.
    Completed,
    /// Last run failed and no further runs are scheduled.
    Failed,
    /// Cancelled before it could run.
    Cancelled,
    /// Withheld because a dependency failed; needs an explicit reschedule.
    Blocked,
}

impl JobStatus {
    /// No further runs will happen without caller intervention.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Blocked
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Blocked => "blocked",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scheduled job, as observed from outside the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Opaque identifier (UUID v4).
    pub id: String,
    /// Human-readable name; also the circuit breaker identity.
    pub name: String,
    pub trigger: Trigger,
    /// Arguments passed to the work function on every run.
    #[serde(default)]
    pub args: Value,
    /// Cap on total runs; `None` is unlimited.
    #[serde(default)]
    pub max_runs: Option<u32>,
    #[serde(default)]
    pub run_count: u32,
    #[serde(default)]
    pub status: JobStatus,
    /// Jobs that must complete before this one may run.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// When the job is next due, if queued.
    #[serde(default)]
    pub next_fire: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    /// Error of the most recent failed run or block reason.
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_category: Option<FailureCategory>,
    /// Failed runs since the last success.
    #[serde(default)]
    pub consecutive_failures: u32,
    pub created_at: DateTime<Utc>,
    /// When the job entered a terminal state.
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub(crate) fn new(id: String, name: String, trigger: Trigger, options: &JobOptions) -> Self {
        Self {
            id,
            name,
            trigger,
            args: options.args.clone(),
            max_runs: options.max_runs,
            run_count: 0,
            status: JobStatus::Pending,
            depends_on: Vec::new(),
            next_fire: None,
            last_run: None,
            last_error: None,
            last_category: None,
            consecutive_failures: 0,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Whether another run is allowed by `max_runs`.
    pub fn has_runs_left(&self) -> bool {
        self.max_runs.is_none_or(|max| self.run_count < max)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Optional parameters for [`Scheduler::schedule`](crate::Scheduler::schedule).
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    pub name: Option<String>,
    pub args: Value,
    pub max_runs: Option<u32>,
    /// Retry failed runs with this policy instead of the scheduler default.
    pub retry: Option<RetryConfig>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }

    pub fn max_runs(mut self, max_runs: u32) -> Self {
        self.max_runs = Some(max_runs);
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// How a single run ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Success {
        output: Value,
    },
    Failure {
        error: String,
        category: FailureCategory,
    },
    /// Not executed; does not count as a run.
    Skipped {
        reason: String,
    },
}

/// Result of one run of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: String,
    /// The run number this result belongs to (0 for skipped runs).
    pub run: u32,
    #[serde(flatten)]
    pub outcome: RunOutcome,
    /// Attempts made, including retries.
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl JobResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, RunOutcome::Success { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.outcome, RunOutcome::Skipped { .. })
    }

    pub fn output(&self) -> Option<&Value> {
        match &self.outcome {
            RunOutcome::Success { output } => Some(output),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            RunOutcome::Failure { error, .. } => Some(error),
            _ => None,
        }
    }
}
