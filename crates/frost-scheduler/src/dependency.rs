//! Dependency-aware scheduling.
//!
//! A job with dependencies is held in the queue until every prerequisite has
//! completed. If a prerequisite fails, is cancelled or is itself blocked, the
//! dependent job becomes `blocked` and stays that way until the caller
//! reschedules or cancels it.

use std::collections::HashSet;
use std::ops::Deref;

use crate::{Job, JobStatus, Scheduler, SchedulerConfig, SchedulerError};

/// Outcome of checking a job's prerequisites at dispatch time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Gate {
    Ready,
    /// Some prerequisite is still pending or running.
    Wait,
    Blocked(String),
}

pub(crate) fn gate<F>(depends_on: &[String], status_of: F) -> Gate
where
    F: Fn(&str) -> Option<JobStatus>,
{
    let mut waiting = false;
    for dep in depends_on {
        match status_of(dep) {
            Some(JobStatus::Completed) => {}
            Some(JobStatus::Pending | JobStatus::Running) => waiting = true,
            Some(status) => return Gate::Blocked(format!("dependency {dep} is {status}")),
            None => return Gate::Blocked(format!("dependency {dep} no longer exists")),
        }
    }
    if waiting { Gate::Wait } else { Gate::Ready }
}

/// Whether `from` transitively depends on `target`.
pub(crate) fn reaches<'a, F>(from: &'a str, target: &str, depends_on: F) -> bool
where
    F: Fn(&str) -> Option<&'a [String]>,
{
    let mut stack = vec![from];
    let mut seen = HashSet::new();
    while let Some(id) = stack.pop() {
        if id == target {
            return true;
        }
        if !seen.insert(id) {
            continue;
        }
        if let Some(deps) = depends_on(id) {
            stack.extend(deps.iter().map(String::as_str));
        }
    }
    false
}

/// A [`Scheduler`] whose jobs can wait on other jobs.
pub struct DependencyScheduler {
    scheduler: Scheduler,
}

impl DependencyScheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        Ok(Self::from_scheduler(Scheduler::new(config)?))
    }

    pub fn from_scheduler(scheduler: Scheduler) -> Self {
        Self { scheduler }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Make `job_id` wait for every job in `depends_on` to complete.
    ///
    /// All jobs must exist, and the new edges must not create a cycle.
    #[tracing::instrument(skip(self, depends_on))]
    pub async fn add_dependency<I, S>(&self, job_id: &str, depends_on: I) -> Result<(), SchedulerError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let depends_on: Vec<String> = depends_on.into_iter().map(Into::into).collect();
        self.scheduler.add_dependencies(job_id, &depends_on).await
    }

    /// Direct prerequisites of a job.
    pub async fn dependencies(&self, job_id: &str) -> Vec<String> {
        self.scheduler
            .get_job(job_id)
            .await
            .map(|job| job.depends_on)
            .unwrap_or_default()
    }

    /// Jobs that directly depend on `job_id`.
    pub async fn dependents(&self, job_id: &str) -> Vec<String> {
        self.scheduler
            .list_jobs()
            .await
            .into_iter()
            .filter(|job| job.depends_on.iter().any(|d| d == job_id))
            .map(|job| job.id)
            .collect()
    }

    /// Jobs held back by a failed prerequisite.
    pub async fn blocked_jobs(&self) -> Vec<Job> {
        self.scheduler
            .list_jobs()
            .await
            .into_iter()
            .filter(|job| job.status == JobStatus::Blocked)
            .collect()
    }
}

impl Deref for DependencyScheduler {
    type Target = Scheduler;

    fn deref(&self) -> &Self::Target {
        &self.scheduler
    }
}
