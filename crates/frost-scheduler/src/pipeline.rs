//! Staged job pipelines.
//!
//! Stages run strictly in sequence. The jobs of one stage are submitted to a
//! running [`Scheduler`] together and the pipeline waits until all of them are
//! terminal before moving on.

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::job::WorkFn;
use crate::{JobOptions, JobStatus, Scheduler, SchedulerError, Trigger};

/// One unit of work inside a stage.
#[derive(Clone)]
pub struct StageJob {
    pub name: String,
    pub work: WorkFn,
    pub args: Value,
}

impl StageJob {
    pub fn new(name: impl Into<String>, work: WorkFn) -> Self {
        Self {
            name: name.into(),
            work,
            args: Value::Null,
        }
    }

    pub fn args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }
}

impl std::fmt::Debug for StageJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageJob")
            .field("name", &self.name)
            .field("args", &self.args)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct PipelineStage {
    pub name: String,
    pub jobs: Vec<StageJob>,
    /// Stop the pipeline after this stage if any of its jobs failed.
    pub fail_fast: bool,
}

impl PipelineStage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            jobs: Vec::new(),
            fail_fast: false,
        }
    }

    pub fn job(mut self, name: impl Into<String>, work: WorkFn) -> Self {
        self.jobs.push(StageJob::new(name, work));
        self
    }

    pub fn with_job(mut self, job: StageJob) -> Self {
        self.jobs.push(job);
        self
    }

    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Succeeded,
    /// At least one job did not complete.
    Failed,
    /// Not run because an earlier fail-fast stage failed.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobOutcome {
    pub name: String,
    pub job_id: Option<String>,
    pub status: JobStatus,
    pub error: Option<String>,
    pub output: Option<Value>,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageResult {
    pub name: String,
    pub status: StageStatus,
    pub jobs: Vec<JobOutcome>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineResult {
    pub stages: Vec<StageResult>,
    pub succeeded: bool,
}

impl PipelineResult {
    /// Every job that ended in a non-completed state, across all stages.
    pub fn failed_jobs(&self) -> Vec<&JobOutcome> {
        self.stages
            .iter()
            .flat_map(|stage| &stage.jobs)
            .filter(|job| job.status != JobStatus::Completed)
            .collect()
    }
}

/// Runs [`PipelineStage`]s on a started scheduler.
pub struct JobPipeline<'a> {
    scheduler: &'a Scheduler,
    poll_interval: Duration,
}

impl<'a> JobPipeline<'a> {
    /// Build a pipeline that polls at the scheduler's own cadence.
    pub fn new(scheduler: &'a Scheduler) -> Self {
        Self {
            poll_interval: scheduler.config().poll_interval,
            scheduler,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    #[tracing::instrument(skip(self, stages), fields(stages = stages.len()))]
    pub async fn run(&self, stages: Vec<PipelineStage>) -> Result<PipelineResult, SchedulerError> {
        if !self.scheduler.is_running().await {
            return Err(SchedulerError::NotRunning);
        }

        let mut results = Vec::with_capacity(stages.len());
        let mut halted = false;

        for stage in stages {
            if halted {
                debug!(stage = %stage.name, "skipping stage after fail-fast failure");
                results.push(StageResult {
                    name: stage.name,
                    status: StageStatus::Skipped,
                    jobs: Vec::new(),
                });
                continue;
            }

            let result = self.run_stage(stage.clone()).await?;
            if result.status == StageStatus::Failed {
                warn!(stage = %result.name, fail_fast = stage.fail_fast, "pipeline stage failed");
                halted = stage.fail_fast;
            } else {
                info!(stage = %result.name, jobs = result.jobs.len(), "pipeline stage succeeded");
            }
            results.push(result);
        }

        let succeeded = results.iter().all(|s| s.status == StageStatus::Succeeded);
        Ok(PipelineResult {
            stages: results,
            succeeded,
        })
    }

    async fn run_stage(&self, stage: PipelineStage) -> Result<StageResult, SchedulerError> {
        let now = Utc::now();
        let mut submitted = Vec::with_capacity(stage.jobs.len());
        for job in stage.jobs {
            let options = JobOptions::new()
                .name(format!("{}/{}", stage.name, job.name))
                .args(job.args)
                .max_runs(1);
            let id = self
                .scheduler
                .schedule(job.work, Trigger::once(now), options)
                .await?;
            submitted.push((job.name, id));
        }

        let mut pending: Vec<usize> = (0..submitted.len()).collect();
        let mut outcomes: Vec<Option<JobOutcome>> = vec![None; submitted.len()];

        while !pending.is_empty() {
            let mut still = Vec::with_capacity(pending.len());
            for index in pending {
                let (name, id) = &submitted[index];
                match self.scheduler.get_job(id).await {
                    Some(job) if job.status.is_terminal() => {
                        let result = self.scheduler.last_result(id).await;
                        outcomes[index] = Some(JobOutcome {
                            name: name.clone(),
                            job_id: Some(id.clone()),
                            status: job.status,
                            error: job.last_error,
                            output: result.as_ref().and_then(|r| r.output().cloned()),
                            attempts: result.map(|r| r.attempts).unwrap_or(0),
                        });
                    }
                    Some(_) => still.push(index),
                    None => {
                        // Evicted or removed before we saw it finish.
                        outcomes[index] = Some(JobOutcome {
                            name: name.clone(),
                            job_id: Some(id.clone()),
                            status: JobStatus::Failed,
                            error: Some("job disappeared before finishing".to_string()),
                            output: None,
                            attempts: 0,
                        });
                    }
                }
            }
            pending = still;
            if !pending.is_empty() {
                tokio::time::sleep(self.poll_interval).await;
            }
        }

        let jobs: Vec<JobOutcome> = outcomes.into_iter().flatten().collect();
        let status = if jobs.iter().all(|j| j.status == JobStatus::Completed) {
            StageStatus::Succeeded
        } else {
            StageStatus::Failed
        };
        Ok(StageResult {
            name: stage.name,
            status,
            jobs,
        })
    }
}
