//! Job scheduler for Frost.
//!
//! This crate provides an in-process scheduler that:
//! - Fires jobs from one-shot, interval and cron triggers
//! - Dispatches due jobs to a bounded worker pool
//! - Holds jobs back until their dependencies complete
//! - Persists named jobs to disk and reloads them on restart
//! - Runs staged pipelines of concurrent jobs
//!
//! Failed runs are classified, retried and diagnosed through
//! [`frost_resilience`].

mod config;
mod dependency;
mod error;
mod job;
mod persistent;
mod pipeline;
mod registry;
mod scheduler;
mod supervisor;
mod trigger;

pub use config::SchedulerConfig;
pub use dependency::DependencyScheduler;
pub use error::SchedulerError;
pub use job::{Job, JobOptions, JobResult, JobStatus, RunOutcome, WorkFn, work_fn};
pub use persistent::PersistentScheduler;
pub use pipeline::{
    JobOutcome, JobPipeline, PipelineResult, PipelineStage, StageJob, StageResult, StageStatus,
};
pub use registry::FunctionRegistry;
pub use scheduler::Scheduler;
pub use supervisor::{JobPanicked, Supervisor};
pub use trigger::{CRON_SCAN_LIMIT, CronExpr, Trigger};
