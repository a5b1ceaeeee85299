//! Durable scheduler state.
//!
//! Jobs whose body was registered under a name are written to a JSON-lines
//! file, one record per job, and reloaded on open. Records that cannot be
//! parsed or whose function is no longer registered are skipped with a
//! warning; unknown fields are ignored.

use std::collections::{HashMap, HashSet};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::RwLock as StdRwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use frost_resilience::{FailureCategory, RetryConfig};

use crate::job::WorkFn;
use crate::{
    DependencyScheduler, FunctionRegistry, Job, JobOptions, JobStatus, Scheduler, SchedulerConfig,
    SchedulerError, Trigger,
};

/// One line of the state file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PersistedJob {
    job_id: String,
    function_name: String,
    name: String,
    trigger: Trigger,
    #[serde(default)]
    args: Value,
    #[serde(default)]
    status: JobStatus,
    #[serde(default)]
    run_count: u32,
    #[serde(default)]
    max_runs: Option<u32>,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    next_fire: Option<DateTime<Utc>>,
    #[serde(default)]
    last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    last_error: Option<String>,
    #[serde(default)]
    last_category: Option<FailureCategory>,
    #[serde(default)]
    consecutive_failures: u32,
    #[serde(default)]
    retry: Option<RetryConfig>,
    created_at: DateTime<Utc>,
    #[serde(default)]
    finished_at: Option<DateTime<Utc>>,
}

impl PersistedJob {
    fn new(job: Job, function_name: String, retry: Option<RetryConfig>) -> Self {
        Self {
            job_id: job.id,
            function_name,
            name: job.name,
            trigger: job.trigger,
            args: job.args,
            status: job.status,
            run_count: job.run_count,
            max_runs: job.max_runs,
            depends_on: job.depends_on,
            next_fire: job.next_fire,
            last_run: job.last_run,
            last_error: job.last_error,
            last_category: job.last_category,
            consecutive_failures: job.consecutive_failures,
            retry,
            created_at: job.created_at,
            finished_at: job.finished_at,
        }
    }

    fn into_parts(self) -> (Job, String, Option<RetryConfig>) {
        let job = Job {
            id: self.job_id,
            name: self.name,
            trigger: self.trigger,
            args: self.args,
            max_runs: self.max_runs,
            run_count: self.run_count,
            status: self.status,
            depends_on: self.depends_on,
            next_fire: self.next_fire,
            last_run: self.last_run,
            last_error: self.last_error,
            last_category: self.last_category,
            consecutive_failures: self.consecutive_failures,
            created_at: self.created_at,
            finished_at: self.finished_at,
        };
        (job, self.function_name, self.retry)
    }
}

/// A [`DependencyScheduler`] whose named jobs survive restarts.
pub struct PersistentScheduler {
    scheduler: DependencyScheduler,
    path: PathBuf,
    registry: StdRwLock<FunctionRegistry>,
    /// Job id -> registered function name.
    functions: RwLock<HashMap<String, String>>,
}

impl PersistentScheduler {
    /// Open a scheduler backed by `path`, reloading any saved jobs.
    pub async fn open(
        path: impl AsRef<Path>,
        config: SchedulerConfig,
        registry: FunctionRegistry,
    ) -> Result<Self, SchedulerError> {
        Self::with_scheduler(path, Scheduler::new(config)?, registry).await
    }

    /// Wrap an existing (empty) scheduler and reload saved jobs into it.
    #[tracing::instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn with_scheduler(
        path: impl AsRef<Path>,
        scheduler: Scheduler,
        registry: FunctionRegistry,
    ) -> Result<Self, SchedulerError> {
        let this = Self {
            scheduler: DependencyScheduler::from_scheduler(scheduler),
            path: path.as_ref().to_path_buf(),
            registry: StdRwLock::new(registry),
            functions: RwLock::new(HashMap::new()),
        };
        this.load().await?;
        Ok(this)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Make `work` available under `name` for scheduling and reload.
    pub fn register_function(&self, name: impl Into<String>, work: WorkFn) {
        let name = name.into();
        debug!(function = %name, "registered function");
        self.registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .register(name, work);
    }

    pub fn registered_functions(&self) -> Vec<String> {
        self.registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .names()
    }

    fn resolve(&self, function: &str) -> Option<WorkFn> {
        self.registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(function)
    }

    /// Schedule a job whose body is the registered function `function`.
    pub async fn schedule_function(
        &self,
        function: &str,
        trigger: Trigger,
        options: JobOptions,
    ) -> Result<String, SchedulerError> {
        let work = self
            .resolve(function)
            .ok_or_else(|| SchedulerError::UnknownFunction(function.to_string()))?;
        let id = self.scheduler.schedule(work, trigger, options).await?;
        self.functions
            .write()
            .await
            .insert(id.clone(), function.to_string());
        Ok(id)
    }

    /// The registered function a job runs, if it is persistable.
    pub async fn function_of(&self, job_id: &str) -> Option<String> {
        self.functions.read().await.get(job_id).cloned()
    }

    async fn load(&self) -> Result<(), SchedulerError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no saved state, starting empty");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let mut loaded = 0usize;
        let mut skipped = 0usize;
        let mut functions = self.functions.write().await;

        for (index, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: PersistedJob = match serde_json::from_str(line) {
                Ok(record) => record,
                Err(e) => {
                    warn!(line = index + 1, error = %e, "skipping malformed job record");
                    skipped += 1;
                    continue;
                }
            };

            let (job, function, retry) = record.into_parts();
            let Some(work) = self.resolve(&function) else {
                warn!(line = index + 1, job_id = %job.id, function = %function, "skipping job with unknown function");
                skipped += 1;
                continue;
            };

            let id = job.id.clone();
            match self.scheduler.restore(job, work, retry).await {
                Ok(()) => {
                    functions.insert(id, function);
                    loaded += 1;
                }
                Err(e) => {
                    warn!(line = index + 1, job_id = %id, error = %e, "skipping unrestorable job");
                    skipped += 1;
                }
            }
        }

        info!(loaded, skipped, "reloaded persisted jobs");
        Ok(())
    }

    /// Write every named job to the state file. Returns the number written.
    ///
    /// Function names of jobs the scheduler no longer holds are dropped.
    #[tracing::instrument(skip(self), fields(path = %self.path.display()))]
    pub async fn flush(&self) -> Result<usize, SchedulerError> {
        let mut functions = self.functions.write().await;
        let entries = self.scheduler.entries().await;
        let live: HashSet<&str> = entries.iter().map(|(job, _)| job.id.as_str()).collect();
        let before = functions.len();
        functions.retain(|id, _| live.contains(id.as_str()));
        if functions.len() < before {
            debug!(pruned = before - functions.len(), "forgot functions of evicted jobs");
        }

        let mut out = String::new();
        let mut written = 0usize;

        for (job, retry) in entries {
            let Some(function) = functions.get(&job.id) else {
                debug!(job_id = %job.id, "job has no registered function, not persisted");
                continue;
            };
            let record = PersistedJob::new(job, function.clone(), retry);
            out.push_str(&serde_json::to_string(&record)?);
            out.push('\n');
            written += 1;
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        tokio::fs::write(&tmp, out).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        info!(written, "flushed scheduler state");
        Ok(written)
    }

    /// Stop the polling loop, wait for running jobs, then flush state.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        self.scheduler.stop().await;
        self.flush().await?;
        Ok(())
    }
}

impl Deref for PersistentScheduler {
    type Target = DependencyScheduler;

    fn deref(&self) -> &Self::Target {
        &self.scheduler
    }
}
