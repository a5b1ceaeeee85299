//! Job scheduler implementation.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::{Mutex, OwnedSemaphorePermit, RwLock, Semaphore, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use frost_resilience::{CircuitBreaker, HealingLog, RetryConfig};

use crate::dependency::{self, Gate};
use crate::job::{JobResult, RunOutcome, WorkFn};
use crate::supervisor::{Execution, RunRequest, Supervisor};
use crate::{Job, JobOptions, JobStatus, SchedulerConfig, SchedulerError, Trigger};

/// A queued fire time. Entries are ordered by fire time, then insertion order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct QueueEntry {
    fire_at: DateTime<Utc>,
    seq: u64,
    job_id: String,
}

struct JobEntry {
    job: Job,
    work: WorkFn,
    retry: Option<RetryConfig>,
    /// Sequence number of the live queue entry; older entries are stale.
    queued: Option<u64>,
    last_result: Option<JobResult>,
}

#[derive(Default)]
struct State {
    jobs: HashMap<String, JobEntry>,
    queue: BinaryHeap<Reverse<QueueEntry>>,
    next_seq: u64,
}

impl State {
    fn enqueue(&mut self, job_id: &str, fire_at: DateTime<Utc>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        if let Some(entry) = self.jobs.get_mut(job_id) {
            entry.queued = Some(seq);
            entry.job.next_fire = Some(fire_at);
            self.queue.push(Reverse(QueueEntry {
                fire_at,
                seq,
                job_id: job_id.to_string(),
            }));
        }
    }

    fn status_of(&self, job_id: &str) -> Option<JobStatus> {
        self.jobs.get(job_id).map(|e| e.job.status)
    }

    /// Non-terminal jobs waiting on `job_id`.
    fn dependents_of(&self, job_id: &str) -> usize {
        self.jobs
            .values()
            .filter(|e| !e.job.is_terminal() && e.job.depends_on.iter().any(|d| d == job_id))
            .count()
    }
}

fn finish(job: &mut Job, status: JobStatus, now: DateTime<Utc>) {
    job.status = status;
    job.next_fire = None;
    job.finished_at = Some(now);
}

struct Inner {
    config: SchedulerConfig,
    state: RwLock<State>,
    workers: Arc<Semaphore>,
    supervisor: Supervisor,
}

struct LoopHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// The job scheduler.
///
/// Jobs sit in a priority queue ordered by next fire time. A background loop
/// wakes every `poll_interval`, pops due jobs and hands them to a bounded pool
/// of `workers`. Recurring jobs are re-queued at dispatch time.
pub struct Scheduler {
    inner: Arc<Inner>,
    running: Mutex<Option<LoopHandle>>,
}

impl Scheduler {
    /// Create a new scheduler with an in-memory healing log.
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        Self::with_healing_log(config, Arc::new(HealingLog::new()))
    }

    /// Create a new scheduler that records recoveries into `healing`.
    pub fn with_healing_log(
        config: SchedulerConfig,
        healing: Arc<HealingLog>,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;
        let supervisor = Supervisor::new(&config, healing)?;
        Ok(Self {
            inner: Arc::new(Inner {
                workers: Arc::new(Semaphore::new(config.workers)),
                config,
                state: RwLock::new(State::default()),
                supervisor,
            }),
            running: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.inner.supervisor
    }

    pub fn healing_log(&self) -> &Arc<HealingLog> {
        self.inner.supervisor.healing_log()
    }

    pub fn circuit_breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.inner.supervisor.circuit_breaker()
    }

    /// Register a job and queue its first fire time.
    #[tracing::instrument(skip(self, work, trigger, options), fields(trigger = %trigger))]
    pub async fn schedule(
        &self,
        work: WorkFn,
        trigger: Trigger,
        options: JobOptions,
    ) -> Result<String, SchedulerError> {
        trigger.validate()?;
        if options.max_runs == Some(0) {
            return Err(SchedulerError::InvalidConfig(
                "max_runs must be at least 1".to_string(),
            ));
        }
        if let Some(retry) = &options.retry {
            retry.validate()?;
        }

        let now = Utc::now();
        let trigger = trigger.anchored(now);
        let first = trigger
            .first_fire(now)
            .ok_or_else(|| SchedulerError::InvalidTrigger(format!("{trigger} never fires")))?;

        let id = Uuid::new_v4().to_string();
        let name = match &options.name {
            Some(name) => name.clone(),
            None => format!("job-{}", id.split('-').next().unwrap_or(&id)),
        };
        let job = Job::new(id.clone(), name.clone(), trigger, &options);

        let mut state = self.inner.state.write().await;
        state.jobs.insert(
            id.clone(),
            JobEntry {
                job,
                work,
                retry: options.retry,
                queued: None,
                last_result: None,
            },
        );
        state.enqueue(&id, first);

        info!(job_id = %id, name = %name, next_fire = %first, "scheduled job");
        Ok(id)
    }

    /// Re-insert a previously persisted job under its original id.
    ///
    /// A job that was running when state was saved is treated as pending.
    pub(crate) async fn restore(
        &self,
        mut job: Job,
        work: WorkFn,
        retry: Option<RetryConfig>,
    ) -> Result<(), SchedulerError> {
        job.trigger.validate()?;
        let now = Utc::now();

        if job.status == JobStatus::Running {
            debug!(job_id = %job.id, "job was interrupted, re-queueing");
            job.status = JobStatus::Pending;
        }

        let fire = if job.status == JobStatus::Pending {
            let fire = job
                .next_fire
                .or_else(|| job.trigger.first_fire(now))
                .filter(|_| job.has_runs_left());
            if fire.is_none() {
                warn!(job_id = %job.id, "restored job has no future fire time, marking completed");
                finish(&mut job, JobStatus::Completed, now);
            }
            fire
        } else {
            job.next_fire = None;
            None
        };

        let mut state = self.inner.state.write().await;
        if state.jobs.contains_key(&job.id) {
            return Err(SchedulerError::JobExists(job.id));
        }
        let id = job.id.clone();
        state.jobs.insert(
            id.clone(),
            JobEntry {
                job,
                work,
                retry,
                queued: None,
                last_result: None,
            },
        );
        if let Some(fire) = fire {
            state.enqueue(&id, fire);
        }
        Ok(())
    }

    /// Cancel a pending or blocked job. Returns false if the job is unknown,
    /// running, or already finished.
    pub async fn cancel(&self, job_id: &str) -> bool {
        let mut state = self.inner.state.write().await;
        let Some(entry) = state.jobs.get_mut(job_id) else {
            return false;
        };
        if !matches!(entry.job.status, JobStatus::Pending | JobStatus::Blocked) {
            return false;
        }

        entry.queued = None;
        finish(&mut entry.job, JobStatus::Cancelled, Utc::now());
        info!(job_id, name = %entry.job.name, "cancelled job");
        true
    }

    /// Re-arm a failed, blocked or cancelled job with a fresh run count.
    ///
    /// Returns false if the job is in any other state.
    pub async fn reschedule(&self, job_id: &str) -> Result<bool, SchedulerError> {
        let mut state = self.inner.state.write().await;
        let entry = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;

        if !matches!(
            entry.job.status,
            JobStatus::Failed | JobStatus::Blocked | JobStatus::Cancelled
        ) {
            return Ok(false);
        }

        let now = Utc::now();
        let fire = entry.job.trigger.first_fire(now).ok_or_else(|| {
            SchedulerError::InvalidTrigger(format!("{} has no future fire time", entry.job.trigger))
        })?;

        let job = &mut entry.job;
        job.status = JobStatus::Pending;
        job.run_count = 0;
        job.consecutive_failures = 0;
        job.last_error = None;
        job.last_category = None;
        job.finished_at = None;
        state.enqueue(job_id, fire);

        info!(job_id, next_fire = %fire, "rescheduled job");
        Ok(true)
    }

    /// Run a job immediately, outside its schedule, once a worker is free.
    ///
    /// The job's `max_runs` and dependencies apply as they do for scheduled
    /// runs. A failed prerequisite leaves the job `blocked`.
    #[tracing::instrument(skip(self))]
    pub async fn run_now(&self, job_id: &str) -> Result<JobResult, SchedulerError> {
        let permit = Arc::clone(&self.inner.workers)
            .acquire_owned()
            .await
            .map_err(|_| SchedulerError::NotRunning)?;

        let request = {
            let mut state = self.inner.state.write().await;
            let job = &state
                .jobs
                .get(job_id)
                .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?
                .job;

            match job.status {
                JobStatus::Running => return Err(SchedulerError::JobRunning(job_id.to_string())),
                JobStatus::Cancelled => {
                    return Err(SchedulerError::InvalidConfig(format!(
                        "job {job_id} is cancelled"
                    )));
                }
                _ => {}
            }
            if !job.has_runs_left() {
                return Err(SchedulerError::RunsExhausted(job_id.to_string()));
            }

            let gate = dependency::gate(&job.depends_on, |id| state.status_of(id));
            let now = Utc::now();
            match gate {
                Gate::Ready => {}
                Gate::Wait => {
                    return Err(SchedulerError::DependenciesPending(job_id.to_string()));
                }
                Gate::Blocked(reason) => {
                    if let Some(entry) = state.jobs.get_mut(job_id) {
                        warn!(job_id, name = %entry.job.name, reason = %reason, "job blocked by dependency");
                        entry.queued = None;
                        entry.job.last_error = Some(reason.clone());
                        finish(&mut entry.job, JobStatus::Blocked, now);
                    }
                    return Err(SchedulerError::JobBlocked {
                        job_id: job_id.to_string(),
                        reason,
                    });
                }
            }

            let dependents = state.dependents_of(job_id);
            let entry = state
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;
            if !self.inner.supervisor.admit(&entry.job.name) {
                let result = skipped(job_id, &entry.job.name, now);
                entry.last_result = Some(result.clone());
                return Ok(result);
            }
            let request = begin_run(entry, dependents, now);
            if !entry.job.has_runs_left() {
                // This run used up the job; drop its pending occurrence.
                entry.queued = None;
                entry.job.next_fire = None;
            }
            request
        };

        Ok(Arc::clone(&self.inner).execute(request, permit).await)
    }

    /// Start the background polling loop.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|h| !h.task.is_finished()) {
            return Err(SchedulerError::AlreadyRunning);
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move { inner.run(shutdown_rx).await });
        *running = Some(LoopHandle { shutdown, task });
        Ok(())
    }

    /// Stop the polling loop and wait for in-flight runs to finish.
    pub async fn stop(&self) {
        let handle = self.running.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.shutdown.send(true);
            if let Err(e) = handle.task.await {
                warn!(error = %e, "scheduler loop ended abnormally");
            }
        }

        let workers = u32::try_from(self.inner.config.workers).unwrap_or(u32::MAX);
        if let Ok(permits) = self.inner.workers.acquire_many(workers).await {
            drop(permits);
        }
    }

    /// Whether the polling loop is running.
    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| !h.task.is_finished())
    }

    /// Get a job by id.
    pub async fn get_job(&self, job_id: &str) -> Option<Job> {
        self.inner
            .state
            .read()
            .await
            .jobs
            .get(job_id)
            .map(|e| e.job.clone())
    }

    /// Get the oldest job with the given name.
    pub async fn get_job_by_name(&self, name: &str) -> Option<Job> {
        self.inner
            .state
            .read()
            .await
            .jobs
            .values()
            .filter(|e| e.job.name == name)
            .min_by(|a, b| (a.job.created_at, &a.job.id).cmp(&(b.job.created_at, &b.job.id)))
            .map(|e| e.job.clone())
    }

    /// List all jobs, oldest first.
    pub async fn list_jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .inner
            .state
            .read()
            .await
            .jobs
            .values()
            .map(|e| e.job.clone())
            .collect();
        jobs.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        jobs
    }

    /// The result of the most recent run (or skipped run) of a job.
    pub async fn last_result(&self, job_id: &str) -> Option<JobResult> {
        self.inner
            .state
            .read()
            .await
            .jobs
            .get(job_id)
            .and_then(|e| e.last_result.clone())
    }

    /// Jobs together with their retry policy, oldest first.
    pub(crate) async fn entries(&self) -> Vec<(Job, Option<RetryConfig>)> {
        let state = self.inner.state.read().await;
        let mut entries: Vec<(Job, Option<RetryConfig>)> = state
            .jobs
            .values()
            .map(|e| (e.job.clone(), e.retry.clone()))
            .collect();
        entries.sort_by(|(a, _), (b, _)| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        entries
    }

    pub(crate) async fn add_dependencies(
        &self,
        job_id: &str,
        depends_on: &[String],
    ) -> Result<(), SchedulerError> {
        let mut state = self.inner.state.write().await;
        if !state.jobs.contains_key(job_id) {
            return Err(SchedulerError::JobNotFound(job_id.to_string()));
        }

        for dep in depends_on {
            if !state.jobs.contains_key(dep) {
                return Err(SchedulerError::JobNotFound(dep.clone()));
            }
            let creates_cycle = dependency::reaches(dep, job_id, |id| {
                state.jobs.get(id).map(|e| e.job.depends_on.as_slice())
            });
            if creates_cycle {
                return Err(SchedulerError::DependencyCycle(format!(
                    "{job_id} -> {dep} would form a cycle"
                )));
            }
        }

        if let Some(entry) = state.jobs.get_mut(job_id) {
            for dep in depends_on {
                if !entry.job.depends_on.contains(dep) {
                    entry.job.depends_on.push(dep.clone());
                }
            }
            debug!(job_id, depends_on = ?entry.job.depends_on, "updated dependencies");
        }
        Ok(())
    }
}

/// Mark a job as running and capture what its run needs.
fn begin_run(entry: &mut JobEntry, dependents: usize, now: DateTime<Utc>) -> RunRequest {
    let job = &mut entry.job;
    job.run_count += 1;
    job.status = JobStatus::Running;
    job.last_run = Some(now);

    RunRequest {
        job_id: job.id.clone(),
        name: job.name.clone(),
        run: job.run_count,
        work: Arc::clone(&entry.work),
        args: job.args.clone(),
        retry: entry.retry.clone(),
        consecutive_failures: job.consecutive_failures,
        dependents,
    }
}

fn skipped(job_id: &str, name: &str, now: DateTime<Utc>) -> JobResult {
    debug!(job_id, name, "circuit open, skipping run");
    JobResult {
        job_id: job_id.to_string(),
        run: 0,
        outcome: RunOutcome::Skipped {
            reason: format!("circuit open for {name}"),
        },
        attempts: 0,
        started_at: now,
        finished_at: now,
    }
}

impl Inner {
    /// The polling loop.
    async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            workers = self.config.workers,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "scheduler starting"
        );

        loop {
            if *shutdown_rx.borrow() {
                info!("scheduler shutting down");
                break;
            }

            self.poll().await;

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if *shutdown_rx.borrow() {
                        info!("scheduler received shutdown signal");
                    }
                }
                _ = sleep(self.config.poll_interval) => {}
            }
        }

        info!("scheduler shut down gracefully");
    }

    /// Dispatch every due job a worker is available for, then evict expired jobs.
    async fn poll(self: &Arc<Self>) {
        let now = Utc::now();
        let mut deferred = Vec::new();

        loop {
            let Ok(permit) = Arc::clone(&self.workers).try_acquire_owned() else {
                break;
            };
            let request = {
                let mut state = self.state.write().await;
                self.next_due(&mut state, now, &mut deferred)
            };
            let Some(request) = request else {
                break;
            };

            let inner = Arc::clone(self);
            tokio::spawn(async move {
                inner.execute(request, permit).await;
            });
        }

        if !deferred.is_empty() {
            let mut state = self.state.write().await;
            state.queue.extend(deferred.into_iter().map(Reverse));
        }

        self.evict_expired(now).await;
    }

    /// Pop queue entries until one is ready to run.
    ///
    /// Jobs still waiting on dependencies are collected in `deferred` and
    /// re-queued by the caller after the pass.
    fn next_due(
        &self,
        state: &mut State,
        now: DateTime<Utc>,
        deferred: &mut Vec<QueueEntry>,
    ) -> Option<RunRequest> {
        loop {
            if state.queue.peek().is_none_or(|Reverse(head)| head.fire_at > now) {
                return None;
            }
            let Reverse(entry) = state.queue.pop()?;

            let Some(job_entry) = state.jobs.get(&entry.job_id) else {
                continue;
            };
            if job_entry.queued != Some(entry.seq) {
                continue;
            }

            match job_entry.job.status {
                JobStatus::Pending => {}
                JobStatus::Running => {
                    debug!(job_id = %entry.job_id, "previous run still in progress, skipping occurrence");
                    self.requeue_next(state, &entry.job_id, now);
                    continue;
                }
                _ => continue,
            }

            let gate = dependency::gate(&job_entry.job.depends_on, |id| state.status_of(id));
            match gate {
                Gate::Ready => {}
                Gate::Wait => {
                    deferred.push(entry);
                    continue;
                }
                Gate::Blocked(reason) => {
                    if let Some(job_entry) = state.jobs.get_mut(&entry.job_id) {
                        warn!(job_id = %entry.job_id, name = %job_entry.job.name, reason = %reason, "job blocked by dependency");
                        job_entry.queued = None;
                        job_entry.job.last_error = Some(reason);
                        finish(&mut job_entry.job, JobStatus::Blocked, now);
                    }
                    continue;
                }
            }

            let dependents = state.dependents_of(&entry.job_id);
            let job_entry = state.jobs.get_mut(&entry.job_id)?;

            if !self.supervisor.admit(&job_entry.job.name) {
                job_entry.last_result = Some(skipped(&entry.job_id, &job_entry.job.name, now));
                self.requeue_skipped(state, &entry.job_id, now);
                continue;
            }

            job_entry.queued = None;
            job_entry.job.next_fire = None;
            let request = begin_run(job_entry, dependents, now);

            if job_entry.job.has_runs_left() {
                if let Some(next) = job_entry.job.trigger.next_fire(now) {
                    state.enqueue(&entry.job_id, next);
                    debug!(job_id = %entry.job_id, next_fire = %next, "re-queued recurring job");
                }
            }

            debug!(job_id = %request.job_id, run = request.run, "dispatching job");
            return Some(request);
        }
    }

    /// Queue the occurrence after `now`, if the job has one.
    fn requeue_next(&self, state: &mut State, job_id: &str, now: DateTime<Utc>) {
        let next = state.jobs.get_mut(job_id).and_then(|entry| {
            entry.queued = None;
            entry.job.next_fire = None;
            if entry.job.has_runs_left() {
                entry.job.trigger.next_fire(now)
            } else {
                None
            }
        });
        if let Some(next) = next {
            state.enqueue(job_id, next);
        }
    }

    /// Keep a job whose run was refused by the circuit breaker on schedule.
    ///
    /// A trigger without further occurrences retries at the next poll.
    fn requeue_skipped(&self, state: &mut State, job_id: &str, now: DateTime<Utc>) {
        let poll = TimeDelta::from_std(self.config.poll_interval)
            .unwrap_or_else(|_| TimeDelta::milliseconds(100));
        let next = state.jobs.get(job_id).map(|entry| {
            entry
                .job
                .trigger
                .next_fire(now)
                .unwrap_or(now + poll)
        });
        if let Some(next) = next {
            state.enqueue(job_id, next);
        }
    }

    /// Run one job body on a worker and record the outcome.
    async fn execute(self: Arc<Self>, request: RunRequest, permit: OwnedSemaphorePermit) -> JobResult {
        let started_at = Utc::now();
        let execution = self.supervisor.run(&request).await;
        let result = self.complete(&request, execution, started_at).await;
        drop(permit);
        result
    }

    async fn complete(
        &self,
        request: &RunRequest,
        execution: Execution,
        started_at: DateTime<Utc>,
    ) -> JobResult {
        let finished_at = Utc::now();
        let result = JobResult {
            job_id: request.job_id.clone(),
            run: request.run,
            outcome: execution.outcome,
            attempts: execution.attempts,
            started_at,
            finished_at,
        };

        let mut state = self.state.write().await;
        if let Some(entry) = state.jobs.get_mut(&request.job_id) {
            let job = &mut entry.job;
            let succeeded = result.is_success();
            match &result.outcome {
                RunOutcome::Failure { error, category } => {
                    job.consecutive_failures += 1;
                    job.last_error = Some(error.clone());
                    job.last_category = Some(*category);
                }
                _ => {
                    job.consecutive_failures = 0;
                    job.last_error = None;
                    job.last_category = None;
                }
            }

            if job.status == JobStatus::Running {
                if entry.queued.is_some() {
                    job.status = JobStatus::Pending;
                } else if succeeded {
                    finish(job, JobStatus::Completed, finished_at);
                } else {
                    finish(job, JobStatus::Failed, finished_at);
                }
            }

            if succeeded {
                info!(
                    job_id = %job.id,
                    name = %job.name,
                    run = request.run,
                    status = %job.status,
                    "job run completed"
                );
            }
            entry.last_result = Some(result.clone());
        }
        result
    }

    /// Drop terminal jobs past their retention, unless a live job depends on them.
    /// Blocked jobs are kept until they are rescheduled or cancelled.
    async fn evict_expired(&self, now: DateTime<Utc>) {
        let Some(retention) = self.config.retention else {
            return;
        };
        let Ok(retention) = TimeDelta::from_std(retention) else {
            return;
        };

        let mut state = self.state.write().await;
        let needed: HashSet<String> = state
            .jobs
            .values()
            .filter(|e| !e.job.is_terminal() || e.job.status == JobStatus::Blocked)
            .flat_map(|e| e.job.depends_on.iter().cloned())
            .collect();

        let before = state.jobs.len();
        state.jobs.retain(|id, entry| {
            let expired = entry.job.is_terminal()
                && entry.job.status != JobStatus::Blocked
                && entry
                    .job
                    .finished_at
                    .is_some_and(|finished| finished + retention <= now);
            !expired || needed.contains(id)
        });

        let evicted = before - state.jobs.len();
        if evicted > 0 {
            debug!(evicted, "evicted expired jobs");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work_fn;
    use frost_resilience::{BoxError, CircuitBreakerConfig};
    use serde_json::{Value, json};
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig::default().with_poll_interval(Duration::from_millis(10))
    }

    fn noop() -> WorkFn {
        work_fn(|_| async { Ok(Value::Null) })
    }

    fn later() -> Trigger {
        Trigger::once(Utc::now() + TimeDelta::hours(1))
    }

    // === Unit Tests ===

    #[tokio::test]
    async fn test_schedule_rejects_bad_parameters() {
        let scheduler = Scheduler::new(SchedulerConfig::default()).unwrap();

        let zero_period = scheduler
            .schedule(noop(), Trigger::every(Duration::ZERO), JobOptions::new())
            .await;
        assert!(matches!(zero_period, Err(SchedulerError::InvalidTrigger(_))));

        let zero_runs = scheduler
            .schedule(noop(), later(), JobOptions::new().max_runs(0))
            .await;
        assert!(matches!(zero_runs, Err(SchedulerError::InvalidConfig(_))));

        let past = Utc::now() - TimeDelta::hours(2);
        let ended = scheduler
            .schedule(
                noop(),
                Trigger::interval(Duration::from_secs(1), Some(past), Some(past)),
                JobOptions::new(),
            )
            .await;
        assert!(matches!(ended, Err(SchedulerError::InvalidTrigger(_))));

        assert!(scheduler.list_jobs().await.is_empty());
    }

    #[tokio::test]
    async fn test_schedule_and_query() {
        let scheduler = Scheduler::new(SchedulerConfig::default()).unwrap();
        let id = scheduler
            .schedule(
                noop(),
                later(),
                JobOptions::new().name("report").args(json!({"x": 1})),
            )
            .await
            .unwrap();

        let job = scheduler.get_job(&id).await.unwrap();
        assert_eq!(job.name, "report");
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.args, json!({"x": 1}));
        assert!(job.next_fire.is_some());

        assert_eq!(scheduler.get_job_by_name("report").await.unwrap().id, id);
        assert_eq!(scheduler.list_jobs().await.len(), 1);
        assert!(scheduler.last_result(&id).await.is_none());
        assert!(scheduler.get_job("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_default_name_is_derived_from_id() {
        let scheduler = Scheduler::new(SchedulerConfig::default()).unwrap();
        let id = scheduler
            .schedule(noop(), later(), JobOptions::new())
            .await
            .unwrap();
        let job = scheduler.get_job(&id).await.unwrap();
        assert!(job.name.starts_with("job-"));
        assert!(id.starts_with(&job.name["job-".len()..]));
    }

    #[tokio::test]
    async fn test_cancel_only_pending_jobs() {
        let scheduler = Scheduler::new(fast_config()).unwrap();
        let id = scheduler
            .schedule(noop(), later(), JobOptions::new())
            .await
            .unwrap();

        assert!(scheduler.cancel(&id).await);
        assert_eq!(
            scheduler.get_job(&id).await.unwrap().status,
            JobStatus::Cancelled
        );
        assert!(!scheduler.cancel(&id).await);
        assert!(!scheduler.cancel("missing").await);
    }

    #[tokio::test]
    async fn test_cancelled_job_never_runs() {
        let scheduler = Scheduler::new(fast_config()).unwrap();
        let runs = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&runs);
        let id = scheduler
            .schedule(
                work_fn(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Ok(Value::Null) }
                }),
                Trigger::once(Utc::now() + TimeDelta::milliseconds(50)),
                JobOptions::new(),
            )
            .await
            .unwrap();

        assert!(scheduler.cancel(&id).await);
        scheduler.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        scheduler.stop().await;

        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_run_now_bypasses_schedule() {
        let scheduler = Scheduler::new(SchedulerConfig::default()).unwrap();
        let id = scheduler
            .schedule(
                work_fn(|args| async move { Ok(json!({"echo": args})) }),
                later(),
                JobOptions::new().args(json!("hi")),
            )
            .await
            .unwrap();

        let result = scheduler.run_now(&id).await.unwrap();
        assert_eq!(result.output(), Some(&json!({"echo": "hi"})));
        assert_eq!(result.run, 1);

        let job = scheduler.get_job(&id).await.unwrap();
        assert_eq!(job.run_count, 1);
        // The scheduled occurrence is still queued.
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(scheduler.last_result(&id).await, Some(result));

        assert!(matches!(
            scheduler.run_now("missing").await,
            Err(SchedulerError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_run_now_respects_max_runs() {
        let scheduler = Scheduler::new(SchedulerConfig::default()).unwrap();
        let runs = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&runs);
        let id = scheduler
            .schedule(
                work_fn(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Ok(Value::Null) }
                }),
                Trigger::every(Duration::from_secs(3600)),
                JobOptions::new().max_runs(1),
            )
            .await
            .unwrap();

        assert!(scheduler.run_now(&id).await.unwrap().is_success());
        assert!(matches!(
            scheduler.run_now(&id).await,
            Err(SchedulerError::RunsExhausted(_))
        ));

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        let job = scheduler.get_job(&id).await.unwrap();
        assert_eq!(job.run_count, 1);
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_failure_is_queryable_and_reschedulable() {
        let scheduler = Scheduler::new(fast_config()).unwrap();
        let id = scheduler
            .schedule(
                work_fn(|_| async { Err::<Value, BoxError>("connection timed out".into()) }),
                Trigger::once(Utc::now()),
                JobOptions::new(),
            )
            .await
            .unwrap();

        scheduler.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let job = scheduler.get_job(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.last_error.as_deref(), Some("connection timed out"));
        assert_eq!(job.last_category, Some(frost_resilience::FailureCategory::Timeout));
        assert!(job.finished_at.is_some());

        assert!(scheduler.reschedule(&id).await.unwrap());
        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.stop().await;

        let job = scheduler.get_job(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.run_count, 1);
        assert_eq!(job.consecutive_failures, 1);
        assert_eq!(scheduler.healing_log().len(), 2);
    }

    #[tokio::test]
    async fn test_reschedule_ignores_live_jobs() {
        let scheduler = Scheduler::new(SchedulerConfig::default()).unwrap();
        let id = scheduler
            .schedule(noop(), later(), JobOptions::new())
            .await
            .unwrap();
        assert!(!scheduler.reschedule(&id).await.unwrap());
        assert!(matches!(
            scheduler.reschedule("missing").await,
            Err(SchedulerError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_dispatch_order_follows_fire_time_then_insertion() {
        let scheduler = Scheduler::new(fast_config().with_workers(1)).unwrap();
        let order = Arc::new(StdMutex::new(Vec::new()));
        let base = Utc::now() - TimeDelta::seconds(10);

        let offsets = [("c", 3), ("a", 1), ("b1", 2), ("b2", 2)];
        for (name, offset) in offsets {
            let order = Arc::clone(&order);
            let label = name.to_string();
            scheduler
                .schedule(
                    work_fn(move |_| {
                        order.lock().unwrap().push(label.clone());
                        async { Ok(Value::Null) }
                    }),
                    Trigger::once(base + TimeDelta::seconds(offset)),
                    JobOptions::new().name(name),
                )
                .await
                .unwrap();
        }

        scheduler.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        scheduler.stop().await;

        assert_eq!(*order.lock().unwrap(), vec!["a", "b1", "b2", "c"]);
    }

    #[tokio::test]
    async fn test_worker_pool_bounds_concurrency() {
        let scheduler = Scheduler::new(fast_config().with_workers(2)).unwrap();
        let active = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        for _ in 0..6 {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            scheduler
                .schedule(
                    work_fn(move |_| {
                        let active = Arc::clone(&active);
                        let peak = Arc::clone(&peak);
                        async move {
                            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(40)).await;
                            active.fetch_sub(1, Ordering::SeqCst);
                            Ok(Value::Null)
                        }
                    }),
                    Trigger::once(Utc::now()),
                    JobOptions::new(),
                )
                .await
                .unwrap();
        }

        scheduler.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        scheduler.stop().await;

        assert_eq!(peak.load(Ordering::SeqCst), 2);
        for job in scheduler.list_jobs().await {
            assert_eq!(job.status, JobStatus::Completed);
        }
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_runs() {
        let scheduler = Scheduler::new(fast_config()).unwrap();
        let id = scheduler
            .schedule(
                work_fn(|_| async {
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    Ok(Value::Null)
                }),
                Trigger::once(Utc::now()),
                JobOptions::new(),
            )
            .await
            .unwrap();

        scheduler.start().await.unwrap();
        assert!(scheduler.is_running().await);
        assert!(matches!(
            scheduler.start().await,
            Err(SchedulerError::AlreadyRunning)
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.stop().await;

        assert!(!scheduler.is_running().await);
        assert_eq!(
            scheduler.get_job(&id).await.unwrap().status,
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_open_circuit_skips_without_consuming_runs() {
        let config = fast_config().with_circuit_breaker(CircuitBreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::from_secs(60),
        });
        let scheduler = Scheduler::new(config).unwrap();
        let id = scheduler
            .schedule(
                work_fn(|_| async { Err::<Value, BoxError>("service unavailable".into()) }),
                Trigger::every(Duration::from_millis(30)),
                JobOptions::new().name("flaky").max_runs(5),
            )
            .await
            .unwrap();

        scheduler.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        scheduler.stop().await;

        let job = scheduler.get_job(&id).await.unwrap();
        assert_eq!(job.run_count, 1);
        assert_eq!(job.status, JobStatus::Pending);
        assert!(scheduler.last_result(&id).await.unwrap().is_skipped());

        let breaker = scheduler.circuit_breaker().unwrap();
        assert_eq!(breaker.state("flaky"), frost_resilience::CircuitState::Open);
    }

    #[tokio::test]
    async fn test_retention_evicts_finished_jobs() {
        let scheduler =
            Scheduler::new(fast_config().with_retention(Duration::from_millis(50))).unwrap();
        let id = scheduler
            .schedule(noop(), Trigger::once(Utc::now()), JobOptions::new())
            .await
            .unwrap();

        scheduler.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        scheduler.stop().await;

        assert!(scheduler.get_job(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_per_job_retry_recovers() {
        let scheduler = Scheduler::new(fast_config()).unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let id = scheduler
            .schedule(
                work_fn(move |_| {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n == 0 {
                            Err::<Value, BoxError>("too many requests".into())
                        } else {
                            Ok(json!(n))
                        }
                    }
                }),
                later(),
                JobOptions::new().retry(RetryConfig {
                    max_retries: 2,
                    base_delay: Duration::from_millis(5),
                    backoff_factor: 2.0,
                    max_delay: Duration::from_millis(20),
                }),
            )
            .await
            .unwrap();

        let result = scheduler.run_now(&id).await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.attempts, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.healing_log().success_rate(), 1.0);
    }
}
