//! `frost run`: drive a persistent scheduler until interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use miette::Result;
use tracing::{info, warn};

use frost_resilience::{CircuitBreakerConfig, HealingLog};
use frost_scheduler::{PersistentScheduler, Scheduler, SchedulerConfig};

use crate::functions::builtin_registry;
use crate::jobfile;

/// Settings for the run command.
pub struct RunConfig {
    pub jobs: Option<PathBuf>,
    pub state: PathBuf,
    pub workers: usize,
    pub poll_interval_ms: u64,
    pub healing_log: Option<PathBuf>,
    pub circuit_threshold: Option<u32>,
    pub circuit_cooldown_secs: u64,
    pub retention_secs: Option<u64>,
}

impl RunConfig {
    fn scheduler_config(&self) -> SchedulerConfig {
        let mut config = SchedulerConfig::default()
            .with_workers(self.workers)
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms));
        if let Some(threshold) = self.circuit_threshold {
            config = config.with_circuit_breaker(CircuitBreakerConfig {
                failure_threshold: threshold,
                cooldown: Duration::from_secs(self.circuit_cooldown_secs),
            });
        }
        if let Some(secs) = self.retention_secs {
            config = config.with_retention(Duration::from_secs(secs));
        }
        config
    }
}

pub async fn run(config: RunConfig) -> Result<()> {
    let healing = match &config.healing_log {
        Some(path) => HealingLog::open(path).map_err(|e| miette::miette!("{}", e))?,
        None => HealingLog::new(),
    };
    let healing = Arc::new(healing);

    let scheduler = Scheduler::with_healing_log(config.scheduler_config(), Arc::clone(&healing))
        .map_err(|e| miette::miette!("invalid scheduler config: {}", e))?;
    let scheduler = PersistentScheduler::with_scheduler(&config.state, scheduler, builtin_registry())
        .await
        .map_err(|e| miette::miette!("failed to load state from {}: {}", config.state.display(), e))?;

    if let Some(path) = &config.jobs {
        let definitions = jobfile::load(path)
            .await
            .map_err(|e| miette::miette!("failed to read job file {}: {}", path.display(), e))?;
        jobfile::apply(&scheduler, &definitions)
            .await
            .map_err(|e| miette::miette!("{}", e))?;
    }

    if scheduler.list_jobs().await.is_empty() {
        warn!("no jobs scheduled; waiting anyway");
    }

    scheduler
        .start()
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    tokio::signal::ctrl_c().await.ok();
    info!("received shutdown signal");

    scheduler
        .stop()
        .await
        .map_err(|e| miette::miette!("failed to save state: {}", e))?;

    let summary = healing.summary();
    info!(
        events = summary.total,
        successes = summary.successes,
        failures = summary.failures,
        success_rate = summary.success_rate,
        "healing summary"
    );
    for job in scheduler.list_jobs().await {
        info!(
            name = %job.name,
            status = %job.status,
            runs = job.run_count,
            last_error = job.last_error.as_deref().unwrap_or(""),
            "job state"
        );
    }

    Ok(())
}
