//! Job definition files.
//!
//! A job file is a JSON array of definitions:
//!
//! ```json
//! [
//!   {"name": "backup", "function": "command",
//!    "trigger": {"type": "cron", "expression": "0 3 * * *"},
//!    "args": {"program": "restic", "args": ["backup", "/srv"]}},
//!   {"name": "notify", "function": "log", "depends_on": ["backup"],
//!    "trigger": {"type": "interval", "period_ms": 86400000}}
//! ]
//! ```
//!
//! Dependencies refer to other jobs by name.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use frost_resilience::RetryConfig;
use frost_scheduler::{JobOptions, PersistentScheduler, SchedulerError, Trigger};

#[derive(Debug, Clone, Deserialize)]
pub struct JobDefinition {
    pub name: String,
    pub function: String,
    pub trigger: Trigger,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub max_runs: Option<u32>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl JobDefinition {
    fn options(&self) -> JobOptions {
        let mut options = JobOptions::new().name(&self.name).args(self.args.clone());
        if let Some(max_runs) = self.max_runs {
            options = options.max_runs(max_runs);
        }
        if let Some(retry) = &self.retry {
            options = options.retry(retry.clone());
        }
        options
    }
}

pub fn parse(contents: &str) -> Result<Vec<JobDefinition>, SchedulerError> {
    let definitions: Vec<JobDefinition> = serde_json::from_str(contents)?;

    let mut names = HashSet::new();
    for def in &definitions {
        if !names.insert(def.name.as_str()) {
            return Err(SchedulerError::InvalidConfig(format!(
                "duplicate job name in job file: {}",
                def.name
            )));
        }
    }
    Ok(definitions)
}

pub async fn load(path: &Path) -> Result<Vec<JobDefinition>, SchedulerError> {
    let contents = tokio::fs::read_to_string(path).await?;
    parse(&contents)
}

/// Schedule every definition whose name is not already known to the
/// scheduler, then wire up dependencies. Returns the number of new jobs.
pub async fn apply(
    scheduler: &PersistentScheduler,
    definitions: &[JobDefinition],
) -> Result<usize, SchedulerError> {
    let mut ids: HashMap<&str, String> = HashMap::new();
    let mut added = Vec::new();

    for def in definitions {
        if let Some(existing) = scheduler.get_job_by_name(&def.name).await {
            debug!(name = %def.name, job_id = %existing.id, "job already scheduled");
            ids.insert(def.name.as_str(), existing.id);
            continue;
        }
        let id = scheduler
            .schedule_function(&def.function, def.trigger.clone(), def.options())
            .await?;
        ids.insert(def.name.as_str(), id.clone());
        added.push((def, id));
    }

    for (def, id) in &added {
        if def.depends_on.is_empty() {
            continue;
        }
        let mut deps = Vec::with_capacity(def.depends_on.len());
        for name in &def.depends_on {
            let dep = match ids.get(name.as_str()) {
                Some(id) => id.clone(),
                None => scheduler
                    .get_job_by_name(name)
                    .await
                    .map(|job| job.id)
                    .ok_or_else(|| SchedulerError::JobNotFound(name.clone()))?,
            };
            deps.push(dep);
        }
        scheduler.add_dependency(id, deps).await?;
    }

    info!(added = added.len(), total = definitions.len(), "applied job file");
    Ok(added.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::builtin_registry;
    use frost_scheduler::SchedulerConfig;

    const JOBS: &str = r#"[
        {"name": "ingest", "function": "log",
         "trigger": {"type": "interval", "period_ms": 60000},
         "args": {"message": "ingest"}, "max_runs": 2},
        {"name": "report", "function": "log", "depends_on": ["ingest"],
         "trigger": {"type": "cron", "expression": "0 8 * * 1-5"},
         "retry": {"max_retries": 2, "base_delay": 100, "backoff_factor": 2.0, "max_delay": 1000}}
    ]"#;

    #[test]
    fn test_parse_definitions() {
        let defs = parse(JOBS).unwrap();
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0].max_runs, Some(2));
        assert!(defs[0].trigger.is_recurring());
        assert_eq!(defs[1].depends_on, vec!["ingest"]);
        assert_eq!(defs[1].retry.as_ref().map(|r| r.max_retries), Some(2));
    }

    #[test]
    fn test_parse_rejects_duplicate_names() {
        let jobs = r#"[
            {"name": "a", "function": "log", "trigger": {"type": "once", "at": "2030-01-01T00:00:00Z"}},
            {"name": "a", "function": "log", "trigger": {"type": "once", "at": "2030-01-01T00:00:00Z"}}
        ]"#;
        assert!(matches!(parse(jobs), Err(SchedulerError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_apply_is_idempotent_across_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.jsonl");
        let defs = parse(JOBS).unwrap();

        let scheduler = PersistentScheduler::open(&path, SchedulerConfig::default(), builtin_registry())
            .await
            .unwrap();
        assert_eq!(apply(&scheduler, &defs).await.unwrap(), 2);
        let ingest = scheduler.get_job_by_name("ingest").await.unwrap();
        let report = scheduler.get_job_by_name("report").await.unwrap();
        assert_eq!(report.depends_on, vec![ingest.id.clone()]);
        scheduler.flush().await.unwrap();

        let reopened = PersistentScheduler::open(&path, SchedulerConfig::default(), builtin_registry())
            .await
            .unwrap();
        assert_eq!(apply(&reopened, &defs).await.unwrap(), 0);
        assert_eq!(reopened.list_jobs().await.len(), 2);
    }

    #[tokio::test]
    async fn test_apply_unknown_function_fails() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = PersistentScheduler::open(
            dir.path().join("state.jsonl"),
            SchedulerConfig::default(),
            builtin_registry(),
        )
        .await
        .unwrap();
        let defs = parse(
            r#"[{"name": "x", "function": "nope", "trigger": {"type": "once", "at": "2030-01-01T00:00:00Z"}}]"#,
        )
        .unwrap();
        assert!(matches!(
            apply(&scheduler, &defs).await,
            Err(SchedulerError::UnknownFunction(_))
        ));
    }
}
