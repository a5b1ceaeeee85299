//! End-to-end tests for the scheduler running against real time.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};

use frost_resilience::{BoxError, FailureCategory, HealingOutcome, RecoveryStrategy};
use frost_scheduler::{
    DependencyScheduler, FunctionRegistry, JobOptions, JobPipeline, JobStatus, PersistentScheduler,
    PipelineStage, RunOutcome, Scheduler, SchedulerConfig, StageStatus, Trigger, work_fn,
};

fn config() -> SchedulerConfig {
    SchedulerConfig::default().with_poll_interval(Duration::from_millis(100))
}

#[tokio::test]
async fn interval_job_stops_after_max_runs() {
    let scheduler = Scheduler::new(config()).unwrap();
    let runs = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&runs);

    let id = scheduler
        .schedule(
            work_fn(move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::Null)
                }
            }),
            Trigger::every(Duration::from_secs(1)),
            JobOptions::new().name("heartbeat").max_runs(3),
        )
        .await
        .unwrap();

    scheduler.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(3500)).await;
    scheduler.stop().await;

    let job = scheduler.get_job(&id).await.unwrap();
    assert_eq!(job.run_count, 3);
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(runs.load(Ordering::SeqCst), 3);
    assert!(job.next_fire.is_none());
}

#[tokio::test]
async fn timeout_failure_is_classified_and_recorded() {
    let scheduler = Scheduler::new(config()).unwrap();
    let id = scheduler
        .schedule(
            work_fn(|_| async { Err::<Value, BoxError>("connection timed out".into()) }),
            Trigger::once(Utc::now()),
            JobOptions::new().name("fetch").max_runs(1),
        )
        .await
        .unwrap();

    let classified = scheduler
        .supervisor()
        .taxonomy()
        .classify_message("connection timed out");
    assert_eq!(classified.category, FailureCategory::Timeout);
    assert_eq!(classified.strategies.first(), Some(&RecoveryStrategy::Retry));

    let result = scheduler.run_now(&id).await.unwrap();
    match result.outcome {
        RunOutcome::Failure { category, .. } => assert_eq!(category, FailureCategory::Timeout),
        other => panic!("expected failure, got {other:?}"),
    }

    let job = scheduler.get_job(&id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.last_category, Some(FailureCategory::Timeout));

    let events = scheduler.healing_log().events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].outcome, HealingOutcome::Failure);
    assert_eq!(events[0].category(), FailureCategory::Timeout);
}

#[tokio::test]
async fn dependent_runs_only_after_prerequisite_completes() {
    let scheduler = DependencyScheduler::new(config()).unwrap();
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));

    let step = |label: &'static str| {
        let order = Arc::clone(&order);
        work_fn(move |_| {
            let order = Arc::clone(&order);
            async move {
                order.lock().unwrap().push(label);
                Ok(Value::Null)
            }
        })
    };

    // The dependent is due first but must still wait.
    let report = scheduler
        .schedule(step("report"), Trigger::once(Utc::now()), JobOptions::new())
        .await
        .unwrap();
    let ingest = scheduler
        .schedule(
            step("ingest"),
            Trigger::once(Utc::now() + chrono::TimeDelta::milliseconds(300)),
            JobOptions::new(),
        )
        .await
        .unwrap();
    scheduler.add_dependency(&report, [ingest.as_str()]).await.unwrap();

    scheduler.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(900)).await;
    scheduler.stop().await;

    assert_eq!(*order.lock().unwrap(), vec!["ingest", "report"]);
    assert_eq!(
        scheduler.get_job(&report).await.unwrap().status,
        JobStatus::Completed
    );
}

#[tokio::test]
async fn persisted_jobs_resume_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobs.jsonl");
    let runs = Arc::new(AtomicU32::new(0));

    let registry = || {
        let counter = Arc::clone(&runs);
        let mut registry = FunctionRegistry::new();
        registry.register_fn("tick", move |args| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(args)
            }
        });
        registry
    };

    let id = {
        let scheduler = PersistentScheduler::open(&path, config(), registry())
            .await
            .unwrap();
        let id = scheduler
            .schedule_function(
                "tick",
                Trigger::every(Duration::from_millis(200)),
                JobOptions::new().name("tick").args(json!({"n": 1})).max_runs(4),
            )
            .await
            .unwrap();
        scheduler.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        scheduler.stop().await.unwrap();
        id
    };

    let before = runs.load(Ordering::SeqCst);
    assert!((1..4).contains(&before), "ran {before} times before restart");

    let scheduler = PersistentScheduler::open(&path, config(), registry())
        .await
        .unwrap();
    let job = scheduler.get_job(&id).await.unwrap();
    assert_eq!(job.run_count, before);
    assert_eq!(job.args, json!({"n": 1}));

    scheduler.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(1200)).await;
    scheduler.stop().await.unwrap();

    let job = scheduler.get_job(&id).await.unwrap();
    assert_eq!(job.run_count, 4);
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(runs.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn pipeline_reports_each_stage() {
    let scheduler = Scheduler::new(config().with_workers(2)).unwrap();
    scheduler.start().await.unwrap();

    let stages = vec![
        PipelineStage::new("fetch")
            .job("a", work_fn(|_| async { Ok(json!("a")) }))
            .job("b", work_fn(|_| async { Ok(json!("b")) })),
        PipelineStage::new("check")
            .job(
                "schema",
                work_fn(|_| async { Err::<Value, BoxError>("invalid config value".into()) }),
            )
            .fail_fast(true),
        PipelineStage::new("publish").job("push", work_fn(|_| async { Ok(Value::Null) })),
    ];

    let result = JobPipeline::new(&scheduler).run(stages).await.unwrap();
    scheduler.stop().await;

    assert!(!result.succeeded);
    let statuses: Vec<StageStatus> = result.stages.iter().map(|s| s.status).collect();
    assert_eq!(
        statuses,
        vec![StageStatus::Succeeded, StageStatus::Failed, StageStatus::Skipped]
    );
    assert_eq!(result.failed_jobs().len(), 1);
    assert_eq!(result.failed_jobs()[0].name, "schema");
}
