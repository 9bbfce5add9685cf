//! End-to-end batch scenarios through the public orchestrator API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use civic_core::{
    Cadence, Category, ErrorClass, JobSpec, OrchestratorConfig, OutcomeKind, PoolSettings, SizeClass,
};
use civic_orchestrator::{
    BatchRequest, BatchState, FnScraper, JobRegistry, JobState, JobUnit, MemorySink, Orchestrator, ScrapeError,
    ScrapeOutput, ScrapedRecord,
};

fn spec(name: &str, size: SizeClass) -> JobSpec {
    JobSpec::new(name, Category::Municipal, size, Cadence::Manual)
}

fn sleeping(secs: u64, records: usize) -> JobUnit {
    JobUnit::native(FnScraper::new(move |ctx| async move {
        tokio::time::sleep(Duration::from_secs(secs)).await;
        Ok(ScrapeOutput::records(
            (0..records)
                .map(|i| ScrapedRecord::new(format!("{}-{}", ctx.job_name, i), json!({ "seq": i })))
                .collect(),
        ))
    }))
}

#[tokio::test(start_paused = true)]
async fn mixed_outcomes_are_classified() {
    let registry = JobRegistry::builder()
        .job(spec("a", SizeClass::Small), Some(sleeping(1, 5)))
        .job(spec("b", SizeClass::Medium), Some(sleeping(90, 3)))
        .job(
            spec("c", SizeClass::Large),
            Some(JobUnit::native(FnScraper::new(|_| async {
                Err(ScrapeError::Other("SSL: CERTIFICATE_VERIFY_FAILED".into()))
            }))),
        )
        .build()
        .unwrap();
    let sink = Arc::new(MemorySink::new());
    let orch = Orchestrator::new(OrchestratorConfig::default(), registry, sink.clone());

    let id = orch.run_batch(&BatchRequest::default()).unwrap();
    let summary = orch.wait_for_batch(id).await.unwrap();

    assert_eq!(summary.state, BatchState::Completed);
    assert_eq!(summary.counts.success, 1);
    assert_eq!(summary.counts.timeout, 1);
    assert_eq!(summary.counts.failure, 1);
    assert_eq!(summary.counts.partial_success, 0);
    assert_eq!(summary.settled(), summary.enqueued);
    // b and c are transient and get one retry each.
    assert_eq!(summary.retried, 2);
    assert_eq!(summary.records_collected, 5);
    assert_eq!(sink.row_count(), 5);

    let latest = |job: &str| {
        orch.executions(id)
            .unwrap()
            .into_iter()
            .filter(|r| r.job_name == job)
            .max_by_key(|r| r.attempt)
            .unwrap()
    };
    let a = latest("a");
    assert_eq!((a.outcome, a.records_produced), (OutcomeKind::Success, 5));
    assert_eq!(latest("b").outcome, OutcomeKind::Timeout);
    let c = latest("c");
    assert_eq!(c.outcome, OutcomeKind::Failure);
    assert_eq!(c.error_class, Some(ErrorClass::TlsCertificate));
}

#[tokio::test(start_paused = true)]
async fn pool_ceiling_bounds_wall_clock() {
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut builder = JobRegistry::builder();
    for i in 0..10 {
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        let unit = JobUnit::native(FnScraper::new(move |_| {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(2)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(ScrapeOutput::default())
            }
        }));
        builder = builder.job(spec(&format!("job{}", i), SizeClass::Small), Some(unit));
    }

    let config = OrchestratorConfig {
        pool: PoolSettings {
            min_concurrency: 2,
            max_concurrency: 4,
            ..PoolSettings::default()
        },
        ..OrchestratorConfig::default()
    };
    let orch = Orchestrator::new(config, builder.build().unwrap(), Arc::new(MemorySink::new()));

    let started = tokio::time::Instant::now();
    let id = orch.run_batch(&BatchRequest::default()).unwrap();
    let summary = orch.wait_for_batch(id).await.unwrap();

    assert!(started.elapsed() >= Duration::from_secs(5));
    assert!(peak.load(Ordering::SeqCst) <= 4);
    assert_eq!(summary.counts.success, 10);
}

#[tokio::test(start_paused = true)]
async fn cancelled_batch_runs_nothing() {
    let registry = JobRegistry::builder()
        .job(spec("x", SizeClass::Small), Some(sleeping(1, 1)))
        .job(spec("y", SizeClass::Small), Some(sleeping(1, 1)))
        .job(spec("z", SizeClass::Small), Some(sleeping(1, 1)))
        .build()
        .unwrap();
    let config = OrchestratorConfig {
        pool: PoolSettings {
            min_concurrency: 1,
            max_concurrency: 1,
            ..PoolSettings::default()
        },
        ..OrchestratorConfig::default()
    };
    let orch = Orchestrator::new(config, registry, Arc::new(MemorySink::new()));
    let blocker = orch.scheduler().pool().acquire().await.unwrap();

    let id = orch.run_batch(&BatchRequest::default()).unwrap();
    orch.cancel_batch(id).unwrap();
    let summary = orch.wait_for_batch(id).await.unwrap();
    drop(blocker);

    assert_eq!(summary.state, BatchState::Cancelled);
    assert_eq!(summary.counts.cancelled, 3);
    assert!(orch.executions(id).unwrap().is_empty());
    for job in ["x", "y", "z"] {
        assert_eq!(orch.scheduler().job_state(job), JobState::Idle);
    }
}

#[tokio::test(start_paused = true)]
async fn rerunning_a_batch_upserts_idempotently() {
    let registry = JobRegistry::builder()
        .job(spec("people", SizeClass::Small), Some(sleeping(0, 4)))
        .build()
        .unwrap();
    let sink = Arc::new(MemorySink::new());
    let orch = Orchestrator::new(OrchestratorConfig::default(), registry, sink.clone());

    for _ in 0..2 {
        let id = orch.run_batch(&BatchRequest::default()).unwrap();
        let summary = orch.wait_for_batch(id).await.unwrap();
        assert_eq!(summary.records_persisted, 4);
    }
    assert_eq!(sink.row_count(), 4);
    assert_eq!(orch.all_summaries().len(), 2);
    assert!(orch.active_summaries().is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn command_jobs_from_config_write_to_file_sink() {
    let dir = tempfile::tempdir().unwrap();
    let toml = format!(
        r#"
[sink]
kind = "file"
dir = "{}"

[[jobs]]
name = "ca_on_sample"
category = "provincial"
size = "small"
command = {{ program = "sh", args = ["-c", "echo '{{\"id\":\"m1\",\"name\":\"Member One\"}}'; echo '{{\"id\":\"m2\",\"name\":\"Member Two\"}}'"] }}

[[jobs]]
name = "ca_on_missing"
category = "provincial"
size = "small"
command = {{ program = "civic-scraper-that-is-not-installed" }}

[[jobs]]
name = "ca_on_unbound"
category = "provincial"
size = "small"
"#,
        dir.path().display()
    );
    let config = OrchestratorConfig::from_toml(&toml).unwrap();
    let orch = Orchestrator::from_config(config).unwrap();

    let id = orch
        .run_batch(&BatchRequest {
            category: Some(Category::Provincial),
            ..BatchRequest::default()
        })
        .unwrap();
    let summary = orch.wait_for_batch(id).await.unwrap();

    assert_eq!(summary.enqueued, 3);
    assert_eq!(summary.counts.success, 1);
    assert_eq!(summary.counts.failure, 2);
    assert_eq!(summary.failures_by_class[&ErrorClass::MissingDependency], 1);
    assert_eq!(summary.failures_by_class[&ErrorClass::MissingModule], 1);
    assert_eq!(summary.records_persisted, 2);

    let doc: serde_json::Value =
        serde_json::from_slice(&std::fs::read(dir.path().join("ca_on_sample.json")).unwrap()).unwrap();
    assert_eq!(doc["m2"]["name"], "Member Two");
}
