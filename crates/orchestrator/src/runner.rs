//! Runs one job under its timeout budget and seals exactly one record.

use std::any::Any;
use std::time::Duration;

use tokio::task::JoinError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use civic_core::{ErrorClass, ExecutionRecord, JobSpec, OpenExecution, TimeoutSettings};

use crate::pool::Slot;
use crate::scraper::{JobUnit, ScrapeContext, ScrapeOutput, ScrapedRecord};

/// A sealed record plus the records the run produced.
#[derive(Debug)]
pub struct RunReport {
    pub record: ExecutionRecord,
    pub records: Vec<ScrapedRecord>,
}

impl RunReport {
    fn sealed(record: ExecutionRecord) -> Self {
        Self {
            record,
            records: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobRunner {
    timeouts: TimeoutSettings,
}

impl JobRunner {
    pub fn new(timeouts: TimeoutSettings) -> Self {
        Self { timeouts }
    }

    pub fn budget_for(&self, spec: &JobSpec) -> Duration {
        self.timeouts.budget_for(spec.size)
    }

    /// Execute `spec` while holding `slot`.
    ///
    /// The unit runs in its own task so a panic stays inside it. When the
    /// budget runs out the task is aborted, which also kills a command
    /// child, and whatever it had collected is discarded. The slot is released
    /// before the record is sealed. Never retries.
    pub async fn run(
        &self,
        spec: &JobSpec,
        unit: Option<JobUnit>,
        batch_id: Uuid,
        attempt: u32,
        slot: Slot,
    ) -> RunReport {
        let open = OpenExecution::start(batch_id, spec, attempt);
        let Some(unit) = unit else {
            drop(slot);
            warn!(job = %spec.name, "no scraper bound to job");
            return RunReport::sealed(open.fail(
                ErrorClass::MissingModule,
                format!("no scraper entry point bound to job {}", spec.name),
            ));
        };

        let budget = self.budget_for(spec);
        let ctx = ScrapeContext {
            job_name: spec.name.clone(),
            batch_id,
            attempt,
        };
        debug!(job = %spec.name, %batch_id, attempt, budget_secs = budget.as_secs(), "job started");

        let mut handle = tokio::spawn(async move { unit.run(ctx).await });
        let waited = tokio::time::timeout(budget, &mut handle).await;
        drop(slot);

        let report = match waited {
            Err(_) => {
                handle.abort();
                warn!(job = %spec.name, %batch_id, budget_secs = budget.as_secs(), "job timed out, abandoned");
                RunReport::sealed(open.time_out(budget))
            }
            Ok(Err(join_err)) => {
                let msg = join_failure_message(join_err);
                warn!(job = %spec.name, %batch_id, error = %msg, "job task faulted");
                RunReport::sealed(open.fail(ErrorClass::classify(&msg), msg))
            }
            Ok(Ok(Err(err))) => RunReport::sealed(open.fail(err.class(), err.to_string())),
            Ok(Ok(Ok(output))) => seal_output(open, output),
        };

        info!(
            job = %spec.name,
            %batch_id,
            attempt,
            outcome = ?report.record.outcome,
            records = report.record.records_produced,
            duration_ms = report.record.duration_ms(),
            "job finished"
        );
        report
    }
}

fn seal_output(open: OpenExecution, output: ScrapeOutput) -> RunReport {
    let ScrapeOutput { records, errors } = output;
    let count = records.len() as u64;
    match (records.is_empty(), errors.is_empty()) {
        (_, true) => RunReport {
            record: open.succeed(count),
            records,
        },
        (false, false) => RunReport {
            record: open.partial(count, &errors),
            records,
        },
        (true, false) => {
            let class = ErrorClass::classify(&errors[0]);
            RunReport::sealed(open.fail(class, errors.join("; ")))
        }
    }
}

fn join_failure_message(err: JoinError) -> String {
    if err.is_cancelled() {
        return "job task was cancelled".to_string();
    }
    match err.try_into_panic() {
        Ok(payload) => format!("job panicked: {}", panic_text(payload.as_ref())),
        Err(err) => err.to_string(),
    }
}

fn panic_text(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use civic_core::{Cadence, Category, OutcomeKind, PoolSettings, SizeClass};

    use super::*;
    use crate::pool::SlotPool;
    use crate::scraper::{FnScraper, ScrapeError};

    fn spec(size: SizeClass) -> JobSpec {
        JobSpec::new("job", Category::Civic, size, Cadence::Manual)
    }

    fn pool() -> SlotPool {
        SlotPool::new(PoolSettings {
            min_concurrency: 1,
            max_concurrency: 1,
            ..PoolSettings::default()
        })
    }

    fn unit<F, Fut>(f: F) -> Option<JobUnit>
    where
        F: Fn(ScrapeContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<ScrapeOutput, ScrapeError>> + Send + 'static,
    {
        Some(JobUnit::native(FnScraper::new(f)))
    }

    async fn run(spec: &JobSpec, unit: Option<JobUnit>) -> RunReport {
        let pool = pool();
        let slot = pool.acquire().await.unwrap();
        let report = JobRunner::new(TimeoutSettings::default())
            .run(spec, unit, Uuid::new_v4(), 1, slot)
            .await;
        assert_eq!(pool.active(), 0, "slot released");
        report
    }

    #[tokio::test]
    async fn zero_records_is_success() {
        let report = run(&spec(SizeClass::Small), unit(|_| async { Ok(ScrapeOutput::default()) })).await;
        assert_eq!(report.record.outcome, OutcomeKind::Success);
        assert_eq!(report.record.records_produced, 0);
        assert!(report.record.error_class.is_none());
    }

    #[tokio::test]
    async fn records_with_errors_are_partial() {
        let report = run(
            &spec(SizeClass::Small),
            unit(|_| async {
                Ok(ScrapeOutput {
                    records: vec![ScrapedRecord::new("a", serde_json::json!({}))],
                    errors: vec!["'NoneType' has no attribute 'text'".into()],
                })
            }),
        )
        .await;
        assert_eq!(report.record.outcome, OutcomeKind::PartialSuccess);
        assert_eq!(report.record.records_produced, 1);
        assert_eq!(report.record.error_class, Some(ErrorClass::SchemaMismatch));
        assert_eq!(report.records.len(), 1);
    }

    #[tokio::test]
    async fn errors_without_records_are_failure() {
        let report = run(
            &spec(SizeClass::Small),
            unit(|_| async {
                Ok(ScrapeOutput {
                    records: vec![],
                    errors: vec!["tls handshake failed".into()],
                })
            }),
        )
        .await;
        assert_eq!(report.record.outcome, OutcomeKind::Failure);
        assert_eq!(report.record.error_class, Some(ErrorClass::TlsCertificate));
    }

    #[tokio::test]
    async fn scraper_error_keeps_its_class() {
        let report = run(
            &spec(SizeClass::Small),
            unit(|_| async { Err(ScrapeError::MissingDependency("lxml".into())) }),
        )
        .await;
        assert_eq!(report.record.outcome, OutcomeKind::Failure);
        assert_eq!(report.record.error_class, Some(ErrorClass::MissingDependency));
    }

    #[tokio::test]
    async fn unbound_job_is_missing_module() {
        let report = run(&spec(SizeClass::Small), None).await;
        assert_eq!(report.record.outcome, OutcomeKind::Failure);
        assert_eq!(report.record.error_class, Some(ErrorClass::MissingModule));
    }

    #[tokio::test]
    async fn panic_is_contained() {
        let report = run(
            &spec(SizeClass::Small),
            unit(|_| async {
                if true {
                    panic!("index out of range");
                }
                Ok(ScrapeOutput::default())
            }),
        )
        .await;
        assert_eq!(report.record.outcome, OutcomeKind::Failure);
        assert_eq!(report.record.error_class, Some(ErrorClass::Unknown));
        assert!(report.record.error.as_deref().unwrap().contains("index out of range"));
    }

    #[tokio::test(start_paused = true)]
    async fn over_budget_is_timeout_and_abandoned() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let report = run(
            &spec(SizeClass::Medium),
            unit(move |_| {
                let flag = Arc::clone(&flag);
                async move {
                    tokio::time::sleep(Duration::from_secs(90)).await;
                    flag.store(true, Ordering::SeqCst);
                    Ok(ScrapeOutput::records(vec![ScrapedRecord::new("late", serde_json::json!({}))]))
                }
            }),
        )
        .await;
        assert_eq!(report.record.outcome, OutcomeKind::Timeout);
        assert_eq!(report.record.error_class, Some(ErrorClass::Timeout));
        assert!(report.records.is_empty());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!finished.load(Ordering::SeqCst), "aborted task never resumes");
    }
}
