//! Collects execution records into per-batch summaries and forwards
//! produced records to the sink.
//!
//! Each batch has its own mutex; the batch table lock is only taken to find
//! or insert a batch. Neither lock is held across the sink call or the run
//! log write.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use civic_core::{Category, ExecutionRecord, JobSpec, OutcomeKind, ReportingSettings, WarningKind};

use crate::locks::{lock, read, write};
use crate::runner::RunReport;
use crate::scraper::ScrapedRecord;
use crate::sink::{RecordSink, UpsertReport};
use crate::summary::{BatchState, OutcomeCounts, RunSummary, SummaryWarning, Tally, Trigger};

#[derive(Debug)]
struct BatchEntry {
    summary: RunSummary,
    latest: HashMap<String, (Category, Tally)>,
    executions: Vec<ExecutionRecord>,
}

impl BatchEntry {
    /// Replace the job's latest tally. Returns true when an earlier attempt
    /// was superseded.
    fn settle(&mut self, job: &str, category: Category, tally: Tally) -> bool {
        let superseded = self.latest.insert(job.to_string(), (category, tally)).is_some();
        if superseded {
            self.summary.retried += 1;
        }
        self.recount();
        superseded
    }

    fn recount(&mut self) {
        let s = &mut self.summary;
        s.counts = OutcomeCounts::default();
        s.by_category.clear();
        s.failures_by_class.clear();
        s.records_collected = 0;

        for (category, tally) in self.latest.values() {
            s.counts.add(*tally);
            s.by_category.entry(*category).or_default().add(*tally);
            if let Tally::Finished { outcome, class, records } = tally {
                s.records_collected += records;
                if matches!(outcome, OutcomeKind::Failure | OutcomeKind::Timeout) {
                    if let Some(class) = class {
                        *s.failures_by_class.entry(*class).or_default() += 1;
                    }
                }
            }
        }

        let finished = s.counts.success + s.counts.partial_success + s.counts.failure + s.counts.timeout;
        s.success_rate = if finished == 0 {
            0.0
        } else {
            (s.counts.success + s.counts.partial_success) as f64 / finished as f64
        };
    }
}

pub struct Aggregator {
    batches: RwLock<HashMap<Uuid, Arc<Mutex<BatchEntry>>>>,
    sink: Arc<dyn RecordSink>,
    run_log: Option<PathBuf>,
    run_log_lock: tokio::sync::Mutex<()>,
    retention: Duration,
    sink_timeout: Duration,
}

impl Aggregator {
    pub fn new(sink: Arc<dyn RecordSink>, settings: &ReportingSettings) -> Self {
        Self {
            batches: RwLock::new(HashMap::new()),
            sink,
            run_log: settings.run_log.clone(),
            run_log_lock: tokio::sync::Mutex::new(()),
            retention: Duration::from_secs(settings.summary_retention_secs),
            sink_timeout: settings.sink_timeout(),
        }
    }

    pub fn sink(&self) -> &Arc<dyn RecordSink> {
        &self.sink
    }

    fn entry(&self, batch_id: Uuid) -> Option<Arc<Mutex<BatchEntry>>> {
        read(&self.batches).get(&batch_id).cloned()
    }

    /// Start tracking a batch.
    pub fn open_batch(&self, batch_id: Uuid, trigger: Trigger, enqueued: usize, skipped: Vec<String>) -> RunSummary {
        let summary = RunSummary::open(batch_id, trigger, enqueued, skipped);
        let entry = BatchEntry {
            summary: summary.clone(),
            latest: HashMap::with_capacity(enqueued),
            executions: Vec::with_capacity(enqueued),
        };
        write(&self.batches).insert(batch_id, Arc::new(Mutex::new(entry)));
        summary
    }

    /// Take ownership of a sealed record and the records it produced.
    pub async fn record(&self, report: RunReport) {
        let RunReport { record, records } = report;
        let batch_id = record.batch_id;
        let Some(entry) = self.entry(batch_id) else {
            warn!(%batch_id, job = %record.job_name, "record for unknown batch dropped");
            return;
        };

        {
            let mut e = lock(&entry);
            let superseded = e.settle(
                &record.job_name,
                record.category,
                Tally::Finished {
                    outcome: record.outcome,
                    class: record.error_class,
                    records: record.records_produced,
                },
            );
            if superseded {
                debug!(%batch_id, job = %record.job_name, attempt = record.attempt, "earlier attempt superseded");
            }
            e.executions.push(record.clone());
        }

        if record.outcome.produced_output() && !records.is_empty() {
            let report = self.upsert(&record.job_name, &records).await;
            let mut e = lock(&entry);
            e.summary.records_persisted += report.accepted as u64;
            if report.is_degraded() {
                let message = match &report.error {
                    Some(err) => format!("{} rejected {} record(s): {}", self.sink.name(), report.rejected, err),
                    None => format!("{} rejected {} record(s)", self.sink.name(), report.rejected),
                };
                warn!(%batch_id, job = %record.job_name, %message, "persistence degraded");
                e.summary.warnings.push(SummaryWarning {
                    kind: WarningKind::PersistenceDegraded,
                    job_name: record.job_name.clone(),
                    message,
                });
            }
        }

        self.append_run_log(&record).await;
    }

    /// Forward records to the sink, giving up after `sink_timeout`.
    async fn upsert(&self, job_name: &str, records: &[ScrapedRecord]) -> UpsertReport {
        match tokio::time::timeout(self.sink_timeout, self.sink.upsert_records(job_name, records)).await {
            Ok(report) => report,
            Err(_) => UpsertReport {
                accepted: 0,
                rejected: records.len(),
                error: Some(format!("upsert timed out after {}s", self.sink_timeout.as_secs())),
            },
        }
    }

    /// Count a job that was withdrawn before it ran.
    pub fn record_cancelled(&self, batch_id: Uuid, spec: &JobSpec) {
        if let Some(entry) = self.entry(batch_id) {
            lock(&entry).settle(&spec.name, spec.category, Tally::Cancelled);
        }
    }

    /// Seal the batch summary. Returns the final snapshot.
    pub fn finalize(&self, batch_id: Uuid, cancelled: bool) -> Option<RunSummary> {
        let entry = self.entry(batch_id)?;
        let mut e = lock(&entry);
        let now = Utc::now();
        let s = &mut e.summary;
        s.state = if cancelled { BatchState::Cancelled } else { BatchState::Completed };
        s.finished_at = Some(now);
        s.duration_ms = Some((now - s.started_at).num_milliseconds().max(0) as u64);
        info!(
            %batch_id,
            state = ?s.state,
            enqueued = s.enqueued,
            success = s.counts.success,
            partial = s.counts.partial_success,
            failure = s.counts.failure,
            timeout = s.counts.timeout,
            cancelled = s.counts.cancelled,
            retried = s.retried,
            records = s.records_collected,
            "batch finished"
        );
        Some(s.clone())
    }

    /// Live snapshot of a batch.
    pub fn summary(&self, batch_id: Uuid) -> Option<RunSummary> {
        self.entry(batch_id).map(|e| lock(&e).summary.clone())
    }

    /// Sealed records of a batch, in completion order.
    pub fn executions(&self, batch_id: Uuid) -> Option<Vec<ExecutionRecord>> {
        self.entry(batch_id).map(|e| lock(&e).executions.clone())
    }

    /// All retained summaries, newest first.
    pub fn summaries(&self) -> Vec<RunSummary> {
        let entries: Vec<_> = read(&self.batches).values().cloned().collect();
        let mut out: Vec<RunSummary> = entries.iter().map(|e| lock(e).summary.clone()).collect();
        out.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        out
    }

    /// Summaries of batches still running.
    pub fn active(&self) -> Vec<RunSummary> {
        self.summaries().into_iter().filter(|s| !s.is_finished()).collect()
    }

    /// Drop finished summaries older than the retention window.
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let Ok(retention) = chrono::Duration::from_std(self.retention) else {
            return 0;
        };
        let cutoff = now - retention;
        let mut batches = write(&self.batches);
        let before = batches.len();
        batches.retain(|_, entry| {
            let e = lock(entry);
            !matches!(e.summary.finished_at, Some(at) if at < cutoff)
        });
        let pruned = before - batches.len();
        if pruned > 0 {
            debug!(pruned, "expired batch summaries pruned");
        }
        pruned
    }

    async fn append_run_log(&self, record: &ExecutionRecord) {
        let Some(path) = &self.run_log else {
            return;
        };
        let mut line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to serialize execution record");
                return;
            }
        };
        line.push('\n');

        let _guard = self.run_log_lock.lock().await;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!(path = %path.display(), error = %e, "failed to create run log directory");
                return;
            }
        }
        let file = tokio::fs::OpenOptions::new().create(true).append(true).open(path).await;
        let result = match file {
            Ok(mut f) => f.write_all(line.as_bytes()).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "failed to append to run log");
        }
    }
}
