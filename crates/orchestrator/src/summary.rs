//! Run-level statistics reported for each batch.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use civic_core::{Cadence, Category, ErrorClass, OutcomeKind, WarningKind};

/// What started a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    Manual,
    Cadence { cadence: Cadence },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Running,
    Completed,
    Cancelled,
}

/// Per-category outcome counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub success: usize,
    pub partial_success: usize,
    pub failure: usize,
    pub timeout: usize,
    pub cancelled: usize,
}

impl OutcomeCounts {
    pub(crate) fn add(&mut self, tally: Tally) {
        match tally {
            Tally::Finished { outcome, .. } => match outcome {
                OutcomeKind::Success => self.success += 1,
                OutcomeKind::PartialSuccess => self.partial_success += 1,
                OutcomeKind::Failure => self.failure += 1,
                OutcomeKind::Timeout => self.timeout += 1,
            },
            Tally::Cancelled => self.cancelled += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.success + self.partial_success + self.failure + self.timeout + self.cancelled
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryWarning {
    pub kind: WarningKind,
    pub job_name: String,
    pub message: String,
}

/// Aggregate over one batch. Counters reflect the latest attempt of each job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub batch_id: Uuid,
    pub trigger: Trigger,
    pub state: BatchState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    /// Jobs admitted to this batch.
    pub enqueued: usize,
    /// Requested jobs left out because they were already active elsewhere.
    pub skipped: Vec<String>,
    #[serde(flatten)]
    pub counts: OutcomeCounts,
    /// Attempts superseded by a retry.
    pub retried: usize,
    pub records_collected: u64,
    pub records_persisted: u64,
    /// Share of finished jobs that produced output, in `[0, 1]`.
    pub success_rate: f64,
    pub by_category: BTreeMap<Category, OutcomeCounts>,
    pub failures_by_class: BTreeMap<ErrorClass, usize>,
    pub warnings: Vec<SummaryWarning>,
}

impl RunSummary {
    pub(crate) fn open(batch_id: Uuid, trigger: Trigger, enqueued: usize, skipped: Vec<String>) -> Self {
        Self {
            batch_id,
            trigger,
            state: BatchState::Running,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: None,
            enqueued,
            skipped,
            counts: OutcomeCounts::default(),
            retried: 0,
            records_collected: 0,
            records_persisted: 0,
            success_rate: 0.0,
            by_category: BTreeMap::new(),
            failures_by_class: BTreeMap::new(),
            warnings: Vec::new(),
        }
    }

    /// Jobs that reached a terminal state for this batch.
    pub fn settled(&self) -> usize {
        self.counts.total()
    }

    pub fn is_finished(&self) -> bool {
        self.state != BatchState::Running
    }
}

/// Latest known result of one job within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tally {
    Finished {
        outcome: OutcomeKind,
        class: Option<ErrorClass>,
        records: u64,
    },
    Cancelled,
}
