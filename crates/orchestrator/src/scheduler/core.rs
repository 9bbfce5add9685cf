use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use civic_core::{Cadence, Category, JobSpec, RetrySettings};

use crate::aggregator::Aggregator;
use crate::locks::lock;
use crate::pool::{SizeMix, SlotPool};
use crate::registry::{JobFilter, JobRegistry};
use crate::runner::JobRunner;
use crate::scheduler::state::JobState;
use crate::summary::{RunSummary, Trigger};

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("unknown job(s): {}", .0.join(", "))]
    UnknownJob(Vec<String>),
    #[error("batch not found: {0}")]
    BatchNotFound(Uuid),
    #[error("scheduler is shutting down")]
    ShuttingDown,
    #[error("invalid cron expression for {cadence} cadence '{expr}': {reason}")]
    InvalidCadence {
        cadence: Cadence,
        expr: String,
        reason: String,
    },
}

/// Which jobs a batch should cover. Unset fields match everything; an
/// explicit `jobs` list is further narrowed by `category` and `cadence`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchRequest {
    pub category: Option<Category>,
    pub jobs: Option<Vec<String>>,
    pub cadence: Option<Cadence>,
}

impl BatchRequest {
    pub fn for_cadence(cadence: Cadence) -> Self {
        Self {
            cadence: Some(cadence),
            ..Self::default()
        }
    }

    pub fn for_jobs<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            jobs: Some(names.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }
}

pub(super) struct BatchHandle {
    pub(super) cancel: watch::Sender<bool>,
    pub(super) done: watch::Receiver<bool>,
}

pub(super) struct SchedulerInner {
    pub(super) registry: Arc<JobRegistry>,
    pub(super) pool: SlotPool,
    pub(super) runner: JobRunner,
    pub(super) aggregator: Arc<Aggregator>,
    pub(super) retry: RetrySettings,
    /// Non-idle jobs only.
    pub(super) states: Mutex<HashMap<String, JobState>>,
    /// Batches whose dispatcher has not finished yet.
    pub(super) batches: Mutex<HashMap<Uuid, BatchHandle>>,
    pub(super) accepting: AtomicBool,
}

/// Cheap to clone; every clone drives the same state.
#[derive(Clone)]
pub struct Scheduler {
    pub(super) inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(
        registry: Arc<JobRegistry>,
        pool: SlotPool,
        runner: JobRunner,
        aggregator: Arc<Aggregator>,
        retry: RetrySettings,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                registry,
                pool,
                runner,
                aggregator,
                retry,
                states: Mutex::new(HashMap::new()),
                batches: Mutex::new(HashMap::new()),
                accepting: AtomicBool::new(true),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.inner.registry
    }

    pub fn aggregator(&self) -> &Arc<Aggregator> {
        &self.inner.aggregator
    }

    pub fn pool(&self) -> &SlotPool {
        &self.inner.pool
    }

    /// Admit a batch and start dispatching it. Returns once the batch is
    /// registered; jobs run in the background.
    pub fn run_batch(&self, trigger: Trigger, request: &BatchRequest) -> Result<Uuid, SchedulerError> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(SchedulerError::ShuttingDown);
        }
        let selected = self.select(request)?;
        let batch_id = Uuid::new_v4();

        let mut admitted = Vec::with_capacity(selected.len());
        let mut skipped = Vec::new();
        {
            let mut states = lock(&self.inner.states);
            for spec in selected {
                if states.get(&spec.name).is_some_and(|s| !s.is_idle()) {
                    skipped.push(spec.name);
                } else {
                    states.insert(spec.name.clone(), JobState::Queued { batch_id });
                    admitted.push(spec);
                }
            }
        }

        self.inner
            .aggregator
            .open_batch(batch_id, trigger, admitted.len(), skipped.clone());
        if !skipped.is_empty() {
            info!(%batch_id, ?skipped, "jobs already active elsewhere, skipped");
        }
        let target = self.rebase_pool();

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        lock(&self.inner.batches).insert(
            batch_id,
            BatchHandle {
                cancel: cancel_tx,
                done: done_rx,
            },
        );

        info!(
            %batch_id,
            trigger = ?trigger,
            enqueued = admitted.len(),
            skipped = skipped.len(),
            slot_target = target,
            "batch admitted"
        );
        tokio::spawn(self.clone().dispatch(batch_id, admitted, cancel_rx, done_tx));
        Ok(batch_id)
    }

    fn select(&self, request: &BatchRequest) -> Result<Vec<JobSpec>, SchedulerError> {
        let registry = &self.inner.registry;
        let filter = JobFilter {
            category: request.category,
            size: None,
            cadence: request.cadence,
        };
        match &request.jobs {
            None => Ok(registry.list(&filter).into_iter().cloned().collect()),
            Some(names) => {
                let unknown: Vec<String> = names
                    .iter()
                    .filter(|n| registry.get(n).is_err())
                    .cloned()
                    .collect();
                if !unknown.is_empty() {
                    return Err(SchedulerError::UnknownJob(unknown));
                }
                let mut seen = std::collections::HashSet::new();
                Ok(names
                    .iter()
                    .filter(|n| seen.insert(n.as_str()))
                    .filter_map(|n| registry.get(n).ok())
                    .filter(|spec| filter.matches(spec))
                    .cloned()
                    .collect())
            }
        }
    }

    /// Re-derive the pool target from every job currently queued or running.
    pub(super) fn rebase_pool(&self) -> usize {
        let mix: SizeMix = {
            let states = lock(&self.inner.states);
            states
                .keys()
                .filter_map(|name| self.inner.registry.get(name).ok())
                .collect()
        };
        self.inner.pool.rebase(&mix)
    }

    /// Withdraw every job of the batch that has not started running yet.
    /// Running jobs finish or time out on their own. Cancelling a batch that
    /// already finished is a no-op.
    pub fn cancel_batch(&self, batch_id: Uuid) -> Result<(), SchedulerError> {
        if let Some(handle) = lock(&self.inner.batches).get(&batch_id) {
            handle.cancel.send_replace(true);
            info!(%batch_id, "batch cancellation requested");
            return Ok(());
        }
        if self.inner.aggregator.summary(batch_id).is_some() {
            debug!(%batch_id, "cancel on finished batch ignored");
            return Ok(());
        }
        Err(SchedulerError::BatchNotFound(batch_id))
    }

    pub fn get_summary(&self, batch_id: Uuid) -> Result<RunSummary, SchedulerError> {
        self.inner
            .aggregator
            .summary(batch_id)
            .ok_or(SchedulerError::BatchNotFound(batch_id))
    }

    /// Resolves with the final summary once every job of the batch is idle.
    pub async fn wait_for_batch(&self, batch_id: Uuid) -> Result<RunSummary, SchedulerError> {
        let done = lock(&self.inner.batches).get(&batch_id).map(|h| h.done.clone());
        if let Some(mut done) = done {
            // An error means the dispatcher is gone, which only happens after
            // it finalized the batch.
            let _ = done.wait_for(|d| *d).await;
        }
        self.get_summary(batch_id)
    }

    pub fn job_state(&self, name: &str) -> JobState {
        lock(&self.inner.states).get(name).copied().unwrap_or_default()
    }

    /// Jobs that are not idle, by name.
    pub fn active_jobs(&self) -> HashMap<String, JobState> {
        lock(&self.inner.states).clone()
    }

    pub fn running_batches(&self) -> usize {
        lock(&self.inner.batches).len()
    }

    /// Stop accepting batches, cancel the running ones, close the pool, and
    /// wait up to `grace` for in-flight jobs. Returns whether every batch
    /// finished in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.inner.accepting.store(false, Ordering::SeqCst);
        let pending: Vec<watch::Receiver<bool>> = {
            let batches = lock(&self.inner.batches);
            for handle in batches.values() {
                handle.cancel.send_replace(true);
            }
            batches.values().map(|h| h.done.clone()).collect()
        };
        self.inner.pool.close();
        info!(batches = pending.len(), grace_secs = grace.as_secs(), "scheduler shutting down");

        let drain = futures::future::join_all(pending.into_iter().map(|mut done| async move {
            let _ = done.wait_for(|d| *d).await;
        }));
        match tokio::time::timeout(grace, drain).await {
            Ok(_) => {
                info!("all batches drained");
                true
            }
            Err(_) => {
                warn!(still_running = self.running_batches(), "shutdown grace period elapsed");
                false
            }
        }
    }
}
