use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info};
use uuid::Uuid;

use civic_core::{ExecutionRecord, JobSpec, OutcomeKind};

use crate::locks::lock;
use crate::pool::{cancelled, PoolError, Slot};
use crate::scheduler::core::Scheduler;
use crate::scheduler::state::JobState;

impl Scheduler {
    /// Per-batch dispatcher: hands out slots in enqueue order, then waits for
    /// every job before finalizing the summary.
    pub(super) async fn dispatch(
        self,
        batch_id: Uuid,
        jobs: Vec<JobSpec>,
        mut cancel: watch::Receiver<bool>,
        done: watch::Sender<bool>,
    ) {
        let mut tasks = JoinSet::new();
        let mut withdrawn = 0usize;
        let mut pending = jobs.into_iter();

        while let Some(spec) = pending.next() {
            match self.inner.pool.acquire_or_cancel(&mut cancel).await {
                Ok(slot) => {
                    self.set_state(&spec.name, JobState::Running { batch_id, attempt: 1 });
                    tasks.spawn(self.clone().execute(batch_id, spec, slot, cancel.clone()));
                }
                Err(reason) => {
                    for spec in std::iter::once(spec).chain(pending.by_ref()) {
                        self.withdraw(batch_id, &spec);
                        withdrawn += 1;
                    }
                    debug!(%batch_id, withdrawn, %reason, "queued jobs withdrawn");
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(%batch_id, error = %e, "job task failed outside the runner");
            }
        }
        self.release_batch(batch_id);

        let was_cancelled = *cancel.borrow() || withdrawn > 0;
        self.inner.aggregator.finalize(batch_id, was_cancelled);
        let _ = done.send(true);
        lock(&self.inner.batches).remove(&batch_id);
        self.rebase_pool();
    }

    /// Run one job to its final attempt within the batch.
    async fn execute(self, batch_id: Uuid, spec: JobSpec, slot: Slot, mut cancel: watch::Receiver<bool>) {
        let unit = self.inner.registry.unit(&spec.name).cloned();
        let mut attempt = 1u32;
        let mut slot = slot;

        loop {
            let report = self
                .inner
                .runner
                .run(&spec, unit.clone(), batch_id, attempt, slot)
                .await;
            let retry = self.should_retry(&report.record);
            self.inner.aggregator.record(report).await;
            if !retry || *cancel.borrow() {
                break;
            }

            let backoff = self.inner.retry.backoff_after(attempt);
            self.set_state(&spec.name, JobState::RetryPending { batch_id, attempt });
            info!(job = %spec.name, %batch_id, attempt, backoff_secs = backoff.as_secs(), "transient failure, retry scheduled");

            let waited = tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => false,
                _ = tokio::time::sleep(backoff) => true,
            };
            if !waited {
                debug!(job = %spec.name, %batch_id, "retry withdrawn by cancellation");
                break;
            }

            self.set_state(&spec.name, JobState::Queued { batch_id });
            slot = match self.inner.pool.acquire_or_cancel(&mut cancel).await {
                Ok(slot) => slot,
                Err(PoolError::Cancelled) | Err(PoolError::Closed) => {
                    debug!(job = %spec.name, %batch_id, "retry withdrawn before start");
                    break;
                }
            };
            attempt += 1;
            self.set_state(&spec.name, JobState::Running { batch_id, attempt });
        }

        self.set_state(&spec.name, JobState::Idle);
    }

    /// Only transient failures are retried, and only up to the ceiling.
    fn should_retry(&self, record: &ExecutionRecord) -> bool {
        matches!(record.outcome, OutcomeKind::Failure | OutcomeKind::Timeout)
            && record.error_class.is_some_and(|c| c.is_transient())
            && record.attempt <= self.inner.retry.max_retries
    }

    fn withdraw(&self, batch_id: Uuid, spec: &JobSpec) {
        self.set_state(&spec.name, JobState::Idle);
        self.inner.aggregator.record_cancelled(batch_id, spec);
    }

    pub(super) fn set_state(&self, name: &str, state: JobState) {
        let mut states = lock(&self.inner.states);
        if state.is_idle() {
            states.remove(name);
        } else {
            states.insert(name.to_string(), state);
        }
        debug!(job = %name, state = ?state, "job state");
    }

    /// Return any job still attributed to the batch to idle.
    fn release_batch(&self, batch_id: Uuid) {
        lock(&self.inner.states).retain(|_, s| s.batch_id() != Some(batch_id));
    }
}
