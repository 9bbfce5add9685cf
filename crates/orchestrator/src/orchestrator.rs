//! Wires the registry, pool, runner, scheduler, aggregator, sink and monitor
//! together behind the trigger interface.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use civic_core::{ExecutionRecord, JobSpec, OrchestratorConfig};

use crate::aggregator::Aggregator;
use crate::error::OrchestratorError;
use crate::monitor::{ResourceMonitor, ResourceProbe, ResourceSnapshot, SystemProbe};
use crate::pool::SlotPool;
use crate::registry::{JobFilter, JobRegistry};
use crate::runner::JobRunner;
use crate::scheduler::{BatchRequest, Scheduler, SchedulerError};
use crate::sink::{open_sink, RecordSink};
use crate::summary::{RunSummary, Trigger};

/// Samples returned in a resource snapshot.
const RECENT_SAMPLES: usize = 24;

pub struct Orchestrator {
    config: OrchestratorConfig,
    scheduler: Scheduler,
    monitor: ResourceMonitor,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, registry: JobRegistry, sink: Arc<dyn RecordSink>) -> Self {
        let pool = SlotPool::new(config.pool.clone());
        let aggregator = Arc::new(Aggregator::new(sink, &config.reporting));
        let scheduler = Scheduler::new(
            Arc::new(registry),
            pool.clone(),
            JobRunner::new(config.timeouts.clone()),
            aggregator,
            config.retry.clone(),
        );
        let monitor = ResourceMonitor::new(&config.monitor, pool);
        Self {
            config,
            scheduler,
            monitor,
        }
    }

    /// Registry from `[[jobs]]` and the sink from `[sink]`.
    pub fn from_config(config: OrchestratorConfig) -> Result<Self, OrchestratorError> {
        let registry = JobRegistry::from_entries(&config.jobs)?;
        let sink = open_sink(&config.sink);
        info!(jobs = registry.len(), sink = sink.name(), "orchestrator assembled");
        Ok(Self::new(config, registry, sink))
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn monitor(&self) -> &ResourceMonitor {
        &self.monitor
    }

    pub fn list_jobs(&self, filter: &JobFilter) -> Vec<JobSpec> {
        self.scheduler.registry().list(filter).into_iter().cloned().collect()
    }

    pub fn run_batch(&self, request: &BatchRequest) -> Result<Uuid, SchedulerError> {
        self.scheduler.run_batch(Trigger::Manual, request)
    }

    pub fn cancel_batch(&self, batch_id: Uuid) -> Result<(), SchedulerError> {
        self.scheduler.cancel_batch(batch_id)
    }

    pub fn get_summary(&self, batch_id: Uuid) -> Result<RunSummary, SchedulerError> {
        self.scheduler.get_summary(batch_id)
    }

    pub async fn wait_for_batch(&self, batch_id: Uuid) -> Result<RunSummary, SchedulerError> {
        self.scheduler.wait_for_batch(batch_id).await
    }

    pub fn executions(&self, batch_id: Uuid) -> Result<Vec<ExecutionRecord>, SchedulerError> {
        self.scheduler
            .aggregator()
            .executions(batch_id)
            .ok_or(SchedulerError::BatchNotFound(batch_id))
    }

    /// Running batches, newest first.
    pub fn active_summaries(&self) -> Vec<RunSummary> {
        self.scheduler.aggregator().active()
    }

    /// Every retained batch, newest first.
    pub fn all_summaries(&self) -> Vec<RunSummary> {
        self.scheduler.aggregator().summaries()
    }

    pub fn resources(&self) -> ResourceSnapshot {
        self.monitor.snapshot(RECENT_SAMPLES)
    }

    /// Start the host monitor and the cadence loop.
    pub fn spawn_background(&self, shutdown: watch::Receiver<bool>) -> Result<Vec<JoinHandle<()>>, OrchestratorError> {
        self.spawn_background_with(Box::new(SystemProbe::new()), shutdown)
    }

    pub fn spawn_background_with(
        &self,
        probe: Box<dyn ResourceProbe>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Vec<JoinHandle<()>>, OrchestratorError> {
        let cadence = self
            .scheduler
            .spawn_cadence_loop(&self.config.cadences, shutdown.clone())?;
        let monitor = self.monitor.spawn(probe, shutdown);
        Ok(vec![cadence, monitor])
    }

    /// Graceful stop, bounded by `server.shutdown_timeout_secs`.
    pub async fn shutdown(&self) -> bool {
        let grace = Duration::from_secs(self.config.server.shutdown_timeout_secs);
        self.scheduler.shutdown(grace).await
    }
}
