//! Scraper orchestration engine.
//!
//! Runs a catalog of independent scraper jobs in batches under a bounded,
//! self-sizing slot pool, with per-size timeouts, failure classification,
//! in-batch retries of transient failures, cadence triggers, and live
//! run/resource reporting.

pub mod aggregator;
pub mod error;
mod locks;
pub mod monitor;
pub mod orchestrator;
pub mod pool;
pub mod registry;
pub mod report;
pub mod runner;
pub mod scheduler;
pub mod scraper;
pub mod sink;
pub mod summary;

pub use aggregator::Aggregator;
pub use error::OrchestratorError;
pub use monitor::{HostLoad, ResourceMonitor, ResourceProbe, ResourceSnapshot, SystemProbe};
pub use orchestrator::Orchestrator;
pub use pool::{PoolError, SizeMix, Slot, SlotPool};
pub use registry::{JobFilter, JobRegistry, RegistryError};
pub use runner::{JobRunner, RunReport};
pub use scheduler::{BatchRequest, JobState, Scheduler, SchedulerError};
pub use scraper::{
    CommandScraper, FnScraper, JobUnit, ScrapeContext, ScrapeError, ScrapeOutput, ScrapedRecord, Scraper,
};
pub use sink::{FileSink, MemorySink, RecordSink, UpsertReport};
pub use summary::{BatchState, OutcomeCounts, RunSummary, Trigger};
