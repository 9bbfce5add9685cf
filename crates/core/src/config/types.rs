use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::job::{Cadence, JobSpec, SizeClass};

// ── Top-level config ────────────────────────────────────────────────

/// Full orchestrator configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Execution slot pool bounds and pressure thresholds.
    #[serde(default)]
    pub pool: PoolSettings,

    /// Per-size-class timeout budgets.
    #[serde(default)]
    pub timeouts: TimeoutSettings,

    /// In-batch retry policy for transient failures.
    #[serde(default)]
    pub retry: RetrySettings,

    /// Host resource sampling.
    #[serde(default)]
    pub monitor: MonitorSettings,

    /// Cron expressions for the recurring cadences.
    #[serde(default)]
    pub cadences: CadenceSettings,

    /// Summary retention and run log.
    #[serde(default)]
    pub reporting: ReportingSettings,

    /// Where collected records are upserted.
    #[serde(default)]
    pub sink: SinkSettings,

    /// HTTP reporting/control listener.
    #[serde(default)]
    pub server: ServerSettings,

    /// The job catalog.
    #[serde(default)]
    pub jobs: Vec<JobEntry>,
}

// ── Section configs ─────────────────────────────────────────────────

/// Slot pool sizing. The live target always stays within
/// `[min_concurrency, max_concurrency]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    #[serde(default = "default_min_concurrency")]
    pub min_concurrency: usize,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// CPU or memory percentage above which the host counts as hot.
    #[serde(default = "default_high_water")]
    pub high_water_pct: f32,
    /// CPU and memory percentage below which the host counts as cool.
    #[serde(default = "default_low_water")]
    pub low_water_pct: f32,
    /// Consecutive hot ticks before the target shrinks by one.
    #[serde(default = "default_pressure_ticks")]
    pub shrink_after_ticks: u32,
    /// Consecutive cool ticks before the target grows by one.
    #[serde(default = "default_pressure_ticks")]
    pub grow_after_ticks: u32,
}

fn default_min_concurrency() -> usize { 10 }
fn default_max_concurrency() -> usize { 20 }
fn default_high_water() -> f32 { 85.0 }
fn default_low_water() -> f32 { 50.0 }
fn default_pressure_ticks() -> u32 { 3 }

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_concurrency: default_min_concurrency(),
            max_concurrency: default_max_concurrency(),
            high_water_pct: default_high_water(),
            low_water_pct: default_low_water(),
            shrink_after_ticks: default_pressure_ticks(),
            grow_after_ticks: default_pressure_ticks(),
        }
    }
}

/// Timeout budgets. The scheduling assumptions of the whole system are built
/// on the 30/60/120 second defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_small_secs")]
    pub small_secs: u64,
    #[serde(default = "default_medium_secs")]
    pub medium_secs: u64,
    #[serde(default = "default_large_secs")]
    pub large_secs: u64,
}

fn default_small_secs() -> u64 { 30 }
fn default_medium_secs() -> u64 { 60 }
fn default_large_secs() -> u64 { 120 }

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            small_secs: default_small_secs(),
            medium_secs: default_medium_secs(),
            large_secs: default_large_secs(),
        }
    }
}

impl TimeoutSettings {
    /// Budget for a job of the given size class.
    pub fn budget_for(&self, size: SizeClass) -> Duration {
        Duration::from_secs(match size {
            SizeClass::Small => self.small_secs,
            SizeClass::Medium => self.medium_secs,
            SizeClass::Large => self.large_secs,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Extra attempts allowed per job per batch.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Linear backoff unit: the n-th retry waits `n * backoff_secs`.
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,
}

fn default_max_retries() -> u32 { 1 }
fn default_backoff_secs() -> u64 { 10 }

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_secs: default_backoff_secs(),
        }
    }
}

impl RetrySettings {
    /// Wait before the retry that follows attempt number `attempt`.
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        Duration::from_secs(self.backoff_secs.saturating_mul(attempt as u64))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSettings {
    #[serde(default = "default_monitor_interval")]
    pub interval_secs: u64,
    /// Samples kept in memory; oldest evicted first.
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,
    /// Samples in the rolling average.
    #[serde(default = "default_rolling_window")]
    pub rolling_window: usize,
}

fn default_monitor_interval() -> u64 { 5 }
fn default_ring_capacity() -> usize { 120 }
fn default_rolling_window() -> usize { 6 }

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_monitor_interval(),
            ring_capacity: default_ring_capacity(),
            rolling_window: default_rolling_window(),
        }
    }
}

/// Cron expressions (5- or 6-field) for each recurring cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CadenceSettings {
    #[serde(default = "default_daily")]
    pub daily: String,
    #[serde(default = "default_weekly")]
    pub weekly: String,
    #[serde(default = "default_monthly")]
    pub monthly: String,
    /// How often the cadence loop checks for due cadences.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

fn default_daily() -> String { "0 2 * * *".into() }
fn default_weekly() -> String { "0 3 * * Mon".into() }
fn default_monthly() -> String { "0 4 1 * *".into() }
fn default_poll_interval() -> u64 { 30 }

impl Default for CadenceSettings {
    fn default() -> Self {
        Self {
            daily: default_daily(),
            weekly: default_weekly(),
            monthly: default_monthly(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

impl CadenceSettings {
    /// Cron expression for a recurring cadence; `None` for `manual`.
    pub fn expression(&self, cadence: Cadence) -> Option<&str> {
        match cadence {
            Cadence::Daily => Some(&self.daily),
            Cadence::Weekly => Some(&self.weekly),
            Cadence::Monthly => Some(&self.monthly),
            Cadence::Manual => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportingSettings {
    /// Finalized summaries older than this are dropped.
    #[serde(default = "default_retention")]
    pub summary_retention_secs: u64,
    /// Optional JSONL file every sealed execution record is appended to.
    #[serde(default)]
    pub run_log: Option<PathBuf>,
    /// Upper bound on one sink upsert; past it the records are reported as
    /// not persisted.
    #[serde(default = "default_sink_timeout")]
    pub sink_timeout_secs: u64,
}

fn default_retention() -> u64 { 86_400 }
fn default_sink_timeout() -> u64 { 30 }

impl ReportingSettings {
    pub fn sink_timeout(&self) -> Duration {
        Duration::from_secs(self.sink_timeout_secs)
    }
}

impl Default for ReportingSettings {
    fn default() -> Self {
        Self {
            summary_retention_secs: default_retention(),
            run_log: None,
            sink_timeout_secs: default_sink_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    #[default]
    Memory,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkSettings {
    #[serde(default)]
    pub kind: SinkKind,
    /// Record directory for the file sink.
    #[serde(default = "default_sink_dir")]
    pub dir: PathBuf,
}

fn default_sink_dir() -> PathBuf { PathBuf::from("data/records") }

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            kind: SinkKind::default(),
            dir: default_sink_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Upper bound on waiting for in-flight jobs at shutdown.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

fn default_host() -> String { "0.0.0.0".into() }
fn default_port() -> u16 { 3090 }
fn default_shutdown_timeout() -> u64 { 130 }

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

// ── Job catalog ─────────────────────────────────────────────────────

/// One `[[jobs]]` entry: the job spec plus, optionally, how to run it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEntry {
    #[serde(flatten)]
    pub spec: JobSpec,
    /// External process that performs the scrape. Entries without a command
    /// must be bound to an in-process scraper before they can run.
    #[serde(default)]
    pub command: Option<CommandSettings>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSettings {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}
