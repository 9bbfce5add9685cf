//! Batch scheduler: admits jobs from the registry into batches, runs them
//! through the slot pool, and retries transient failures.
//!
//! Each job walks `idle → queued → running → idle`, detouring through
//! `retry-pending → queued` when a transient failure is retried. A job is in
//! at most one batch at a time; requests that name an active job skip it.

mod cadence;
mod core;
mod execution;
mod state;


pub use self::cadence::{is_cron_due, normalize_cron, parse_cron, CadenceClock};
pub use self::core::{BatchRequest, Scheduler, SchedulerError};
pub use self::state::JobState;
