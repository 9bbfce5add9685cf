//! Orchestrator configuration.
//!
//! Parsed once at startup from a TOML file (`config/orchestrator.toml` by
//! default), then overridden from `CIVIC_<SECTION>_<KEY>` environment
//! variables and validated. Every section has defaults, so an empty file is a
//! valid configuration with an empty job catalog.

mod env;
mod loading;
mod types;
mod validation;

#[cfg(test)]
mod tests;

pub use env::load_dotenv;
pub use types::{
    CadenceSettings, CommandSettings, JobEntry, MonitorSettings, OrchestratorConfig, PoolSettings,
    ReportingSettings, RetrySettings, ServerSettings, SinkKind, SinkSettings, TimeoutSettings,
};
