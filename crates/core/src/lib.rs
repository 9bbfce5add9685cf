pub mod config;
pub mod error;
pub mod job;
pub mod outcome;
pub mod resource;

pub use config::{
    CadenceSettings, CommandSettings, JobEntry, MonitorSettings, OrchestratorConfig, PoolSettings,
    ReportingSettings, RetrySettings, ServerSettings, SinkKind, SinkSettings, TimeoutSettings,
};
pub use error::*;
pub use job::*;
pub use outcome::*;
pub use resource::*;
