use std::path::Path;

use crate::error::CoreError;

use super::env::{active_profile, profiled_env_opt, profiled_env_parse};
use super::types::OrchestratorConfig;

impl OrchestratorConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, CoreError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    // ── Environment variable overrides ──────────────────────────────

    /// Apply environment variable overrides.
    ///
    /// Convention: `CIVIC_SECTION_KEY` overrides `section.key`. When
    /// `CIVIC_PROFILE` is set (e.g. `PROD`), `PROD_CIVIC_SECTION_KEY` wins
    /// over the unprefixed key. Examples:
    /// - `CIVIC_POOL_MIN_CONCURRENCY` -> `pool.min_concurrency`
    /// - `CIVIC_TIMEOUTS_MEDIUM_SECS` -> `timeouts.medium_secs`
    /// - `CIVIC_RETRY_MAX_RETRIES` -> `retry.max_retries`
    /// - `CIVIC_SERVER_PORT` -> `server.port`
    pub(crate) fn apply_env_overrides(&mut self) {
        let p = active_profile();
        let p = p.as_str();

        if let Some(v) = profiled_env_parse(p, "CIVIC_POOL_MIN_CONCURRENCY") {
            self.pool.min_concurrency = v;
        }
        if let Some(v) = profiled_env_parse(p, "CIVIC_POOL_MAX_CONCURRENCY") {
            self.pool.max_concurrency = v;
        }
        if let Some(v) = profiled_env_parse(p, "CIVIC_POOL_HIGH_WATER_PCT") {
            self.pool.high_water_pct = v;
        }
        if let Some(v) = profiled_env_parse(p, "CIVIC_POOL_LOW_WATER_PCT") {
            self.pool.low_water_pct = v;
        }
        if let Some(v) = profiled_env_parse(p, "CIVIC_TIMEOUTS_SMALL_SECS") {
            self.timeouts.small_secs = v;
        }
        if let Some(v) = profiled_env_parse(p, "CIVIC_TIMEOUTS_MEDIUM_SECS") {
            self.timeouts.medium_secs = v;
        }
        if let Some(v) = profiled_env_parse(p, "CIVIC_TIMEOUTS_LARGE_SECS") {
            self.timeouts.large_secs = v;
        }
        if let Some(v) = profiled_env_parse(p, "CIVIC_RETRY_MAX_RETRIES") {
            self.retry.max_retries = v;
        }
        if let Some(v) = profiled_env_parse(p, "CIVIC_RETRY_BACKOFF_SECS") {
            self.retry.backoff_secs = v;
        }
        if let Some(v) = profiled_env_parse(p, "CIVIC_MONITOR_INTERVAL_SECS") {
            self.monitor.interval_secs = v;
        }
        if let Some(v) = profiled_env_opt(p, "CIVIC_REPORTING_RUN_LOG") {
            self.reporting.run_log = Some(v.into());
        }
        if let Some(v) = profiled_env_parse(p, "CIVIC_REPORTING_SINK_TIMEOUT_SECS") {
            self.reporting.sink_timeout_secs = v;
        }
        if let Some(v) = profiled_env_opt(p, "CIVIC_SINK_DIR") {
            self.sink.dir = v.into();
        }
        if let Some(v) = profiled_env_opt(p, "CIVIC_SERVER_HOST") {
            self.server.host = v;
        }
        if let Some(v) = profiled_env_parse(p, "CIVIC_SERVER_PORT") {
            self.server.port = v;
        }
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded ({} jobs):", self.jobs.len());
        tracing::info!(
            "  pool:      slots={}..{}, high_water={}%, low_water={}%",
            self.pool.min_concurrency,
            self.pool.max_concurrency,
            self.pool.high_water_pct,
            self.pool.low_water_pct
        );
        tracing::info!(
            "  timeouts:  small={}s, medium={}s, large={}s",
            self.timeouts.small_secs,
            self.timeouts.medium_secs,
            self.timeouts.large_secs
        );
        tracing::info!(
            "  retry:     max={}, backoff={}s",
            self.retry.max_retries,
            self.retry.backoff_secs
        );
        tracing::info!(
            "  cadences:  daily='{}', weekly='{}', monthly='{}'",
            self.cadences.daily,
            self.cadences.weekly,
            self.cadences.monthly
        );
        tracing::info!("  sink:      {:?} ({})", self.sink.kind, self.sink.dir.display());
        tracing::info!("  server:    {}:{}", self.server.host, self.server.port);
    }
}
