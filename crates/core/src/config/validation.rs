use crate::error::CoreError;

use super::types::OrchestratorConfig;

impl OrchestratorConfig {
    /// Validate numeric bounds. Job name uniqueness and cron syntax are
    /// checked where they are consumed (registry load, scheduler start).
    pub fn validate(&self) -> Result<(), CoreError> {
        self.validate_pool()?;
        self.validate_timeouts()?;
        self.validate_monitor()?;
        if self.reporting.sink_timeout_secs == 0 {
            return Err(CoreError::Config("reporting.sink_timeout_secs must be positive".into()));
        }
        Ok(())
    }

    fn validate_pool(&self) -> Result<(), CoreError> {
        let pool = &self.pool;
        if pool.min_concurrency == 0 {
            return Err(CoreError::Config("pool.min_concurrency must be at least 1".into()));
        }
        if pool.min_concurrency > pool.max_concurrency {
            return Err(CoreError::Config(format!(
                "pool.min_concurrency ({}) exceeds pool.max_concurrency ({})",
                pool.min_concurrency, pool.max_concurrency
            )));
        }
        if pool.low_water_pct >= pool.high_water_pct {
            return Err(CoreError::Config(format!(
                "pool.low_water_pct ({}) must be below pool.high_water_pct ({})",
                pool.low_water_pct, pool.high_water_pct
            )));
        }
        if pool.shrink_after_ticks == 0 || pool.grow_after_ticks == 0 {
            return Err(CoreError::Config("pool tick thresholds must be at least 1".into()));
        }
        Ok(())
    }

    fn validate_timeouts(&self) -> Result<(), CoreError> {
        let t = &self.timeouts;
        for (name, secs) in [("small", t.small_secs), ("medium", t.medium_secs), ("large", t.large_secs)] {
            if secs == 0 {
                return Err(CoreError::Config(format!("timeouts.{name}_secs must be positive")));
            }
        }
        Ok(())
    }

    fn validate_monitor(&self) -> Result<(), CoreError> {
        let m = &self.monitor;
        if m.interval_secs == 0 {
            return Err(CoreError::Config("monitor.interval_secs must be positive".into()));
        }
        if m.ring_capacity == 0 || m.rolling_window == 0 {
            return Err(CoreError::Config(
                "monitor.ring_capacity and monitor.rolling_window must be positive".into(),
            ));
        }
        Ok(())
    }
}
