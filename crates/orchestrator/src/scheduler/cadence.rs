//! Recurring cadences: cron helpers and the background trigger loop.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use civic_core::{Cadence, CadenceSettings};

use crate::registry::JobFilter;
use crate::scheduler::core::{BatchRequest, Scheduler, SchedulerError};
use crate::summary::Trigger;

/// Normalize a 5-field cron expression to 6-field by prepending a seconds
/// field. Anything else passes through trimmed.
pub fn normalize_cron(expr: &str) -> String {
    let trimmed = expr.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    }
}

pub fn parse_cron(expr: &str) -> Result<Schedule, cron::error::Error> {
    Schedule::from_str(&normalize_cron(expr))
}

/// A schedule is due when it has a tick in `(last, now]`.
pub fn is_cron_due(schedule: &Schedule, last: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    schedule.after(&last).next().is_some_and(|next| next <= now)
}

/// Tracks when each recurring cadence last fired.
#[derive(Debug, Clone)]
pub struct CadenceClock {
    entries: Vec<(Cadence, Schedule, DateTime<Utc>)>,
}

impl CadenceClock {
    /// Ticks at or before `start` are never fired.
    pub fn new(settings: &CadenceSettings, start: DateTime<Utc>) -> Result<Self, SchedulerError> {
        let mut entries = Vec::with_capacity(Cadence::RECURRING.len());
        for cadence in Cadence::RECURRING {
            let Some(expr) = settings.expression(cadence) else {
                continue;
            };
            let schedule = parse_cron(expr).map_err(|e| SchedulerError::InvalidCadence {
                cadence,
                expr: expr.to_string(),
                reason: e.to_string(),
            })?;
            entries.push((cadence, schedule, start));
        }
        Ok(Self { entries })
    }

    /// Cadences with a tick in `(last fired, now]`; marks them fired at `now`.
    /// Several missed ticks of one cadence collapse into a single firing.
    pub fn due(&mut self, now: DateTime<Utc>) -> Vec<Cadence> {
        let mut fired = Vec::new();
        for (cadence, schedule, last) in &mut self.entries {
            if is_cron_due(schedule, *last, now) {
                *last = now;
                fired.push(*cadence);
            }
        }
        fired
    }

    /// Next tick of `cadence` after it last fired.
    pub fn next_fire(&self, cadence: Cadence) -> Option<DateTime<Utc>> {
        self.entries
            .iter()
            .find(|(c, _, _)| *c == cadence)
            .and_then(|(_, schedule, last)| schedule.after(last).next())
    }
}

impl Scheduler {
    /// Start the cadence loop. Every poll fires the due cadences as batches
    /// and prunes expired summaries. Fails up front on a bad cron expression.
    pub fn spawn_cadence_loop(
        &self,
        settings: &CadenceSettings,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>, SchedulerError> {
        let mut clock = CadenceClock::new(settings, Utc::now())?;
        for cadence in Cadence::RECURRING {
            if let Some(next) = clock.next_fire(cadence) {
                info!(%cadence, next = %next, "cadence scheduled");
            }
        }

        let scheduler = self.clone();
        let poll = Duration::from_secs(settings.poll_interval_secs.max(1));
        Ok(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = Utc::now();
                        for cadence in clock.due(now) {
                            scheduler.fire_cadence(cadence);
                        }
                        scheduler.aggregator().prune(now);
                    }
                    changed = shutdown.changed() => {
                        // A dropped sender can never signal again.
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("cadence loop stopped");
        }))
    }

    fn fire_cadence(&self, cadence: Cadence) {
        let filter = JobFilter {
            cadence: Some(cadence),
            ..JobFilter::default()
        };
        if self.registry().list(&filter).is_empty() {
            debug!(%cadence, "cadence due but no jobs carry it");
            return;
        }
        match self.run_batch(Trigger::Cadence { cadence }, &BatchRequest::for_cadence(cadence)) {
            Ok(batch_id) => info!(%cadence, %batch_id, "cadence batch started"),
            Err(e) => warn!(%cadence, error = %e, "cadence batch not started"),
        }
    }
}
