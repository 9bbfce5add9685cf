//! Host resource sampling.
//!
//! A background task reads CPU and memory load on a fixed interval, appends a
//! [`ResourceSample`] to a bounded ring, and feeds the reading to the slot
//! pool. Readers only take a short lock to copy samples out.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use sysinfo::System;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use civic_core::{LoadAverage, MonitorSettings, ResourceSample};

use crate::locks::lock;
use crate::pool::SlotPool;

/// One CPU/memory reading, in percent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostLoad {
    pub cpu_pct: f32,
    pub mem_pct: f32,
}

/// Source of host load readings.
pub trait ResourceProbe: Send + 'static {
    fn read(&mut self) -> HostLoad;
}

/// Reads the local host through `sysinfo`.
pub struct SystemProbe {
    system: System,
}

impl SystemProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        // CPU usage is a delta between refreshes; prime the first one.
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self { system }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SystemProbe {
    fn read(&mut self) -> HostLoad {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        let total = self.system.total_memory();
        let mem_pct = if total > 0 {
            (self.system.used_memory() as f64 / total as f64 * 100.0) as f32
        } else {
            0.0
        };
        HostLoad {
            cpu_pct: self.system.global_cpu_usage(),
            mem_pct,
        }
    }
}

/// Fixed-capacity buffer that evicts the oldest entry when full.
#[derive(Debug)]
pub struct RingBuffer<T> {
    buf: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, item: T) {
        if self.buf.len() == self.capacity {
            self.buf.pop_front();
        }
        self.buf.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<&T> {
        self.buf.back()
    }

    /// Oldest to newest.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        self.buf.iter()
    }
}

/// What the reporting surface shows about host load.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceSnapshot {
    pub latest: Option<ResourceSample>,
    pub rolling_average: Option<LoadAverage>,
    pub recent: Vec<ResourceSample>,
    pub slot_target: usize,
    pub active_slots: usize,
}

#[derive(Debug, Clone)]
pub struct ResourceMonitor {
    ring: Arc<Mutex<RingBuffer<ResourceSample>>>,
    pool: SlotPool,
    interval: Duration,
    window: usize,
}

impl ResourceMonitor {
    pub fn new(settings: &MonitorSettings, pool: SlotPool) -> Self {
        Self {
            ring: Arc::new(Mutex::new(RingBuffer::new(settings.ring_capacity))),
            pool,
            interval: Duration::from_secs(settings.interval_secs.max(1)),
            window: settings.rolling_window.max(1),
        }
    }

    /// Take one reading, record it, and pass it to the pool.
    pub fn sample(&self, probe: &mut dyn ResourceProbe) -> ResourceSample {
        let load = probe.read();
        let slot_target = self.pool.observe(load.cpu_pct, load.mem_pct);
        let sample = ResourceSample {
            taken_at: Utc::now(),
            cpu_pct: load.cpu_pct,
            mem_pct: load.mem_pct,
            active_slots: self.pool.active(),
            slot_target,
        };
        lock(&self.ring).push(sample.clone());
        debug!(
            cpu_pct = sample.cpu_pct,
            mem_pct = sample.mem_pct,
            active = sample.active_slots,
            target = sample.slot_target,
            "resource sample"
        );
        sample
    }

    /// Sample until `shutdown` flips to `true`.
    pub fn spawn(&self, mut probe: Box<dyn ResourceProbe>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            info!(interval_secs = monitor.interval.as_secs(), "resource monitor started");
            let mut ticker = tokio::time::interval(monitor.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        monitor.sample(probe.as_mut());
                    }
                    changed = shutdown.changed() => {
                        // A dropped sender can never signal again.
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("resource monitor stopped");
        })
    }

    pub fn latest(&self) -> Option<ResourceSample> {
        lock(&self.ring).latest().cloned()
    }

    /// Mean over the most recent `rolling_window` samples.
    pub fn rolling_average(&self) -> Option<LoadAverage> {
        let ring = lock(&self.ring);
        ResourceSample::average(ring.iter().rev().take(self.window))
    }

    /// Up to `n` most recent samples, oldest first.
    pub fn recent(&self, n: usize) -> Vec<ResourceSample> {
        let ring = lock(&self.ring);
        let skip = ring.len().saturating_sub(n);
        ring.iter().skip(skip).cloned().collect()
    }

    pub fn snapshot(&self, recent: usize) -> ResourceSnapshot {
        ResourceSnapshot {
            latest: self.latest(),
            rolling_average: self.rolling_average(),
            recent: self.recent(recent),
            slot_target: self.pool.target(),
            active_slots: self.pool.active(),
        }
    }
}
