//! Execution slot pool: bounded, resizable admission control for job runs.
//!
//! Slots are permits of a fair (FIFO) semaphore, so waiters are served in
//! request order regardless of job size. The admission target moves between
//! the configured floor and ceiling: it is the base derived from the size mix
//! of the active workload, minus a pressure offset that sustained host load
//! raises by one and sustained idleness lowers by one. Re-basing never resets
//! the offset. Shrinking
//! never touches running jobs; when no idle permit can be withdrawn the
//! shrink is owed and paid by the next released slot.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use civic_core::{JobSpec, PoolSettings, SizeClass};

use crate::locks::lock;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("slot acquisition cancelled")]
    Cancelled,
    #[error("slot pool closed")]
    Closed,
}

/// Counts of jobs per size class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SizeMix {
    pub small: usize,
    pub medium: usize,
    pub large: usize,
}

impl SizeMix {
    pub fn add(&mut self, size: SizeClass) {
        match size {
            SizeClass::Small => self.small += 1,
            SizeClass::Medium => self.medium += 1,
            SizeClass::Large => self.large += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.small + self.medium + self.large
    }

    /// Share of the mix that is heavy, in `[0, 1]`: mediums count half.
    pub fn heaviness(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        let weighted = self.medium as f64 * SizeClass::Medium.weight()
            + self.large as f64 * SizeClass::Large.weight();
        weighted / total as f64
    }
}

impl<'a> FromIterator<&'a JobSpec> for SizeMix {
    fn from_iter<I: IntoIterator<Item = &'a JobSpec>>(iter: I) -> Self {
        let mut mix = SizeMix::default();
        for spec in iter {
            mix.add(spec.size);
        }
        mix
    }
}

/// Concurrency a size mix can sustain: the ceiling for an all-small mix, the
/// floor for an all-large one, linear in between.
pub fn base_concurrency_for(mix: &SizeMix, floor: usize, ceiling: usize) -> usize {
    let span = ceiling.saturating_sub(floor) as f64;
    let cut = (span * mix.heaviness()).round() as usize;
    ceiling.saturating_sub(cut).clamp(floor, ceiling)
}

#[derive(Debug)]
struct PoolState {
    target: usize,
    /// Size-mix base from the last rebase.
    base: usize,
    /// Net shrink steps from host pressure; negative after idle growth.
    pressure: isize,
    /// Permits to withdraw as soon as they are released.
    debt: usize,
    hot_ticks: u32,
    cool_ticks: u32,
}

#[derive(Debug)]
struct PoolInner {
    semaphore: Arc<Semaphore>,
    settings: PoolSettings,
    state: Mutex<PoolState>,
    active: AtomicUsize,
}

/// Shared handle to the slot pool.
#[derive(Debug, Clone)]
pub struct SlotPool {
    inner: Arc<PoolInner>,
}

impl SlotPool {
    /// Create a pool whose initial target is the ceiling.
    pub fn new(settings: PoolSettings) -> Self {
        let initial = settings.max_concurrency;
        Self {
            inner: Arc::new(PoolInner {
                semaphore: Arc::new(Semaphore::new(initial)),
                settings,
                state: Mutex::new(PoolState {
                    target: initial,
                    base: initial,
                    pressure: 0,
                    debt: 0,
                    hot_ticks: 0,
                    cool_ticks: 0,
                }),
                active: AtomicUsize::new(0),
            }),
        }
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> Result<Slot, PoolError> {
        let permit = Arc::clone(&self.inner.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;
        Ok(self.wrap(permit))
    }

    /// Wait for a free slot unless `cancel` flips to `true` first.
    pub async fn acquire_or_cancel(&self, cancel: &mut watch::Receiver<bool>) -> Result<Slot, PoolError> {
        if *cancel.borrow() {
            return Err(PoolError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = cancelled(cancel) => Err(PoolError::Cancelled),
            slot = self.acquire() => slot,
        }
    }

    fn wrap(&self, permit: OwnedSemaphorePermit) -> Slot {
        self.inner.active.fetch_add(1, Ordering::Relaxed);
        Slot {
            permit: Some(permit),
            inner: Arc::clone(&self.inner),
        }
    }

    /// Current admission target.
    pub fn target(&self) -> usize {
        lock(&self.inner.state).target
    }

    /// Slots currently held.
    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::Relaxed)
    }

    /// Slots free right now.
    pub fn available(&self) -> usize {
        self.inner.semaphore.available_permits()
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    /// Re-derive the base from the size mix of the active workload. The
    /// pressure offset still applies on top of the new base.
    pub fn rebase(&self, mix: &SizeMix) -> usize {
        let s = &self.inner.settings;
        let base = base_concurrency_for(mix, s.min_concurrency, s.max_concurrency);
        let mut st = lock(&self.inner.state);
        st.base = base;
        let next = self.effective_target(&st);
        if next != st.target {
            debug!(from = st.target, to = next, base, pressure = st.pressure, ?mix, "slot target rebased on size mix");
        }
        self.set_target_locked(&mut st, next);
        st.target
    }

    fn effective_target(&self, st: &PoolState) -> usize {
        let s = &self.inner.settings;
        let wanted = st.base as isize - st.pressure;
        wanted.clamp(s.min_concurrency as isize, s.max_concurrency as isize) as usize
    }

    /// Feed one resource reading; returns the resulting target.
    pub fn observe(&self, cpu_pct: f32, mem_pct: f32) -> usize {
        let s = &self.inner.settings;
        let hot = cpu_pct > s.high_water_pct || mem_pct > s.high_water_pct;
        let cool = cpu_pct < s.low_water_pct && mem_pct < s.low_water_pct;

        let mut st = lock(&self.inner.state);
        if hot {
            st.hot_ticks += 1;
            st.cool_ticks = 0;
        } else if cool {
            st.cool_ticks += 1;
            st.hot_ticks = 0;
        } else {
            st.hot_ticks = 0;
            st.cool_ticks = 0;
        }

        if st.hot_ticks >= s.shrink_after_ticks {
            st.hot_ticks = 0;
            // At the floor further pressure is not banked.
            if self.effective_target(&st) > s.min_concurrency {
                st.pressure += 1;
                let next = self.effective_target(&st);
                info!(cpu_pct, mem_pct, target = next, "host under pressure, shrinking slot target");
                self.set_target_locked(&mut st, next);
            }
        } else if st.cool_ticks >= s.grow_after_ticks {
            st.cool_ticks = 0;
            if self.effective_target(&st) < s.max_concurrency {
                st.pressure -= 1;
                let next = self.effective_target(&st);
                info!(cpu_pct, mem_pct, target = next, "host idle, growing slot target");
                self.set_target_locked(&mut st, next);
            }
        }
        st.target
    }

    fn set_target_locked(&self, st: &mut PoolState, wanted: usize) {
        let s = &self.inner.settings;
        let wanted = wanted.clamp(s.min_concurrency, s.max_concurrency);
        while st.target < wanted {
            if st.debt > 0 {
                st.debt -= 1;
            } else {
                self.inner.semaphore.add_permits(1);
            }
            st.target += 1;
        }
        while st.target > wanted {
            match Arc::clone(&self.inner.semaphore).try_acquire_owned() {
                Ok(idle) => idle.forget(),
                Err(_) => st.debt += 1,
            }
            st.target -= 1;
        }
    }

    /// Stop admitting. Waiters and future acquirers get [`PoolError::Closed`].
    pub fn close(&self) {
        self.inner.semaphore.close();
    }
}

/// Resolves once `cancel` reads `true`. A dropped sender means nobody can
/// cancel any more, so that never resolves.
pub(crate) async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// A held execution slot. Released when dropped, on every exit path.
#[derive(Debug)]
pub struct Slot {
    permit: Option<OwnedSemaphorePermit>,
    inner: Arc<PoolInner>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.inner.active.fetch_sub(1, Ordering::Relaxed);
        if let Some(permit) = self.permit.take() {
            let mut st = lock(&self.inner.state);
            if st.debt > 0 {
                st.debt -= 1;
                permit.forget();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn settings(min: usize, max: usize) -> PoolSettings {
        PoolSettings {
            min_concurrency: min,
            max_concurrency: max,
            ..PoolSettings::default()
        }
    }

    #[test]
    fn base_concurrency_tracks_heaviness() {
        let small = SizeMix { small: 10, medium: 0, large: 0 };
        let large = SizeMix { small: 0, medium: 0, large: 10 };
        let mixed = SizeMix { small: 5, medium: 0, large: 5 };
        assert_eq!(base_concurrency_for(&small, 10, 20), 20);
        assert_eq!(base_concurrency_for(&large, 10, 20), 10);
        assert_eq!(base_concurrency_for(&mixed, 10, 20), 15);
        assert_eq!(base_concurrency_for(&SizeMix::default(), 10, 20), 20);
    }

    #[tokio::test]
    async fn slot_release_on_drop() {
        let pool = SlotPool::new(settings(1, 2));
        let a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();
        assert_eq!(pool.active(), 2);
        assert_eq!(pool.available(), 0);
        drop(a);
        assert_eq!(pool.active(), 1);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn shrink_with_busy_slots_is_paid_on_release() {
        let pool = SlotPool::new(settings(2, 4));
        let mut held = Vec::new();
        for _ in 0..4 {
            held.push(pool.acquire().await.unwrap());
        }
        // All-large mix forces the floor while every slot is busy.
        pool.rebase(&SizeMix { small: 0, medium: 0, large: 4 });
        assert_eq!(pool.target(), 2);

        held.pop();
        assert_eq!(pool.available(), 0, "first release pays debt");
        held.pop();
        assert_eq!(pool.available(), 0, "second release pays debt");
        held.pop();
        assert_eq!(pool.available(), 1);
        held.pop();
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn growing_cancels_outstanding_debt() {
        let pool = SlotPool::new(settings(2, 4));
        let held: Vec<_> = futures::future::join_all((0..4).map(|_| pool.acquire()))
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();
        pool.rebase(&SizeMix { small: 0, medium: 0, large: 1 });
        pool.rebase(&SizeMix { small: 1, medium: 0, large: 0 });
        assert_eq!(pool.target(), 4);
        drop(held);
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn sustained_pressure_shrinks_then_idle_grows() {
        let pool = SlotPool::new(PoolSettings {
            min_concurrency: 10,
            max_concurrency: 12,
            shrink_after_ticks: 2,
            grow_after_ticks: 3,
            ..PoolSettings::default()
        });
        assert_eq!(pool.observe(95.0, 40.0), 12);
        assert_eq!(pool.observe(95.0, 40.0), 11);
        assert_eq!(pool.observe(40.0, 92.0), 11);
        assert_eq!(pool.observe(40.0, 92.0), 10);
        // Floor holds.
        pool.observe(99.0, 99.0);
        assert_eq!(pool.observe(99.0, 99.0), 10);

        // A middling reading resets the streak.
        pool.observe(10.0, 10.0);
        pool.observe(10.0, 10.0);
        pool.observe(70.0, 10.0);
        assert_eq!(pool.target(), 10);
        pool.observe(10.0, 10.0);
        pool.observe(10.0, 10.0);
        assert_eq!(pool.observe(10.0, 10.0), 11);
    }

    #[test]
    fn rebase_keeps_pressure_shrink_until_host_cools() {
        let pool = SlotPool::new(PoolSettings {
            min_concurrency: 2,
            max_concurrency: 4,
            shrink_after_ticks: 1,
            grow_after_ticks: 1,
            ..PoolSettings::default()
        });
        let all_small = SizeMix { small: 4, medium: 0, large: 0 };
        let all_large = SizeMix { small: 0, medium: 0, large: 4 };

        assert_eq!(pool.observe(99.0, 99.0), 3);
        assert_eq!(pool.rebase(&all_small), 3, "admission keeps the shrink");
        assert_eq!(pool.rebase(&all_large), 2);
        assert_eq!(pool.rebase(&all_small), 3, "batch end keeps the shrink");

        assert_eq!(pool.observe(10.0, 10.0), 4);
        assert_eq!(pool.rebase(&all_small), 4);
    }

    #[test]
    fn idle_growth_lifts_a_heavy_base() {
        let pool = SlotPool::new(PoolSettings {
            min_concurrency: 2,
            max_concurrency: 6,
            grow_after_ticks: 1,
            ..PoolSettings::default()
        });
        assert_eq!(pool.rebase(&SizeMix { small: 0, medium: 0, large: 3 }), 2);
        assert_eq!(pool.observe(10.0, 10.0), 3);
        assert_eq!(pool.rebase(&SizeMix { small: 0, medium: 0, large: 5 }), 3);
    }

    #[tokio::test]
    async fn acquire_is_fifo() {
        let pool = SlotPool::new(settings(1, 1));
        let first = pool.acquire().await.unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..3 {
            let pool = pool.clone();
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let _slot = pool.acquire().await.unwrap();
                lock(&order).push(i);
            }));
            // Let each waiter enqueue before the next one.
            tokio::task::yield_now().await;
        }
        drop(first);
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*lock(&order), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn cancel_abandons_wait() {
        let pool = SlotPool::new(settings(1, 1));
        let _held = pool.acquire().await.unwrap();
        let (tx, mut rx) = watch::channel(false);

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire_or_cancel(&mut rx).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.send(true).unwrap();
        assert_eq!(waiter.await.unwrap(), Err(PoolError::Cancelled));
    }

    #[tokio::test]
    async fn close_rejects_waiters() {
        let pool = SlotPool::new(settings(1, 1));
        let _held = pool.acquire().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };
        tokio::task::yield_now().await;
        pool.close();
        assert_eq!(waiter.await.unwrap(), Err(PoolError::Closed));
    }
}
