use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Point-in-time host load, as seen by the resource monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSample {
    pub taken_at: DateTime<Utc>,
    pub cpu_pct: f32,
    pub mem_pct: f32,
    /// Slots held by running jobs when the sample was taken.
    pub active_slots: usize,
    /// Admission target of the slot pool when the sample was taken.
    pub slot_target: usize,
}

impl ResourceSample {
    /// Mean CPU/memory over a window of samples. `None` for an empty window.
    pub fn average<'a>(samples: impl IntoIterator<Item = &'a ResourceSample>) -> Option<LoadAverage> {
        let mut n = 0usize;
        let (mut cpu, mut mem, mut active) = (0.0f64, 0.0f64, 0.0f64);
        for s in samples {
            n += 1;
            cpu += s.cpu_pct as f64;
            mem += s.mem_pct as f64;
            active += s.active_slots as f64;
        }
        if n == 0 {
            return None;
        }
        let n = n as f64;
        Some(LoadAverage {
            cpu_pct: (cpu / n) as f32,
            mem_pct: (mem / n) as f32,
            active_slots: active / n,
            samples: n as usize,
        })
    }
}

/// Rolling average over the most recent samples.
#[derive(Debug, Clone, Serialize)]
pub struct LoadAverage {
    pub cpu_pct: f32,
    pub mem_pct: f32,
    pub active_slots: f64,
    pub samples: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(cpu: f32, mem: f32, active: usize) -> ResourceSample {
        ResourceSample {
            taken_at: Utc::now(),
            cpu_pct: cpu,
            mem_pct: mem,
            active_slots: active,
            slot_target: 10,
        }
    }

    #[test]
    fn average_of_empty_window_is_none() {
        assert!(ResourceSample::average(&[]).is_none());
    }

    #[test]
    fn average_over_window() {
        let window = [sample(20.0, 40.0, 2), sample(60.0, 80.0, 4)];
        let avg = ResourceSample::average(&window).unwrap();
        assert!((avg.cpu_pct - 40.0).abs() < 1e-3);
        assert!((avg.mem_pct - 60.0).abs() < 1e-3);
        assert_eq!(avg.active_slots, 3.0);
        assert_eq!(avg.samples, 2);
    }
}
