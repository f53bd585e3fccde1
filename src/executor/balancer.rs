//! Adaptive worker sizing
//!
//! A sliding window of system load samples drives worker-count proposals:
//! sustained load above 0.8 shrinks the pool toward 80% of max, load
//! under 0.2 grows it by 20%, at most once per adjustment interval.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::core::services::Clock;

const WINDOW_SIZE: usize = 100;
const HIGH_LOAD: f64 = 0.8;
const LOW_LOAD: f64 = 0.2;

/// One sample of system utilization, each component in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLoadMetrics {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_io_usage: f64,
    pub active_connections: usize,
}

impl SystemLoadMetrics {
    /// Mean of the three utilization components.
    pub fn combined(&self) -> f64 {
        (self.cpu_usage + self.memory_usage + self.disk_io_usage) / 3.0
    }
}

/// Source of load samples. Swappable so tests can drive the balancer.
pub trait LoadProbe: Send + Sync {
    fn sample(&self) -> SystemLoadMetrics;
}

/// Probe returning a settable constant.
#[derive(Debug, Default)]
pub struct FixedLoadProbe {
    metrics: Mutex<SystemLoadMetrics>,
}

impl FixedLoadProbe {
    pub fn new(load: f64) -> Self {
        Self {
            metrics: Mutex::new(SystemLoadMetrics {
                cpu_usage: load,
                memory_usage: load,
                disk_io_usage: load,
                active_connections: 0,
            }),
        }
    }

    pub fn set(&self, metrics: SystemLoadMetrics) {
        *self.metrics.lock() = metrics;
    }

    pub fn set_load(&self, load: f64) {
        self.set(SystemLoadMetrics {
            cpu_usage: load,
            memory_usage: load,
            disk_io_usage: load,
            active_connections: 0,
        });
    }
}

impl LoadProbe for FixedLoadProbe {
    fn sample(&self) -> SystemLoadMetrics {
        *self.metrics.lock()
    }
}

/// Proposes worker counts from averaged load samples.
pub struct AdaptiveLoadBalancer {
    window: Mutex<VecDeque<SystemLoadMetrics>>,
    min_workers: usize,
    max_workers: usize,
    interval: Duration,
    last_adjustment: Mutex<Option<DateTime<Utc>>>,
    clock: Arc<dyn Clock>,
}

impl AdaptiveLoadBalancer {
    pub fn new(
        min_workers: usize,
        max_workers: usize,
        interval: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            window: Mutex::new(VecDeque::with_capacity(WINDOW_SIZE)),
            min_workers: min_workers.max(1),
            max_workers: max_workers.max(1),
            interval,
            last_adjustment: Mutex::new(None),
            clock,
        }
    }

    /// Record one sample, dropping the oldest past the window size.
    pub fn record_sample(&self, metrics: SystemLoadMetrics) {
        let mut window = self.window.lock();
        if window.len() == WINDOW_SIZE {
            window.pop_front();
        }
        window.push_back(metrics);
    }

    /// Mean combined load across the window; 0 when empty.
    pub fn mean_load(&self) -> f64 {
        let window = self.window.lock();
        if window.is_empty() {
            return 0.0;
        }
        window.iter().map(|m| m.combined()).sum::<f64>() / window.len() as f64
    }

    /// Worker count proposal for the current load, given the live count.
    pub fn optimal_workers(&self, current: usize) -> usize {
        let load = self.mean_load();
        if load > HIGH_LOAD {
            ((self.max_workers as f64 * 0.8) as usize).max(self.min_workers)
        } else if load < LOW_LOAD {
            let grown = (current as f64 * 1.2).ceil() as usize;
            grown.clamp(self.min_workers, self.max_workers)
        } else {
            current
        }
    }

    /// Rate limit: at most one adjustment per interval.
    pub fn should_adjust(&self) -> bool {
        let last = self.last_adjustment.lock();
        match *last {
            None => true,
            Some(ts) => {
                let elapsed = self.clock.now() - ts;
                elapsed.num_milliseconds() >= self.interval.as_millis() as i64
            }
        }
    }

    pub fn mark_adjusted(&self) {
        *self.last_adjustment.lock() = Some(self.clock.now());
    }
}
