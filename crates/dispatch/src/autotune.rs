//! CPU-driven adjustment of total concurrency.
//!
//! Every `sample_interval` the scheduler reads the CPU probe and asks the
//! [`Autotuner`] for a new capacity. Moves are at most `step` per sample
//! and always end inside `[min_concurrency, max_concurrency]`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use switchyard_core::AutotuneConfig;

use crate::metrics::RingBuffer;

/// Number of adjustments kept for the snapshot.
const HISTORY_CAPACITY: usize = 64;

/// One autotune evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct AutotuneSample {
    pub at: DateTime<Utc>,
    /// `None` when the probe had no valid reading.
    pub cpu_percent: Option<f64>,
    pub capacity_before: usize,
    pub capacity_after: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AutotuneSnapshot {
    pub enabled: bool,
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    pub last_cpu_percent: Option<f64>,
    /// Evaluations that changed capacity.
    pub adjustments: u64,
    /// Oldest first.
    pub history: Vec<AutotuneSample>,
}

#[derive(Debug)]
pub struct Autotuner {
    config: AutotuneConfig,
    last_sample: Option<Instant>,
    adjustments: u64,
    history: RingBuffer<AutotuneSample>,
}

impl Autotuner {
    pub fn new(config: AutotuneConfig) -> Self {
        Self {
            config,
            last_sample: None,
            adjustments: 0,
            history: RingBuffer::new(HISTORY_CAPACITY),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn interval(&self) -> Duration {
        self.config.sample_interval()
    }

    /// True when enabled and at least one sample interval has passed since
    /// the previous evaluation.
    pub fn is_due(&self, now: Instant) -> bool {
        self.config.enabled
            && self
                .last_sample
                .map_or(true, |last| now.saturating_duration_since(last) >= self.interval())
    }

    /// Start a new sampling interval.
    pub fn mark_sampled(&mut self, now: Instant) {
        self.last_sample = Some(now);
    }

    /// Bound to `[min, max]`. An inverted range resolves to `min` instead
    /// of panicking.
    fn clamp(&self, capacity: usize) -> usize {
        capacity
            .min(self.config.max_concurrency)
            .max(self.config.min_concurrency)
    }

    /// Target capacity for a CPU reading.
    ///
    /// - no usable reading (None, NaN, outside 0–100): hold, clamped
    /// - above the band: shrink by `step`
    /// - below the band with queued work: grow by `step`
    /// - below the band with less than half the capacity in use: shrink
    pub fn decide(&self, current: usize, cpu: Option<f64>, queued: usize, active: usize) -> usize {
        let Some(cpu) = valid_reading(cpu) else {
            return self.clamp(current);
        };
        let step = self.config.step;

        let target = if cpu > self.config.cpu_target_high {
            current.saturating_sub(step)
        } else if cpu < self.config.cpu_target_low {
            if queued > 0 {
                current.saturating_add(step)
            } else if active.saturating_mul(2) < current {
                current.saturating_sub(step)
            } else {
                current
            }
        } else {
            current
        };
        self.clamp(target)
    }

    /// Record an evaluation and the capacity actually applied.
    pub fn record(&mut self, cpu: Option<f64>, before: usize, after: usize) {
        if before != after {
            self.adjustments += 1;
        }
        self.history.push(AutotuneSample {
            at: Utc::now(),
            cpu_percent: valid_reading(cpu),
            capacity_before: before,
            capacity_after: after,
        });
    }

    pub fn snapshot(&self) -> AutotuneSnapshot {
        AutotuneSnapshot {
            enabled: self.config.enabled,
            min_concurrency: self.config.min_concurrency,
            max_concurrency: self.config.max_concurrency,
            last_cpu_percent: self.history.last().and_then(|s| s.cpu_percent),
            adjustments: self.adjustments,
            history: self.history.iter().cloned().collect(),
        }
    }
}

fn valid_reading(cpu: Option<f64>) -> Option<f64> {
    cpu.filter(|v| v.is_finite() && (0.0..=100.0).contains(v))
}
