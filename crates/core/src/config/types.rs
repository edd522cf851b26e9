use std::time::Duration;

use serde::{Deserialize, Serialize};

// ── Top-level config ────────────────────────────────────────────────

/// Full configuration for a switchyard node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SwitchyardConfig {
    /// Control loop and capacity settings.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// CPU-driven capacity tuning.
    #[serde(default)]
    pub autotune: AutotuneConfig,

    /// Guaranteed per-priority reservations applied at startup.
    #[serde(default)]
    pub bulkheads: Vec<BulkheadConfig>,

    /// Periodic statistics output.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

// ── Section configs ─────────────────────────────────────────────────

/// Scheduler section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Total concurrency budget at startup.
    #[serde(default = "default_initial_concurrency")]
    pub initial_concurrency: usize,

    /// Time between a cooperative cancel and the forced kill, in milliseconds.
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,

    /// Upper bound on how long the control loop sleeps without a wake signal.
    #[serde(default = "default_idle_tick_ms")]
    pub idle_tick_ms: u64,

    /// Internal work skips the priority queue and only needs a free slot.
    #[serde(default = "default_internal_bypass")]
    pub internal_bypass: bool,

    /// Processing limit applied when a request does not set one.
    #[serde(default)]
    pub default_max_processing_ms: Option<u64>,
}

fn default_initial_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(8)
}

fn default_kill_grace_ms() -> u64 {
    5_000
}

fn default_idle_tick_ms() -> u64 {
    100
}

fn default_internal_bypass() -> bool {
    true
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            initial_concurrency: default_initial_concurrency(),
            kill_grace_ms: default_kill_grace_ms(),
            idle_tick_ms: default_idle_tick_ms(),
            internal_bypass: default_internal_bypass(),
            default_max_processing_ms: None,
        }
    }
}

impl SchedulerConfig {
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn idle_tick(&self) -> Duration {
        Duration::from_millis(self.idle_tick_ms)
    }

    pub fn default_max_processing(&self) -> Option<Duration> {
        self.default_max_processing_ms.map(Duration::from_millis)
    }
}

/// Autotune section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutotuneConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_min_concurrency")]
    pub min_concurrency: usize,

    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Lower edge of the target CPU band, in percent.
    #[serde(default = "default_cpu_target_low")]
    pub cpu_target_low: f64,

    /// Upper edge of the target CPU band, in percent.
    #[serde(default = "default_cpu_target_high")]
    pub cpu_target_high: f64,

    /// Maximum capacity change per adjustment.
    #[serde(default = "default_step")]
    pub step: usize,

    /// Minimum time between two CPU samples (and therefore two adjustments).
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
}

fn default_min_concurrency() -> usize {
    1
}

fn default_max_concurrency() -> usize {
    64
}

fn default_cpu_target_low() -> f64 {
    50.0
}

fn default_cpu_target_high() -> f64 {
    75.0
}

fn default_step() -> usize {
    1
}

fn default_sample_interval_ms() -> u64 {
    2_000
}

impl Default for AutotuneConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_concurrency: default_min_concurrency(),
            max_concurrency: default_max_concurrency(),
            cpu_target_low: default_cpu_target_low(),
            cpu_target_high: default_cpu_target_high(),
            step: default_step(),
            sample_interval_ms: default_sample_interval_ms(),
        }
    }
}

impl AutotuneConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

/// A bulkhead reservation: `slots` guaranteed to `priority`, plus up to
/// `overage` borrowed from the shared pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkheadConfig {
    pub priority: i32,
    pub slots: usize,
    #[serde(default)]
    pub overage: usize,
}

/// Observability section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Interval of the statistics log line in seconds (0 = disabled).
    #[serde(default = "default_statistics_interval_secs")]
    pub statistics_interval_secs: u64,
}

fn default_statistics_interval_secs() -> u64 {
    30
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            statistics_interval_secs: default_statistics_interval_secs(),
        }
    }
}

impl ObservabilityConfig {
    /// `None` when the statistics logger is disabled.
    pub fn statistics_interval(&self) -> Option<Duration> {
        (self.statistics_interval_secs > 0)
            .then(|| Duration::from_secs(self.statistics_interval_secs))
    }
}
