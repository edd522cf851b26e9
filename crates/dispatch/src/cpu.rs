//! CPU utilization sampling for autotune.
//!
//! [`ProcessCpuProbe`] (the default) measures this process; [`ProcStatProbe`]
//! measures the whole host. Both read Linux procfs and yield `None` elsewhere.

use std::path::{Path, PathBuf};

use tracing::debug;

/// Source of CPU utilization readings, in percent (0–100).
///
/// `None` means no reading is available; autotune then holds capacity.
pub trait CpuProbe: Send {
    fn sample(&mut self) -> Option<f64>;
}

impl<F> CpuProbe for F
where
    F: FnMut() -> Option<f64> + Send,
{
    fn sample(&mut self) -> Option<f64> {
        self()
    }
}

/// Probe that never has a reading.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullProbe;

impl CpuProbe for NullProbe {
    fn sample(&mut self) -> Option<f64> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    idle: u64,
    total: u64,
}

/// Whole-host utilization from successive `/proc/stat` readings.
///
/// The first call only primes the baseline and returns `None`.
#[derive(Debug)]
pub struct ProcStatProbe {
    path: PathBuf,
    previous: Option<CpuTimes>,
}

impl ProcStatProbe {
    pub fn new() -> Self {
        Self::with_path("/proc/stat")
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            previous: None,
        }
    }

    fn read(&self) -> Option<CpuTimes> {
        parse_cpu_times(&read_procfs(&self.path)?)
    }
}

impl Default for ProcStatProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuProbe for ProcStatProbe {
    fn sample(&mut self) -> Option<f64> {
        let current = self.read()?;
        let previous = self.previous.replace(current)?;
        utilization(previous, current)
    }
}

/// Parse the aggregate `cpu` line: user nice system idle iowait irq softirq steal.
fn parse_cpu_times(content: &str) -> Option<CpuTimes> {
    let line = content.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .take(8)
        .map(str::parse)
        .collect::<Result<_, _>>()
        .ok()?;
    if fields.len() < 4 {
        return None;
    }
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        idle,
        total: fields.iter().sum(),
    })
}

/// This process's share of total host CPU time.
///
/// Compares the `utime + stime` delta from `/proc/self/stat` with the
/// aggregate `/proc/stat` total over the same interval, both in clock
/// ticks; one fully busy core out of four reads as 25%. The first call
/// only primes the baseline and returns `None`.
#[derive(Debug)]
pub struct ProcessCpuProbe {
    host_path: PathBuf,
    process_path: PathBuf,
    previous: Option<ProcessTimes>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProcessTimes {
    process: u64,
    host_total: u64,
}

impl ProcessCpuProbe {
    pub fn new() -> Self {
        Self::with_paths("/proc/stat", "/proc/self/stat")
    }

    pub fn with_paths(host_path: impl Into<PathBuf>, process_path: impl Into<PathBuf>) -> Self {
        Self {
            host_path: host_path.into(),
            process_path: process_path.into(),
            previous: None,
        }
    }

    fn read(&self) -> Option<ProcessTimes> {
        let host = read_procfs(&self.host_path)?;
        let process = read_procfs(&self.process_path)?;
        Some(ProcessTimes {
            process: parse_process_ticks(&process)?,
            host_total: parse_cpu_times(&host)?.total,
        })
    }
}

impl Default for ProcessCpuProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuProbe for ProcessCpuProbe {
    fn sample(&mut self) -> Option<f64> {
        let current = self.read()?;
        let previous = self.previous.replace(current)?;
        process_share(previous, current)
    }
}

fn read_procfs(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(content) => Some(content),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "cpu stat unavailable");
            None
        }
    }
}

/// `utime + stime` from a `/proc/<pid>/stat` line. The command name is
/// parenthesized and may itself contain spaces or parentheses, so fields
/// are counted from the last `)`: utime and stime are the 12th and 13th
/// fields after it.
fn parse_process_ticks(content: &str) -> Option<u64> {
    let rest = &content[content.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace().skip(11);
    let utime: u64 = fields.next()?.parse().ok()?;
    let stime: u64 = fields.next()?.parse().ok()?;
    Some(utime + stime)
}

fn process_share(previous: ProcessTimes, current: ProcessTimes) -> Option<f64> {
    let total = current.host_total.checked_sub(previous.host_total)?;
    let process = current.process.checked_sub(previous.process)?;
    if total == 0 {
        return None;
    }
    Some((process as f64 / total as f64 * 100.0).clamp(0.0, 100.0))
}

fn utilization(previous: CpuTimes, current: CpuTimes) -> Option<f64> {
    let total = current.total.checked_sub(previous.total)?;
    let idle = current.idle.checked_sub(previous.idle)?;
    if total == 0 {
        return None;
    }
    let busy = total.saturating_sub(idle) as f64;
    Some((busy / total as f64 * 100.0).clamp(0.0, 100.0))
}
