use std::collections::HashSet;

use super::types::SwitchyardConfig;
use crate::error::SwitchyardError;

impl SwitchyardConfig {
    /// Validate the config: capacity ranges, CPU band, bulkhead uniqueness.
    pub fn validate(&self) -> Result<(), SwitchyardError> {
        self.validate_scheduler()?;
        self.validate_autotune()?;
        self.validate_bulkheads()?;
        Ok(())
    }

    fn validate_scheduler(&self) -> Result<(), SwitchyardError> {
        let s = &self.scheduler;
        if s.initial_concurrency == 0 {
            return Err(SwitchyardError::Config(
                "scheduler.initial_concurrency must be at least 1".into(),
            ));
        }
        if s.idle_tick_ms == 0 {
            return Err(SwitchyardError::Config(
                "scheduler.idle_tick_ms must be at least 1".into(),
            ));
        }
        Ok(())
    }

    fn validate_autotune(&self) -> Result<(), SwitchyardError> {
        let a = &self.autotune;
        if a.min_concurrency == 0 {
            return Err(SwitchyardError::Config(
                "autotune.min_concurrency must be at least 1".into(),
            ));
        }
        if a.min_concurrency > a.max_concurrency {
            return Err(SwitchyardError::Config(format!(
                "autotune.min_concurrency ({}) exceeds max_concurrency ({})",
                a.min_concurrency, a.max_concurrency
            )));
        }
        let in_range = |v: f64| (0.0..=100.0).contains(&v);
        if !in_range(a.cpu_target_low) || !in_range(a.cpu_target_high) {
            return Err(SwitchyardError::Config(
                "autotune CPU targets must be within 0..=100".into(),
            ));
        }
        if a.cpu_target_low >= a.cpu_target_high {
            return Err(SwitchyardError::Config(format!(
                "autotune.cpu_target_low ({}) must be below cpu_target_high ({})",
                a.cpu_target_low, a.cpu_target_high
            )));
        }
        if a.step == 0 {
            return Err(SwitchyardError::Config("autotune.step must be at least 1".into()));
        }
        if a.sample_interval_ms == 0 {
            return Err(SwitchyardError::Config(
                "autotune.sample_interval_ms must be at least 1".into(),
            ));
        }
        let initial = self.scheduler.initial_concurrency;
        if a.enabled && !(a.min_concurrency..=a.max_concurrency).contains(&initial) {
            return Err(SwitchyardError::Config(format!(
                "scheduler.initial_concurrency ({initial}) outside autotune range {}..={}",
                a.min_concurrency, a.max_concurrency
            )));
        }
        Ok(())
    }

    fn validate_bulkheads(&self) -> Result<(), SwitchyardError> {
        let mut seen = HashSet::new();
        for b in &self.bulkheads {
            if !seen.insert(b.priority) {
                return Err(SwitchyardError::Config(format!(
                    "duplicate bulkhead for priority {}",
                    b.priority
                )));
            }
        }

        // Capacity can reach max_concurrency under autotune; reservations
        // beyond that could never all be honoured.
        let ceiling = if self.autotune.enabled {
            self.autotune.max_concurrency
        } else {
            self.scheduler.initial_concurrency
        };
        let reserved: usize = self.bulkheads.iter().map(|b| b.slots).sum();
        if reserved > ceiling {
            return Err(SwitchyardError::Config(format!(
                "bulkheads reserve {reserved} slots but capacity never exceeds {ceiling}"
            )));
        }
        Ok(())
    }
}
