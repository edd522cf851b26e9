use std::env;
use std::path::Path;
use std::str::FromStr;

use crate::error::SwitchyardError;

use super::types::SwitchyardConfig;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries `{PROFILE}_{KEY}` first, falls back to `{KEY}`.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

/// Overwrite `target` when the variable is set and parses; unparsable
/// values are logged and ignored.
fn override_from<T: FromStr>(profile: &str, key: &str, target: &mut T) {
    if let Some(raw) = profiled_env_opt(profile, key) {
        match raw.parse::<T>() {
            Ok(v) => *target = v,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring unparsable env override"),
        }
    }
}

impl SwitchyardConfig {
    /// Parse config from a TOML string, apply env overrides and validate.
    pub fn from_toml(toml_str: &str) -> Result<Self, SwitchyardError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SwitchyardError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Defaults overlaid with env overrides, validated.
    pub fn from_env() -> Result<Self, SwitchyardError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    // ── Environment variable overrides ──────────────────────────────

    /// Apply environment variable overrides.
    ///
    /// Convention: `SWITCHYARD_SECTION_KEY` overrides `section.key`. When
    /// `SWITCHYARD_PROFILE` is set (e.g. `PROD`), `PROD_SWITCHYARD_SECTION_KEY`
    /// wins over the unprefixed variable.
    pub fn apply_env_overrides(&mut self) {
        let profile = env_opt("SWITCHYARD_PROFILE")
            .unwrap_or_default()
            .to_uppercase();
        let p = profile.as_str();

        let s = &mut self.scheduler;
        override_from(p, "SWITCHYARD_SCHEDULER_INITIAL_CONCURRENCY", &mut s.initial_concurrency);
        override_from(p, "SWITCHYARD_SCHEDULER_KILL_GRACE_MS", &mut s.kill_grace_ms);
        override_from(p, "SWITCHYARD_SCHEDULER_IDLE_TICK_MS", &mut s.idle_tick_ms);
        override_from(p, "SWITCHYARD_SCHEDULER_INTERNAL_BYPASS", &mut s.internal_bypass);
        if let Some(v) = profiled_env_opt(p, "SWITCHYARD_SCHEDULER_DEFAULT_MAX_PROCESSING_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                s.default_max_processing_ms = Some(ms);
            }
        }

        let a = &mut self.autotune;
        override_from(p, "SWITCHYARD_AUTOTUNE_ENABLED", &mut a.enabled);
        override_from(p, "SWITCHYARD_AUTOTUNE_MIN_CONCURRENCY", &mut a.min_concurrency);
        override_from(p, "SWITCHYARD_AUTOTUNE_MAX_CONCURRENCY", &mut a.max_concurrency);
        override_from(p, "SWITCHYARD_AUTOTUNE_CPU_TARGET_LOW", &mut a.cpu_target_low);
        override_from(p, "SWITCHYARD_AUTOTUNE_CPU_TARGET_HIGH", &mut a.cpu_target_high);
        override_from(p, "SWITCHYARD_AUTOTUNE_STEP", &mut a.step);
        override_from(p, "SWITCHYARD_AUTOTUNE_SAMPLE_INTERVAL_MS", &mut a.sample_interval_ms);

        override_from(
            p,
            "SWITCHYARD_OBSERVABILITY_STATISTICS_INTERVAL_SECS",
            &mut self.observability.statistics_interval_secs,
        );
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        let s = &self.scheduler;
        let a = &self.autotune;
        tracing::info!("Config loaded:");
        tracing::info!(
            "  scheduler:   concurrency={}, kill_grace={}ms, idle_tick={}ms, internal_bypass={}",
            s.initial_concurrency,
            s.kill_grace_ms,
            s.idle_tick_ms,
            s.internal_bypass
        );
        tracing::info!(
            "  autotune:    enabled={}, range={}..={}, cpu_band={}..{}%, step={}",
            a.enabled,
            a.min_concurrency,
            a.max_concurrency,
            a.cpu_target_low,
            a.cpu_target_high,
            a.step
        );
        for b in &self.bulkheads {
            tracing::info!(
                "  bulkhead:    priority={}, slots={}, overage={}",
                b.priority,
                b.slots,
                b.overage
            );
        }
        tracing::info!(
            "  statistics:  interval={}s",
            self.observability.statistics_interval_secs
        );
    }
}
