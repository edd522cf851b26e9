//! Runtime configuration for the dispatch core.
//!
//! Parsed from TOML (`switchyard.toml`), then overlaid with `SWITCHYARD_*`
//! environment variables, then validated.

mod loading;
mod types;
mod validation;


pub use loading::load_dotenv;
pub use types::{
    AutotuneConfig, BulkheadConfig, ObservabilityConfig, SchedulerConfig, SwitchyardConfig,
};
