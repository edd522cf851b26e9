pub mod config;
pub mod error;
pub mod routing;

pub use config::{
    load_dotenv, AutotuneConfig, BulkheadConfig, ObservabilityConfig, SchedulerConfig,
    SwitchyardConfig,
};
pub use error::SwitchyardError;
pub use routing::RoutingKey;
