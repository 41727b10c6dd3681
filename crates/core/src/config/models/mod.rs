pub mod app_config;
pub mod engine;
pub mod observability;

pub use app_config::AppConfig;
pub use engine::{DefaultsConfig, ExecutionConfig, SchedulerConfig};
pub use observability::ObservabilityConfig;
