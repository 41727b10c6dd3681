//! 作业调度引擎的公共基础：统一错误类型、配置模型与日志初始化。

pub mod config;
pub mod errors;
pub mod logging;

pub use config::*;
pub use errors::{SchedulerError, SchedulerResult};
pub use logging::{init_from_config, init_logging};
