//! 周期/延迟作业调度引擎
//!
//! [`QueueEngine`] 组合持久化适配器、事务运行时、队列与作业定义注册表，
//! 并按队列所有者创建作业服务器。

pub mod app;
pub mod shutdown;

pub use app::{QueueEngine, QueueEngineBuilder};
pub use shutdown::ShutdownManager;

pub use jobqueue_core::{AppConfig, SchedulerError, SchedulerResult};
pub use jobqueue_dispatcher::{
    ProcessBuilder, ProcessHandle, ProcessServer, QueueStatistics, ServerStatistics,
};
pub use jobqueue_domain as domain;
