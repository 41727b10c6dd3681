//! 作业调度引擎：等待/唤醒调度、准入协调、运行器状态机与事务封装

pub mod builder;
pub mod context;
pub mod executor;
pub mod handle;
pub mod registry;
pub mod runner;
pub mod scheduler;
pub mod server;
pub mod transaction;
pub mod unpark;
pub mod wrapper;

pub use builder::ProcessBuilder;
pub use context::{EngineContext, QueueRegistry, WorkRegistry};
pub use handle::ProcessHandle;
pub use registry::ProcessServerRegistry;
pub use runner::{ProcessRunner, UnparkOutcome};
pub use scheduler::ProcessScheduler;
pub use server::{ProcessServer, QueueStatistics, ServerStatistics};
pub use transaction::Transaction;
pub use unpark::UnparkCoordinator;
pub use wrapper::{ProcessPolicies, ProcessWrapper};
