//! 基础设施层：内存持久化、本地事务运行时、默认适配器与可观测性工具

pub mod adapters;
pub mod in_memory_repository;
pub mod observability;
pub mod transaction_runtime;

pub use adapters::*;
pub use in_memory_repository::InMemoryProcessRepository;
pub use observability::*;
pub use transaction_runtime::LocalTransactionRuntime;
