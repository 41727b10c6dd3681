//! 领域仓储抽象
//!
//! 定义持久化与事务运行时的抽象接口，由基础设施层实现

use async_trait::async_trait;
use jobqueue_core::SchedulerResult;

use crate::entities::ProcessEntity;

/// 作业记录仓储
#[async_trait]
pub trait ProcessRepository: Send + Sync {
    /// 按队列所有者加载作业，按 (created_at, name, id) 排序
    async fn find(&self, queue_owner: &str) -> SchedulerResult<Vec<ProcessEntity>>;
    async fn persist(&self, entity: &ProcessEntity) -> SchedulerResult<()>;
    async fn update(&self, entity: &ProcessEntity) -> SchedulerResult<()>;
    async fn remove(&self, entity: &ProcessEntity) -> SchedulerResult<()>;
    /// 持久化作业的 id，正数
    async fn next_id(&self) -> SchedulerResult<i64>;
    /// 非持久化作业的 id，负数
    async fn next_transient_id(&self) -> SchedulerResult<i64>;
}

/// 事务令牌
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionToken {
    pub id: String,
    pub durable: bool,
}

/// 外部事务运行时
#[async_trait]
pub trait TransactionRuntime: Send + Sync {
    async fn begin(&self, durable: bool) -> SchedulerResult<TransactionToken>;
    async fn commit(&self, token: &TransactionToken) -> SchedulerResult<()>;
    async fn rollback(&self, token: &TransactionToken) -> SchedulerResult<()>;
}
