use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use jobqueue_core::{SchedulerError, SchedulerResult};
use jobqueue_domain::repositories::{TransactionRuntime, TransactionToken};
use parking_lot::Mutex;
use tracing::trace;
use uuid::Uuid;

/// 进程内事务运行时
///
/// 只跟踪事务令牌的生命周期，不协调任何外部资源。
#[derive(Debug, Default)]
pub struct LocalTransactionRuntime {
    active: Mutex<HashSet<String>>,
    committed: AtomicU64,
    rolled_back: AtomicU64,
}

impl LocalTransactionRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    pub fn committed(&self) -> u64 {
        self.committed.load(Ordering::Relaxed)
    }

    pub fn rolled_back(&self) -> u64 {
        self.rolled_back.load(Ordering::Relaxed)
    }

    fn finish(&self, token: &TransactionToken) -> SchedulerResult<()> {
        if !self.active.lock().remove(&token.id) {
            return Err(SchedulerError::transaction(format!(
                "未知或已结束的事务: {}",
                token.id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl TransactionRuntime for LocalTransactionRuntime {
    async fn begin(&self, durable: bool) -> SchedulerResult<TransactionToken> {
        let token = TransactionToken {
            id: Uuid::new_v4().to_string(),
            durable,
        };
        self.active.lock().insert(token.id.clone());
        trace!("开始事务: {}, durable={}", token.id, durable);
        Ok(token)
    }

    async fn commit(&self, token: &TransactionToken) -> SchedulerResult<()> {
        self.finish(token)?;
        self.committed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn rollback(&self, token: &TransactionToken) -> SchedulerResult<()> {
        self.finish(token)?;
        self.rolled_back.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
