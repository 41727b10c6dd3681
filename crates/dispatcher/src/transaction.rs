//! 作业状态事务
//!
//! 事务内的修改立即作用于内存中的作业和索引，同时记录修改前的快照。提交时把
//! 持久化作业的变更写入仓储并提交事务运行时；任一步失败则按相反顺序恢复快照。

use std::sync::Arc;

use jobqueue_core::{SchedulerError, SchedulerResult};
use jobqueue_domain::repositories::TransactionToken;
use jobqueue_domain::ProcessEntity;
use jobqueue_infrastructure::StructuredLogger;
use tracing::{debug, error};

use crate::context::EngineContext;
use crate::server::ProcessServer;
use crate::wrapper::ProcessWrapper;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChangeKind {
    /// 新提交的作业
    Inserted,
    /// 从仓储重新加载的作业，只进入内存
    Loaded,
    Updated,
    Removed,
    /// 同一事务内插入后又删除
    Discarded,
}

struct Touched {
    server: Arc<ProcessServer>,
    wrapper: Arc<ProcessWrapper>,
    before: Option<ProcessEntity>,
    was_present: bool,
    change: ChangeKind,
}

pub struct Transaction {
    context: Arc<EngineContext>,
    token: TransactionToken,
    touched: Vec<Touched>,
}

impl Transaction {
    pub async fn begin(context: &Arc<EngineContext>, durable: bool) -> SchedulerResult<Self> {
        let token = context.transactions.begin(durable).await?;
        Ok(Self {
            context: context.clone(),
            token,
            touched: Vec::new(),
        })
    }

    pub fn is_durable(&self) -> bool {
        self.token.durable
    }

    pub fn touched(&self) -> usize {
        self.touched.len()
    }

    fn position(&self, wrapper: &Arc<ProcessWrapper>) -> Option<usize> {
        self.touched
            .iter()
            .position(|t| Arc::ptr_eq(&t.wrapper, wrapper))
    }

    fn record(
        &mut self,
        server: &Arc<ProcessServer>,
        wrapper: &Arc<ProcessWrapper>,
        change: ChangeKind,
    ) {
        match self.position(wrapper) {
            Some(index) => {
                let touched = &mut self.touched[index];
                touched.change = match (touched.change, change) {
                    (ChangeKind::Inserted, ChangeKind::Removed) => ChangeKind::Discarded,
                    (ChangeKind::Inserted, _) => ChangeKind::Inserted,
                    (ChangeKind::Discarded, _) => ChangeKind::Discarded,
                    (_, next) => next,
                };
            }
            None => {
                let was_present = server.contains(wrapper.key());
                let before = match change {
                    ChangeKind::Inserted | ChangeKind::Loaded => None,
                    _ => Some(wrapper.snapshot()),
                };
                self.touched.push(Touched {
                    server: server.clone(),
                    wrapper: wrapper.clone(),
                    before,
                    was_present,
                    change,
                });
            }
        }
    }

    /// 加入新提交的作业
    pub fn insert(&mut self, server: &Arc<ProcessServer>, wrapper: &Arc<ProcessWrapper>) {
        self.record(server, wrapper, ChangeKind::Inserted);
        server.attach_wrapper(wrapper);
    }

    /// 加入重新加载的作业，提交时不写仓储
    pub fn adopt(&mut self, server: &Arc<ProcessServer>, wrapper: &Arc<ProcessWrapper>) {
        self.record(server, wrapper, ChangeKind::Loaded);
        server.attach_wrapper(wrapper);
    }

    /// 修改作业记录并重新索引
    pub fn update<R>(
        &mut self,
        server: &Arc<ProcessServer>,
        wrapper: &Arc<ProcessWrapper>,
        mutation: impl FnOnce(&mut ProcessEntity) -> R,
    ) -> R {
        match self.position(wrapper) {
            None => self.record(server, wrapper, ChangeKind::Updated),
            Some(index) if self.touched[index].change == ChangeKind::Loaded => {
                self.touched[index].change = ChangeKind::Updated;
            }
            Some(_) => {}
        }
        server.mutate_indexed(wrapper, mutation)
    }

    /// 从服务器移除作业
    pub fn remove(&mut self, server: &Arc<ProcessServer>, wrapper: &Arc<ProcessWrapper>) {
        self.record(server, wrapper, ChangeKind::Removed);
        server.detach_wrapper(wrapper);
    }

    async fn flush(&self) -> SchedulerResult<()> {
        let repository = &self.context.repository;
        for touched in &self.touched {
            let entity = touched.wrapper.snapshot();
            if !entity.persistent {
                continue;
            }
            let written = match touched.change {
                ChangeKind::Inserted => repository.persist(&entity).await,
                ChangeKind::Updated => repository.update(&entity).await,
                ChangeKind::Removed => repository.remove(&entity).await,
                ChangeKind::Loaded | ChangeKind::Discarded => Ok(()),
            };
            written.map_err(|e| match e {
                SchedulerError::Persistence(_) | SchedulerError::Transaction(_) => e,
                other => SchedulerError::persistence(other.to_string()),
            })?;
        }
        Ok(())
    }

    pub async fn commit(self) -> SchedulerResult<()> {
        let committed = match self.flush().await {
            Ok(()) => self.context.transactions.commit(&self.token).await,
            Err(e) => Err(e),
        };

        if let Err(e) = committed {
            error!("事务提交失败，恢复内存状态: {}", e);
            self.restore();
            if let Err(rollback_error) = self.context.transactions.rollback(&self.token).await {
                debug!("事务运行时回滚失败: {}", rollback_error);
            }
            self.context.metrics.record_rollback();
            StructuredLogger::log_transaction_rollback(&e.to_string(), self.touched.len());
            return Err(e);
        }

        self.context.metrics.record_commit();
        let mut notified: Vec<&Arc<ProcessServer>> = Vec::new();
        for touched in &self.touched {
            if !notified.iter().any(|s| Arc::ptr_eq(s, &touched.server)) {
                notified.push(&touched.server);
            }
        }
        for server in notified {
            server.notify_all();
        }
        Ok(())
    }

    /// 放弃事务；`reason` 为 None 表示主动回滚
    pub async fn rollback(self, reason: Option<&str>) {
        self.restore();
        if let Err(e) = self.context.transactions.rollback(&self.token).await {
            debug!("事务运行时回滚失败: {}", e);
        }
        self.context.metrics.record_rollback();
        match reason {
            Some(reason) => StructuredLogger::log_transaction_rollback(reason, self.touched.len()),
            None => debug!("事务主动回滚，涉及 {} 个作业", self.touched.len()),
        }
    }

    fn restore(&self) {
        for touched in self.touched.iter().rev() {
            if let Some(before) = &touched.before {
                touched.wrapper.replace_entity(before.clone());
            }
            if touched.was_present {
                touched.server.attach_wrapper(&touched.wrapper);
            } else {
                touched.server.detach_wrapper(&touched.wrapper);
            }
        }
    }
}
