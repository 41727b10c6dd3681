use std::sync::Arc;

use jobqueue_core::{AppConfig, SchedulerError, SchedulerResult};
use jobqueue_dispatcher::{
    EngineContext, ProcessBuilder, ProcessHandle, ProcessServer, ProcessServerRegistry,
    ServerStatistics,
};
use jobqueue_domain::{ProcessDefinition, ProcessRepository, Queue, TransactionRuntime};
use jobqueue_infrastructure::{InMemoryProcessRepository, LocalTransactionRuntime};
use tracing::{info, instrument, warn};

use crate::shutdown::ShutdownManager;

/// 引擎构建器
///
/// 未指定仓储和事务运行时时使用内存实现。
pub struct QueueEngineBuilder {
    config: AppConfig,
    repository: Option<Arc<dyn ProcessRepository>>,
    transactions: Option<Arc<dyn TransactionRuntime>>,
    queues: Vec<Arc<Queue>>,
    works: Vec<(String, ProcessDefinition)>,
}

impl QueueEngineBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            repository: None,
            transactions: None,
            queues: Vec::new(),
            works: Vec::new(),
        }
    }

    pub fn repository(mut self, repository: Arc<dyn ProcessRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn transactions(mut self, transactions: Arc<dyn TransactionRuntime>) -> Self {
        self.transactions = Some(transactions);
        self
    }

    /// 登记队列，重启加载时按名称查找
    pub fn register_queue(mut self, queue: Arc<Queue>) -> Self {
        self.queues.push(queue);
        self
    }

    /// 登记作业定义，重启加载时按 work key 查找
    pub fn register_work(mut self, key: impl Into<String>, definition: ProcessDefinition) -> Self {
        self.works.push((key.into(), definition));
        self
    }

    pub fn build(self) -> SchedulerResult<QueueEngine> {
        self.config
            .validate()
            .map_err(|e| SchedulerError::config_error(format!("{e:#}")))?;

        let repository = self
            .repository
            .unwrap_or_else(|| Arc::new(InMemoryProcessRepository::new()) as Arc<dyn ProcessRepository>);
        let transactions = self
            .transactions
            .unwrap_or_else(|| Arc::new(LocalTransactionRuntime::new()) as Arc<dyn TransactionRuntime>);
        let context = Arc::new(EngineContext::new(self.config, repository, transactions));

        for queue in self.queues {
            context.queues.register(queue)?;
        }
        for (key, definition) in self.works {
            context.works.register(key, definition)?;
        }

        info!("作业引擎已创建，队列: {:?}", context.queues.names());
        Ok(QueueEngine {
            registry: Arc::new(ProcessServerRegistry::new(context.clone())),
            context,
            shutdown: ShutdownManager::new(),
        })
    }
}

/// 作业引擎：组合注册表、作业服务器与关闭流程
pub struct QueueEngine {
    context: Arc<EngineContext>,
    registry: Arc<ProcessServerRegistry>,
    shutdown: ShutdownManager,
}

impl QueueEngine {
    pub fn builder(config: AppConfig) -> QueueEngineBuilder {
        QueueEngineBuilder::new(config)
    }

    pub fn config(&self) -> &AppConfig {
        &self.context.config
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.context
    }

    pub fn registry(&self) -> &Arc<ProcessServerRegistry> {
        &self.registry
    }

    /// 开始构建提交到 `queue` 的作业
    pub fn process(&self, queue: &Arc<Queue>) -> ProcessBuilder {
        ProcessBuilder::new(self.registry.clone(), queue.clone())
    }

    /// 获取（必要时创建并加载）所有者的作业服务器
    pub async fn server(&self, owner: &str) -> SchedulerResult<Arc<ProcessServer>> {
        self.registry.server(owner).await
    }

    /// 对 `user` 可见的作业，按键顺序
    pub async fn visible_processes(
        &self,
        owner: &str,
        user: Option<&str>,
    ) -> SchedulerResult<Vec<ProcessHandle>> {
        let server = self.server(owner).await?;
        Ok(server
            .handles()
            .into_iter()
            .filter(|handle| handle.is_visible(user))
            .collect())
    }

    pub async fn statistics(&self) -> Vec<ServerStatistics> {
        self.registry
            .servers()
            .await
            .iter()
            .map(|server| server.statistics())
            .collect()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_shutdown()
    }

    /// 停止所有作业服务器，等待运行中的作业结束
    ///
    /// 所有作业在配置的关闭超时内结束时返回 true；重复调用直接返回 true。
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> bool {
        if !self.shutdown.shutdown() {
            return true;
        }
        let timeout = self.context.config.execution.shutdown_timeout();
        let finished = self.registry.shutdown(timeout).await;
        if finished {
            info!("作业引擎已关闭");
        } else {
            warn!("作业引擎关闭超时（{:?}）", timeout);
        }
        finished
    }
}
