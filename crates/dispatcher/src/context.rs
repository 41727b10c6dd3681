use std::collections::HashMap;
use std::sync::Arc;

use jobqueue_core::{AppConfig, SchedulerError, SchedulerResult};
use jobqueue_domain::repositories::{ProcessRepository, TransactionRuntime};
use jobqueue_domain::{ProcessDefinition, Queue};
use jobqueue_infrastructure::MetricsCollector;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 按名称登记的队列
///
/// 同名队列只能以相同的结构重复登记，重启后作业记录通过名称找回所属队列。
#[derive(Default)]
pub struct QueueRegistry {
    queues: RwLock<HashMap<String, Arc<Queue>>>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, queue: Arc<Queue>) -> SchedulerResult<()> {
        let mut queues = self.queues.write();
        match queues.get(queue.name()) {
            Some(existing) if existing.id() != queue.id() => Err(SchedulerError::config_error(
                format!(
                    "队列名称冲突: {} 已登记为 {}，新定义为 {}",
                    queue.name(),
                    existing.id(),
                    queue.id()
                ),
            )),
            Some(_) => Ok(()),
            None => {
                debug!("登记队列: {}", queue.id());
                queues.insert(queue.name().to_string(), queue);
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.read().keys().cloned().collect();
        names.sort();
        names
    }
}

/// 按键登记的作业定义，持久化作业重新加载时据此恢复可执行代码
#[derive(Default)]
pub struct WorkRegistry {
    works: RwLock<HashMap<String, Arc<ProcessDefinition>>>,
}

impl WorkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        key: impl Into<String>,
        definition: ProcessDefinition,
    ) -> SchedulerResult<Arc<ProcessDefinition>> {
        let key = key.into();
        if definition.is_empty() {
            return Err(SchedulerError::validation_error(format!(
                "作业定义 {key} 没有任何分段"
            )));
        }
        let definition = Arc::new(definition);
        self.works.write().insert(key, definition.clone());
        Ok(definition)
    }

    /// 已登记时保留原定义
    pub(crate) fn register_shared(&self, key: &str, definition: &Arc<ProcessDefinition>) {
        self.works
            .write()
            .entry(key.to_string())
            .or_insert_with(|| definition.clone());
    }

    pub fn get(&self, key: &str) -> Option<Arc<ProcessDefinition>> {
        self.works.read().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.works.read().contains_key(key)
    }
}

/// 引擎范围内共享的依赖
pub struct EngineContext {
    pub config: AppConfig,
    pub repository: Arc<dyn ProcessRepository>,
    pub transactions: Arc<dyn TransactionRuntime>,
    pub queues: QueueRegistry,
    pub works: WorkRegistry,
    pub metrics: Arc<MetricsCollector>,
    pub shutdown: CancellationToken,
}

impl EngineContext {
    pub fn new(
        config: AppConfig,
        repository: Arc<dyn ProcessRepository>,
        transactions: Arc<dyn TransactionRuntime>,
    ) -> Self {
        Self {
            config,
            repository,
            transactions,
            queues: QueueRegistry::new(),
            works: WorkRegistry::new(),
            metrics: Arc::new(MetricsCollector::new()),
            shutdown: CancellationToken::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobqueue_domain::{FnSection, MaxConcurrent};

    #[test]
    fn test_queue_registry_rejects_conflicting_definition() {
        let registry = QueueRegistry::new();
        registry
            .register(Arc::new(Queue::builder("reports").build()))
            .unwrap();
        registry
            .register(Arc::new(Queue::builder("reports").build()))
            .unwrap();

        let conflicting = Queue::builder("reports")
            .restriction(MaxConcurrent::new(2))
            .build();
        assert!(matches!(
            registry.register(Arc::new(conflicting)),
            Err(SchedulerError::Configuration(_))
        ));
        assert_eq!(registry.names(), vec!["reports".to_string()]);
    }

    #[test]
    fn test_work_registry() {
        let registry = WorkRegistry::new();
        assert!(registry.register("empty", ProcessDefinition::new()).is_err());

        let definition =
            ProcessDefinition::new().section(FnSection::new("noop", |_ctx| Ok(0)));
        registry.register("noop", definition).unwrap();
        assert!(registry.contains("noop"));
        assert_eq!(registry.get("noop").unwrap().sections().len(), 1);
        assert!(registry.get("missing").is_none());
    }
}
