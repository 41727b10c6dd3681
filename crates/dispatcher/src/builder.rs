use std::collections::BTreeMap;
use std::sync::Arc;

use jobqueue_core::{SchedulerError, SchedulerResult};
use jobqueue_domain::ports::{Access, OutputProvider, Visibility};
use jobqueue_domain::{
    Occurrence, OutputRequest, ProcessAction, ProcessDefinition, ProcessEntity, ProcessSection,
    Queue, Resilience,
};
use jobqueue_infrastructure::StructuredLogger;
use tracing::{instrument, warn};

use crate::handle::ProcessHandle;
use crate::registry::ProcessServerRegistry;
use crate::wrapper::{ProcessPolicies, ProcessWrapper};

/// 作业构建器
///
/// 未设置的属性依次取队列（沿父链继承）和引擎配置中的默认值。
pub struct ProcessBuilder {
    registry: Arc<ProcessServerRegistry>,
    queue: Arc<Queue>,
    name: Option<String>,
    description: Option<String>,
    owner: Option<String>,
    user: Option<String>,
    occurrence: Option<Occurrence>,
    resilience: Option<Resilience>,
    policies: ProcessPolicies,
    output: Option<OutputRequest>,
    persistent: Option<bool>,
    keep_completed: Option<bool>,
    parameters: BTreeMap<String, serde_json::Value>,
    definition: ProcessDefinition,
    work_key: Option<String>,
}

impl ProcessBuilder {
    pub fn new(registry: Arc<ProcessServerRegistry>, queue: Arc<Queue>) -> Self {
        Self {
            registry,
            queue,
            name: None,
            description: None,
            owner: None,
            user: None,
            occurrence: None,
            resilience: None,
            policies: ProcessPolicies::default(),
            output: None,
            persistent: None,
            keep_completed: None,
            parameters: BTreeMap::new(),
            definition: ProcessDefinition::new(),
            work_key: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// 队列所有者，决定作业归属的服务器
    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn occurrence(mut self, occurrence: Occurrence) -> Self {
        self.occurrence = Some(occurrence);
        self
    }

    pub fn resilience(mut self, resilience: Resilience) -> Self {
        self.resilience = Some(resilience);
        self
    }

    pub fn visibility(mut self, visibility: Arc<dyn Visibility>) -> Self {
        self.policies.visibility = Some(visibility);
        self
    }

    pub fn access(mut self, access: Arc<dyn Access>) -> Self {
        self.policies.access = Some(access);
        self
    }

    pub fn output_provider(mut self, provider: Arc<dyn OutputProvider>) -> Self {
        self.policies.output = Some(provider);
        self
    }

    pub fn output(mut self, report_type: impl Into<String>, source_name: impl Into<String>) -> Self {
        self.output = Some(OutputRequest {
            report_type: report_type.into(),
            source_name: source_name.into(),
        });
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = Some(persistent);
        self
    }

    pub fn keep_completed(mut self, keep_completed: bool) -> Self {
        self.keep_completed = Some(keep_completed);
        self
    }

    pub fn parameter(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn section(mut self, section: impl ProcessSection + 'static) -> Self {
        self.definition = self.definition.section(section);
        self
    }

    pub fn failure_section(mut self, section: impl ProcessSection + 'static) -> Self {
        self.definition = self.definition.failure_section(section);
        self
    }

    pub fn pre_action(mut self, action: impl ProcessAction + 'static) -> Self {
        self.definition = self.definition.pre_action(action);
        self
    }

    pub fn post_action(mut self, action: impl ProcessAction + 'static) -> Self {
        self.definition = self.definition.post_action(action);
        self
    }

    pub fn definition(mut self, definition: ProcessDefinition) -> Self {
        self.definition = definition;
        self
    }

    /// 作业定义的登记键；未直接提供分段时使用已登记的定义
    pub fn work(mut self, key: impl Into<String>) -> Self {
        self.work_key = Some(key.into());
        self
    }

    #[instrument(skip(self), fields(process.name = ?self.name, queue = %self.queue.name()))]
    pub async fn submit(self) -> SchedulerResult<ProcessHandle> {
        let context = self.registry.context().clone();
        let config = &context.config;
        let queue = self.queue;

        let name = self
            .name
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| SchedulerError::validation_error("作业名称不能为空"))?;

        let definition = if self.definition.is_empty() {
            let key = self
                .work_key
                .as_deref()
                .ok_or_else(|| SchedulerError::validation_error("作业至少需要一个分段"))?;
            context
                .works
                .get(key)
                .ok_or_else(|| SchedulerError::work_not_registered(key))?
        } else {
            let definition = Arc::new(self.definition);
            if let Some(key) = &self.work_key {
                context.works.register_shared(key, &definition);
            }
            definition
        };

        let occurrence = self
            .occurrence
            .or_else(|| queue.occurrence().cloned())
            .unwrap_or_else(Occurrence::immediate);
        occurrence.validate()?;
        let resilience = self
            .resilience
            .or_else(|| queue.resilience().cloned())
            .unwrap_or_default();
        let persistent = self
            .persistent
            .or_else(|| queue.persistent())
            .unwrap_or(config.defaults.persistent);
        let keep_completed = self
            .keep_completed
            .or_else(|| queue.keep_completed())
            .unwrap_or(config.defaults.keep_completed);

        if self.output.is_some()
            && self.policies.output.is_none()
            && queue.output_provider().is_none()
        {
            return Err(SchedulerError::validation_error(format!(
                "作业 {name} 声明了输出，但队列 {} 没有输出提供者",
                queue.name()
            )));
        }
        if persistent && self.work_key.is_none() {
            warn!("持久化作业 {} 未设置作业定义键，重新加载后不会被调度", name);
        }

        context.queues.register(queue.clone())?;
        let owner = self
            .owner
            .unwrap_or_else(|| config.defaults.owner.clone());
        let server = self.registry.server(&owner).await?;

        let id = if persistent {
            context.repository.next_id().await?
        } else {
            context.repository.next_transient_id().await?
        };
        let mut entity = ProcessEntity::new(
            id,
            owner.as_str(),
            queue.name(),
            name,
            occurrence,
            resilience,
        );
        entity.description = self.description;
        entity.user = self.user;
        entity.parameters = self.parameters;
        entity.persistent = persistent;
        entity.keep_completed = keep_completed;
        entity.work_key = self.work_key;
        entity.output = self.output;

        let wrapper = Arc::new(ProcessWrapper::new(
            entity,
            queue,
            Some(definition),
            self.policies,
            Arc::downgrade(&server),
        ));
        server
            .do_transaction(
                persistent,
                |tx| {
                    tx.insert(&server, &wrapper);
                    Ok(())
                },
                |_| {
                    let key = wrapper.key();
                    StructuredLogger::log_process_submitted(
                        key.id,
                        &key.name,
                        wrapper.queue().name(),
                        &owner,
                        persistent,
                    );
                },
                Some(&wrapper),
            )
            .await?;

        Ok(ProcessHandle::new(server, wrapper))
    }
}
