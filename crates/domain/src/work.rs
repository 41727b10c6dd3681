//! 作业的工作单元：有序分段、前置/后置动作与执行上下文

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::entities::ProcessEntity;
use crate::ports::Outputable;
use crate::SchedulerResult;

/// 分段结果码
pub mod result_code {
    /// 继续下一分段
    pub const SUCCESS: i32 = 0;
    /// 失败，执行失败分段并按重试计划重试
    pub const FAILURE: i32 = 1;
}

/// 单次运行的执行上下文
pub struct ProcessContext {
    process_id: i64,
    name: String,
    owner: String,
    user: Option<String>,
    attempt: u32,
    run_count: u32,
    section: usize,
    parameters: BTreeMap<String, serde_json::Value>,
    cancel: CancellationToken,
    output: Option<Box<dyn Outputable>>,
}

impl ProcessContext {
    pub fn new(entity: &ProcessEntity, cancel: CancellationToken) -> Self {
        Self {
            process_id: entity.id,
            name: entity.name.clone(),
            owner: entity.queue_owner.clone(),
            user: entity.user.clone(),
            attempt: entity.attempt,
            run_count: entity.run_count,
            section: entity.current_section,
            parameters: entity.parameters.clone(),
            cancel,
            output: None,
        }
    }

    pub fn process_id(&self) -> i64 {
        self.process_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// 之前连续失败的次数，首次尝试为 0
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn run_count(&self) -> u32 {
        self.run_count
    }

    pub fn section_index(&self) -> usize {
        self.section
    }

    pub fn set_section_index(&mut self, section: usize) {
        self.section = section;
    }

    pub fn parameter(&self, name: &str) -> Option<&serde_json::Value> {
        self.parameters.get(name)
    }

    pub fn parameter_as<T: DeserializeOwned>(&self, name: &str) -> SchedulerResult<Option<T>> {
        self.parameters
            .get(name)
            .map(|value| serde_json::from_value(value.clone()))
            .transpose()
            .map_err(Into::into)
    }

    pub fn set_parameter<T: Serialize>(&mut self, name: impl Into<String>, value: T) -> SchedulerResult<()> {
        self.parameters
            .insert(name.into(), serde_json::to_value(value)?);
        Ok(())
    }

    pub fn parameters(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.parameters
    }

    pub fn replace_parameters(&mut self, parameters: BTreeMap<String, serde_json::Value>) {
        self.parameters = parameters;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn attach_output(&mut self, output: Box<dyn Outputable>) {
        self.output = Some(output);
    }

    pub fn take_output(&mut self) -> Option<Box<dyn Outputable>> {
        self.output.take()
    }

    pub fn has_output(&self) -> bool {
        self.output.is_some()
    }

    /// 未声明输出时忽略
    pub fn write_output(&mut self, text: &str) -> SchedulerResult<()> {
        match self.output.as_mut() {
            Some(output) => output.write(text),
            None => Ok(()),
        }
    }
}

#[async_trait]
pub trait ProcessSection: Send + Sync {
    fn name(&self) -> &str;

    /// 返回结果码：0 成功，1 失败，大于1 受控停止
    async fn execute(&self, ctx: &mut ProcessContext) -> SchedulerResult<i32>;
}

/// 同步闭包分段
pub struct FnSection<F> {
    name: String,
    f: F,
}

impl<F> FnSection<F>
where
    F: Fn(&mut ProcessContext) -> SchedulerResult<i32> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F> ProcessSection for FnSection<F>
where
    F: Fn(&mut ProcessContext) -> SchedulerResult<i32> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &mut ProcessContext) -> SchedulerResult<i32> {
        (self.f)(ctx)
    }
}

#[async_trait]
pub trait ProcessAction: Send + Sync {
    fn name(&self) -> &str;

    /// 为 true 时动作对参数的修改在独立事务中提交
    fn requires_transaction(&self) -> bool {
        false
    }

    async fn run(&self, ctx: &mut ProcessContext) -> SchedulerResult<()>;
}

pub struct FnAction<F> {
    name: String,
    transactional: bool,
    f: F,
}

impl<F> FnAction<F>
where
    F: Fn(&mut ProcessContext) -> SchedulerResult<()> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            transactional: false,
            f,
        }
    }

    pub fn transactional(mut self) -> Self {
        self.transactional = true;
        self
    }
}

#[async_trait]
impl<F> ProcessAction for FnAction<F>
where
    F: Fn(&mut ProcessContext) -> SchedulerResult<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn requires_transaction(&self) -> bool {
        self.transactional
    }

    async fn run(&self, ctx: &mut ProcessContext) -> SchedulerResult<()> {
        (self.f)(ctx)
    }
}

/// 作业定义：分段与动作
#[derive(Clone, Default)]
pub struct ProcessDefinition {
    sections: Vec<Arc<dyn ProcessSection>>,
    failure_section: Option<Arc<dyn ProcessSection>>,
    pre_actions: Vec<Arc<dyn ProcessAction>>,
    post_actions: Vec<Arc<dyn ProcessAction>>,
}

impl ProcessDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn section(self, section: impl ProcessSection + 'static) -> Self {
        self.shared_section(Arc::new(section))
    }

    pub fn shared_section(mut self, section: Arc<dyn ProcessSection>) -> Self {
        self.sections.push(section);
        self
    }

    pub fn failure_section(mut self, section: impl ProcessSection + 'static) -> Self {
        self.failure_section = Some(Arc::new(section));
        self
    }

    pub fn pre_action(mut self, action: impl ProcessAction + 'static) -> Self {
        self.pre_actions.push(Arc::new(action));
        self
    }

    pub fn post_action(mut self, action: impl ProcessAction + 'static) -> Self {
        self.post_actions.push(Arc::new(action));
        self
    }

    pub fn sections(&self) -> &[Arc<dyn ProcessSection>] {
        &self.sections
    }

    pub fn failure(&self) -> Option<&Arc<dyn ProcessSection>> {
        self.failure_section.as_ref()
    }

    pub fn pre_actions(&self) -> &[Arc<dyn ProcessAction>] {
        &self.pre_actions
    }

    pub fn post_actions(&self) -> &[Arc<dyn ProcessAction>] {
        &self.post_actions
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }
}

impl fmt::Debug for ProcessDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sections: Vec<&str> = self.sections.iter().map(|s| s.name()).collect();
        f.debug_struct("ProcessDefinition")
            .field("sections", &sections)
            .field("failure_section", &self.failure_section.as_ref().map(|s| s.name()))
            .field("pre_actions", &self.pre_actions.len())
            .field("post_actions", &self.post_actions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::occurrence::Occurrence;
    use crate::resilience::Resilience;

    fn context() -> ProcessContext {
        let mut entity = ProcessEntity::new(
            5,
            "owner",
            "q",
            "job",
            Occurrence::immediate(),
            Resilience::default(),
        );
        entity
            .parameters
            .insert("limit".to_string(), serde_json::json!(10));
        ProcessContext::new(&entity, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_fn_section_reads_and_writes_parameters() {
        let section = FnSection::new("double", |ctx: &mut ProcessContext| {
            let limit: i64 = ctx.parameter_as("limit")?.unwrap_or(0);
            ctx.set_parameter("limit", limit * 2)?;
            Ok(result_code::SUCCESS)
        });

        let mut ctx = context();
        assert_eq!(section.execute(&mut ctx).await.unwrap(), 0);
        assert_eq!(ctx.parameter("limit"), Some(&serde_json::json!(20)));
    }

    #[tokio::test]
    async fn test_write_output_without_target_is_noop() {
        let mut ctx = context();
        assert!(!ctx.has_output());
        assert!(ctx.write_output("ignored").is_ok());
    }

    #[test]
    fn test_definition_builder() {
        let definition = ProcessDefinition::new()
            .section(FnSection::new("a", |_| Ok(0)))
            .section(FnSection::new("b", |_| Ok(0)))
            .failure_section(FnSection::new("cleanup", |_| Ok(0)))
            .post_action(FnAction::new("audit", |_| Ok(())).transactional());

        assert_eq!(definition.sections().len(), 2);
        assert_eq!(definition.failure().map(|s| s.name()), Some("cleanup"));
        assert!(definition.post_actions()[0].requires_transaction());
        assert!(!definition.is_empty());
    }
}
