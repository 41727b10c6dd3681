//! 访问控制、可见性与输出的常用实现

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use jobqueue_core::SchedulerResult;
use jobqueue_domain::entities::ProcessEntity;
use jobqueue_domain::ports::{Access, OutputProvider, Outputable, Visibility};
use parking_lot::Mutex;

/// 只有提交者本人或管理员可以删除/重启
#[derive(Debug, Default, Clone)]
pub struct OwnerOnlyAccess {
    admins: HashSet<String>,
}

impl OwnerOnlyAccess {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_admin(mut self, user: impl Into<String>) -> Self {
        self.admins.insert(user.into());
        self
    }

    fn allowed(&self, job: &ProcessEntity, user: Option<&str>) -> bool {
        match user {
            Some(user) => self.admins.contains(user) || job.user.as_deref() == Some(user),
            None => false,
        }
    }
}

impl Access for OwnerOnlyAccess {
    fn name(&self) -> &str {
        "owner_only"
    }

    fn can_delete(&self, job: &ProcessEntity, user: Option<&str>, _partition: &str) -> bool {
        self.allowed(job, user)
    }

    fn can_restart(&self, job: &ProcessEntity, user: Option<&str>, _partition: &str) -> bool {
        self.allowed(job, user)
    }
}

/// 无提交者的作业对所有人可见，否则仅提交者可见
#[derive(Debug, Default, Clone, Copy)]
pub struct OwnerVisibility;

impl Visibility for OwnerVisibility {
    fn name(&self) -> &str {
        "owner"
    }

    fn is_visible(&self, job: &ProcessEntity, user: Option<&str>, _partition: &str) -> bool {
        match job.user.as_deref() {
            None => true,
            Some(owner) => user == Some(owner),
        }
    }
}

type OutputStore = Arc<Mutex<BTreeMap<String, String>>>;

/// 把作业输出收集在内存中，关闭时按 `owner/job/report_type/source` 归档
#[derive(Debug, Default, Clone)]
pub struct MemoryOutputProvider {
    store: OutputStore,
}

impl MemoryOutputProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn output_key(owner: &str, job_name: &str, report_type: &str, source_name: &str) -> String {
        format!("{owner}/{job_name}/{report_type}/{source_name}")
    }

    pub fn contents(&self, key: &str) -> Option<String> {
        self.store.lock().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.store.lock().keys().cloned().collect()
    }
}

impl OutputProvider for MemoryOutputProvider {
    fn name(&self) -> &str {
        "memory"
    }

    fn get_outputable(
        &self,
        owner: &str,
        _user: Option<&str>,
        job_name: &str,
        report_type: &str,
        source_name: &str,
    ) -> SchedulerResult<Box<dyn Outputable>> {
        Ok(Box::new(MemoryOutput {
            key: Self::output_key(owner, job_name, report_type, source_name),
            buffer: String::new(),
            store: self.store.clone(),
        }))
    }
}

struct MemoryOutput {
    key: String,
    buffer: String,
    store: OutputStore,
}

impl Outputable for MemoryOutput {
    fn write(&mut self, text: &str) -> SchedulerResult<()> {
        self.buffer.push_str(text);
        Ok(())
    }

    fn close(&mut self) -> SchedulerResult<()> {
        let text = std::mem::take(&mut self.buffer);
        self.store
            .lock()
            .entry(self.key.clone())
            .or_default()
            .push_str(&text);
        Ok(())
    }
}
