//! 队列：可继承的不可变配置作用域
//!
//! 子队列未设置的属性沿父链继承。队列身份由自身及继承属性的规范字符串决定。

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::entities::ProcessEntity;
use crate::indexes::ProcessIndexes;
use crate::occurrence::Occurrence;
use crate::ports::{Access, AllowAllAccess, OutputProvider, PublicVisibility, Visibility};
use crate::resilience::Resilience;
use crate::restrictions::QueueRestriction;
use crate::{SchedulerError, SchedulerResult};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueId(String);

impl QueueId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub struct Queue {
    id: QueueId,
    name: String,
    parent: Option<Arc<Queue>>,
    restriction: Option<Arc<dyn QueueRestriction>>,
    occurrence: Option<Occurrence>,
    resilience: Option<Resilience>,
    visibility: Option<Arc<dyn Visibility>>,
    access: Option<Arc<dyn Access>>,
    output: Option<Arc<dyn OutputProvider>>,
    executor: Option<String>,
    persistent: Option<bool>,
    keep_completed: Option<bool>,
}

impl Queue {
    pub fn builder(name: impl Into<String>) -> QueueBuilder {
        QueueBuilder::new(name)
    }

    pub fn id(&self) -> &QueueId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<&Arc<Queue>> {
        self.parent.as_ref()
    }

    /// 自身及所有祖先，由近及远
    pub fn ancestors(&self) -> impl Iterator<Item = &Queue> {
        std::iter::successors(Some(self), |q| q.parent.as_deref())
    }

    pub fn restriction(&self) -> Option<&Arc<dyn QueueRestriction>> {
        self.restriction.as_ref()
    }

    pub fn occurrence(&self) -> Option<&Occurrence> {
        self.ancestors().find_map(|q| q.occurrence.as_ref())
    }

    pub fn resilience(&self) -> Option<&Resilience> {
        self.ancestors().find_map(|q| q.resilience.as_ref())
    }

    pub fn visibility(&self) -> Arc<dyn Visibility> {
        self.ancestors()
            .find_map(|q| q.visibility.clone())
            .unwrap_or_else(|| Arc::new(PublicVisibility))
    }

    pub fn access(&self) -> Arc<dyn Access> {
        self.ancestors()
            .find_map(|q| q.access.clone())
            .unwrap_or_else(|| Arc::new(AllowAllAccess))
    }

    pub fn output_provider(&self) -> Option<Arc<dyn OutputProvider>> {
        self.ancestors().find_map(|q| q.output.clone())
    }

    pub fn executor(&self) -> Option<&str> {
        self.ancestors().find_map(|q| q.executor.as_deref())
    }

    pub fn persistent(&self) -> Option<bool> {
        self.ancestors().find_map(|q| q.persistent)
    }

    pub fn keep_completed(&self) -> Option<bool> {
        self.ancestors().find_map(|q| q.keep_completed)
    }

    /// 沿父链检查所有限制
    pub fn can_run(&self, job: &ProcessEntity, indexes: &ProcessIndexes) -> SchedulerResult<bool> {
        for queue in self.ancestors() {
            let Some(restriction) = &queue.restriction else {
                continue;
            };
            let allowed = restriction
                .can_run(queue, job, indexes)
                .map_err(|e| match e {
                    SchedulerError::Restriction { .. } => e,
                    other => SchedulerError::restriction(queue.name(), other.to_string()),
                })?;
            if !allowed {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// 整条父链上的限制都可预测
    pub fn is_predictable(&self) -> bool {
        self.ancestors().all(|q| {
            q.restriction
                .as_ref()
                .map_or(true, |r| r.is_predictable())
        })
    }

    fn canonical(&self) -> String {
        let mut parts = vec![format!("name={}", self.name)];
        if let Some(r) = &self.restriction {
            parts.push(format!("restriction={}", r.describe()));
        }
        if let Some(o) = &self.occurrence {
            parts.push(format!("occurrence={}", o.canonical()));
        }
        if let Some(r) = &self.resilience {
            let failure = r
                .failure_occurrence()
                .map(Occurrence::canonical)
                .unwrap_or_default();
            parts.push(format!("resilience={:?}/{failure}", r.policy()));
        }
        if let Some(v) = &self.visibility {
            parts.push(format!("visibility={}", v.name()));
        }
        if let Some(a) = &self.access {
            parts.push(format!("access={}", a.name()));
        }
        if let Some(o) = &self.output {
            parts.push(format!("output={}", o.name()));
        }
        if let Some(e) = &self.executor {
            parts.push(format!("executor={e}"));
        }
        if let Some(p) = self.persistent {
            parts.push(format!("persistent={p}"));
        }
        if let Some(k) = self.keep_completed {
            parts.push(format!("keep_completed={k}"));
        }

        let own = format!("{{{}}}", parts.join(","));
        match &self.parent {
            Some(parent) => format!("{}/{own}", parent.id),
            None => own,
        }
    }
}

impl PartialEq for Queue {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Queue {}

impl Hash for Queue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("id", &self.id)
            .finish()
    }
}

pub struct QueueBuilder {
    name: String,
    parent: Option<Arc<Queue>>,
    restriction: Option<Arc<dyn QueueRestriction>>,
    occurrence: Option<Occurrence>,
    resilience: Option<Resilience>,
    visibility: Option<Arc<dyn Visibility>>,
    access: Option<Arc<dyn Access>>,
    output: Option<Arc<dyn OutputProvider>>,
    executor: Option<String>,
    persistent: Option<bool>,
    keep_completed: Option<bool>,
}

impl QueueBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: None,
            restriction: None,
            occurrence: None,
            resilience: None,
            visibility: None,
            access: None,
            output: None,
            executor: None,
            persistent: None,
            keep_completed: None,
        }
    }

    pub fn parent(mut self, parent: Arc<Queue>) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn restriction(mut self, restriction: impl QueueRestriction + 'static) -> Self {
        self.restriction = Some(Arc::new(restriction));
        self
    }

    pub fn shared_restriction(mut self, restriction: Arc<dyn QueueRestriction>) -> Self {
        self.restriction = Some(restriction);
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
        self.visibility = Some(visibility);
        self
    }

    pub fn access(mut self, access: Arc<dyn Access>) -> Self {
        self.access = Some(access);
        self
    }

    pub fn output(mut self, output: Arc<dyn OutputProvider>) -> Self {
        self.output = Some(output);
        self
    }

    pub fn executor(mut self, executor: impl Into<String>) -> Self {
        self.executor = Some(executor.into());
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

    pub fn build(self) -> Queue {
        let mut queue = Queue {
            id: QueueId(String::new()),
            name: self.name,
            parent: self.parent,
            restriction: self.restriction,
            occurrence: self.occurrence,
            resilience: self.resilience,
            visibility: self.visibility,
            access: self.access,
            output: self.output,
            executor: self.executor,
            persistent: self.persistent,
            keep_completed: self.keep_completed,
        };
        queue.id = QueueId(queue.canonical());
        queue
    }
}
