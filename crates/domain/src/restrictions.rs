//! 队列准入限制
//!
//! 可预测（predictable）的限制只依赖队列索引中的计数，可以按队列批量检查：
//! 一旦队首作业被拒绝，同队列后续作业也会被拒绝。

use std::fmt;
use std::sync::Arc;

use crate::entities::ProcessEntity;
use crate::indexes::ProcessIndexes;
use crate::queue::Queue;
use crate::SchedulerResult;

pub trait QueueRestriction: Send + Sync {
    /// 判断作业当前能否在 `queue` 中运行；不得有副作用
    fn can_run(
        &self,
        queue: &Queue,
        job: &ProcessEntity,
        indexes: &ProcessIndexes,
    ) -> SchedulerResult<bool>;

    fn is_predictable(&self) -> bool;

    /// 参与队列身份计算的描述
    fn describe(&self) -> String;
}

impl fmt::Debug for dyn QueueRestriction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// 运行中与等待中的作业总数小于上限
#[derive(Debug, Clone, Copy)]
pub struct MaxConcurrent {
    limit: usize,
}

impl MaxConcurrent {
    pub fn new(limit: usize) -> Self {
        Self { limit }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl QueueRestriction for MaxConcurrent {
    fn can_run(
        &self,
        queue: &Queue,
        _job: &ProcessEntity,
        indexes: &ProcessIndexes,
    ) -> SchedulerResult<bool> {
        Ok(indexes.active_count(queue.id()) < self.limit)
    }

    fn is_predictable(&self) -> bool {
        true
    }

    fn describe(&self) -> String {
        format!("max_concurrent({})", self.limit)
    }
}

/// 暂停的队列
#[derive(Debug, Clone, Copy, Default)]
pub struct Blocked;

impl QueueRestriction for Blocked {
    fn can_run(&self, _: &Queue, _: &ProcessEntity, _: &ProcessIndexes) -> SchedulerResult<bool> {
        Ok(false)
    }

    fn is_predictable(&self) -> bool {
        true
    }

    fn describe(&self) -> String {
        "blocked".to_string()
    }
}

pub struct AllOf {
    parts: Vec<Arc<dyn QueueRestriction>>,
}

impl AllOf {
    pub fn new(parts: Vec<Arc<dyn QueueRestriction>>) -> Self {
        Self { parts }
    }
}

impl QueueRestriction for AllOf {
    fn can_run(
        &self,
        queue: &Queue,
        job: &ProcessEntity,
        indexes: &ProcessIndexes,
    ) -> SchedulerResult<bool> {
        for part in &self.parts {
            if !part.can_run(queue, job, indexes)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn is_predictable(&self) -> bool {
        self.parts.iter().all(|p| p.is_predictable())
    }

    fn describe(&self) -> String {
        let parts: Vec<String> = self.parts.iter().map(|p| p.describe()).collect();
        format!("all_of({})", parts.join(","))
    }
}

type RestrictionFn =
    dyn Fn(&Queue, &ProcessEntity, &ProcessIndexes) -> SchedulerResult<bool> + Send + Sync;

/// 闭包形式的自定义限制
pub struct FnRestriction {
    name: String,
    predictable: bool,
    predicate: Box<RestrictionFn>,
}

impl FnRestriction {
    pub fn new<F>(name: impl Into<String>, predictable: bool, predicate: F) -> Self
    where
        F: Fn(&Queue, &ProcessEntity, &ProcessIndexes) -> SchedulerResult<bool>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            predictable,
            predicate: Box::new(predicate),
        }
    }
}

impl QueueRestriction for FnRestriction {
    fn can_run(
        &self,
        queue: &Queue,
        job: &ProcessEntity,
        indexes: &ProcessIndexes,
    ) -> SchedulerResult<bool> {
        (self.predicate)(queue, job, indexes)
    }

    fn is_predictable(&self) -> bool {
        self.predictable
    }

    fn describe(&self) -> String {
        format!("fn({})", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::ProcessStatus;
    use crate::occurrence::Occurrence;
    use crate::resilience::Resilience;
    use crate::SchedulerError;

    fn job(id: i64, status: ProcessStatus) -> ProcessEntity {
        let mut e = ProcessEntity::new(
            id,
            "owner",
            "q",
            format!("job-{id}"),
            Occurrence::immediate(),
            Resilience::default(),
        );
        e.status = status;
        e
    }

    #[test]
    fn test_max_concurrent_counts_running_and_waiting() {
        let queue = Queue::builder("q").build();
        let restriction = MaxConcurrent::new(2);
        let mut indexes = ProcessIndexes::new();
        let candidate = job(99, ProcessStatus::NotRun);

        indexes.add(&queue, &job(1, ProcessStatus::Running));
        assert!(restriction.can_run(&queue, &candidate, &indexes).unwrap());

        indexes.add(&queue, &job(2, ProcessStatus::Locked));
        assert!(!restriction.can_run(&queue, &candidate, &indexes).unwrap());

        indexes.add(&queue, &job(2, ProcessStatus::RunOk));
        assert!(restriction.can_run(&queue, &candidate, &indexes).unwrap());
    }

    #[test]
    fn test_all_of_predictability() {
        let predictable = AllOf::new(vec![Arc::new(MaxConcurrent::new(1)), Arc::new(Blocked)]);
        assert!(predictable.is_predictable());
        assert_eq!(predictable.describe(), "all_of(max_concurrent(1),blocked)");

        let custom = FnRestriction::new("weekday", false, |_, _, _| Ok(true));
        let mixed = AllOf::new(vec![Arc::new(MaxConcurrent::new(1)), Arc::new(custom)]);
        assert!(!mixed.is_predictable());
    }

    #[test]
    fn test_fn_restriction_propagates_errors() {
        let queue = Queue::builder("q").build();
        let failing = FnRestriction::new("boom", true, |q, _, _| {
            Err(SchedulerError::restriction(q.name(), "boom"))
        });
        let result = failing.can_run(&queue, &job(1, ProcessStatus::NotRun), &ProcessIndexes::new());
        assert!(matches!(result, Err(SchedulerError::Restriction { .. })));
    }
}
