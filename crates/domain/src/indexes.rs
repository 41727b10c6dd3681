//! 作业索引：按 (队列, 状态分桶) 维护有序的作业键集合
//!
//! 作业同时登记在自身队列及其所有祖先队列下，供队列限制统计使用。
//! 索引只是派生数据，可由作业记录完全重建。

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::entities::{ProcessEntity, ProcessKey};
use crate::queue::{Queue, QueueId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    /// 空闲：未运行、已完成或等待下一次运行
    NotRun,
    Running,
    /// 已准入，尚未开始执行
    Waiting,
    Failed,
}

impl IndexKind {
    pub const ALL: [IndexKind; 4] = [
        IndexKind::NotRun,
        IndexKind::Running,
        IndexKind::Waiting,
        IndexKind::Failed,
    ];
}

#[derive(Debug, Clone)]
struct Membership {
    queues: Vec<QueueId>,
    kind: IndexKind,
}

#[derive(Debug, Default)]
pub struct ProcessIndexes {
    buckets: HashMap<(QueueId, IndexKind), BTreeSet<ProcessKey>>,
    members: HashMap<ProcessKey, Membership>,
}

impl ProcessIndexes {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按作业当前状态登记；已登记的先移除
    pub fn add(&mut self, queue: &Queue, entity: &ProcessEntity) {
        let key = entity.key();
        self.remove(&key);

        let Some(kind) = entity.index_kind() else {
            return;
        };
        let queues: Vec<QueueId> = queue.ancestors().map(|q| q.id().clone()).collect();
        for queue_id in &queues {
            self.buckets
                .entry((queue_id.clone(), kind))
                .or_default()
                .insert(key.clone());
        }
        self.members.insert(key, Membership { queues, kind });
    }

    pub fn remove(&mut self, key: &ProcessKey) -> Option<IndexKind> {
        let membership = self.members.remove(key)?;
        for queue_id in membership.queues {
            let bucket_key = (queue_id, membership.kind);
            if let Some(bucket) = self.buckets.get_mut(&bucket_key) {
                bucket.remove(key);
                if bucket.is_empty() {
                    self.buckets.remove(&bucket_key);
                }
            }
        }
        Some(membership.kind)
    }

    pub fn count(&self, queue: &QueueId, kind: IndexKind) -> usize {
        self.buckets
            .get(&(queue.clone(), kind))
            .map_or(0, BTreeSet::len)
    }

    /// 正在运行与等待执行的作业数
    pub fn active_count(&self, queue: &QueueId) -> usize {
        self.count(queue, IndexKind::Running) + self.count(queue, IndexKind::Waiting)
    }

    pub fn keys(&self, queue: &QueueId, kind: IndexKind) -> Vec<ProcessKey> {
        self.buckets
            .get(&(queue.clone(), kind))
            .map(|bucket| bucket.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn kind_of(&self, key: &ProcessKey) -> Option<IndexKind> {
        self.members.get(key).map(|m| m.kind)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
        self.members.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::ProcessStatus;
    use crate::occurrence::Occurrence;
    use crate::resilience::Resilience;
    use std::sync::Arc;

    fn job(id: i64, queue: &Queue) -> ProcessEntity {
        ProcessEntity::new(
            id,
            "owner",
            queue.name(),
            format!("job-{id}"),
            Occurrence::immediate(),
            Resilience::default(),
        )
    }

    #[test]
    fn test_indexed_under_ancestors() {
        let root = Arc::new(Queue::builder("root").build());
        let child = Queue::builder("child").parent(root.clone()).build();

        let mut indexes = ProcessIndexes::new();
        let mut e = job(1, &child);
        e.status = ProcessStatus::Running;
        indexes.add(&child, &e);

        assert_eq!(indexes.count(child.id(), IndexKind::Running), 1);
        assert_eq!(indexes.count(root.id(), IndexKind::Running), 1);
        assert_eq!(indexes.active_count(root.id()), 1);
    }

    #[test]
    fn test_reindex_moves_between_buckets() {
        let queue = Queue::builder("q").build();
        let mut indexes = ProcessIndexes::new();
        let mut e = job(1, &queue);
        indexes.add(&queue, &e);
        assert_eq!(indexes.kind_of(&e.key()), Some(IndexKind::NotRun));

        e.status = ProcessStatus::Locked;
        indexes.add(&queue, &e);
        assert_eq!(indexes.count(queue.id(), IndexKind::NotRun), 0);
        assert_eq!(indexes.count(queue.id(), IndexKind::Waiting), 1);

        e.status = ProcessStatus::Deleted;
        indexes.add(&queue, &e);
        assert!(indexes.is_empty());
    }

    #[test]
    fn test_keys_are_ordered() {
        let queue = Queue::builder("q").build();
        let mut indexes = ProcessIndexes::new();
        let first = job(1, &queue);
        let mut second = job(2, &queue);
        second.created_at = first.created_at + chrono::Duration::seconds(1);
        indexes.add(&queue, &second);
        indexes.add(&queue, &first);

        let keys = indexes.keys(queue.id(), IndexKind::NotRun);
        assert_eq!(keys, vec![first.key(), second.key()]);
        assert_eq!(indexes.remove(&first.key()), Some(IndexKind::NotRun));
        assert_eq!(indexes.remove(&first.key()), None);
    }
}
