use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use jobqueue_core::{SchedulerError, SchedulerResult};
use jobqueue_domain::entities::ProcessEntity;
use jobqueue_domain::repositories::ProcessRepository;
use tokio::sync::RwLock;
use tracing::debug;

/// 内存作业仓储
///
/// 记录以 JSON 形式保存，读取时重新反序列化，行为与外部存储一致
/// （例如不持久化的字段在重新加载后恢复默认值）。
#[derive(Debug)]
pub struct InMemoryProcessRepository {
    records: RwLock<BTreeMap<i64, serde_json::Value>>,
    next_id: AtomicI64,
    next_transient_id: AtomicI64,
}

impl InMemoryProcessRepository {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            next_id: AtomicI64::new(1),
            next_transient_id: AtomicI64::new(-1),
        }
    }

    /// 预置记录，用于模拟进程重启后的加载
    pub fn with_records(records: Vec<ProcessEntity>) -> SchedulerResult<Self> {
        let max_id = records.iter().map(|r| r.id).max().unwrap_or(0);
        let mut stored = BTreeMap::new();
        for record in records {
            stored.insert(record.id, serde_json::to_value(&record)?);
        }
        Ok(Self {
            records: RwLock::new(stored),
            next_id: AtomicI64::new(max_id.max(0) + 1),
            next_transient_id: AtomicI64::new(-1),
        })
    }

    pub async fn get(&self, id: i64) -> SchedulerResult<Option<ProcessEntity>> {
        let records = self.records.read().await;
        records
            .get(&id)
            .map(|value| serde_json::from_value(value.clone()))
            .transpose()
            .map_err(Into::into)
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

impl Default for InMemoryProcessRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessRepository for InMemoryProcessRepository {
    async fn find(&self, queue_owner: &str) -> SchedulerResult<Vec<ProcessEntity>> {
        let records = self.records.read().await;
        let mut found = Vec::new();
        for value in records.values() {
            let entity: ProcessEntity = serde_json::from_value(value.clone())?;
            if entity.queue_owner == queue_owner {
                found.push(entity);
            }
        }
        found.sort_by_key(ProcessEntity::key);
        debug!("加载作业记录: owner={}, count={}", queue_owner, found.len());
        Ok(found)
    }

    async fn persist(&self, entity: &ProcessEntity) -> SchedulerResult<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&entity.id) {
            return Err(SchedulerError::persistence(format!(
                "作业记录已存在: {}",
                entity.id
            )));
        }
        records.insert(entity.id, serde_json::to_value(entity)?);
        Ok(())
    }

    async fn update(&self, entity: &ProcessEntity) -> SchedulerResult<()> {
        let mut records = self.records.write().await;
        match records.get_mut(&entity.id) {
            Some(slot) => {
                *slot = serde_json::to_value(entity)?;
                Ok(())
            }
            None => Err(SchedulerError::persistence(format!(
                "作业记录不存在: {}",
                entity.id
            ))),
        }
    }

    async fn remove(&self, entity: &ProcessEntity) -> SchedulerResult<()> {
        self.records.write().await.remove(&entity.id);
        Ok(())
    }

    async fn next_id(&self) -> SchedulerResult<i64> {
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn next_transient_id(&self) -> SchedulerResult<i64> {
        Ok(self.next_transient_id.fetch_sub(1, Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobqueue_domain::{Occurrence, ProcessStatus, Resilience};

    fn entity(id: i64, owner: &str) -> ProcessEntity {
        ProcessEntity::new(
            id,
            owner,
            "q",
            format!("job-{id}"),
            Occurrence::immediate(),
            Resilience::default(),
        )
    }

    #[tokio::test]
    async fn test_persist_update_remove() {
        let repo = InMemoryProcessRepository::new();
        let mut e = entity(1, "a");
        repo.persist(&e).await.unwrap();
        assert!(repo.persist(&e).await.is_err());

        e.status = ProcessStatus::RunOk;
        repo.update(&e).await.unwrap();
        assert_eq!(repo.get(1).await.unwrap().unwrap().status, ProcessStatus::RunOk);

        repo.remove(&e).await.unwrap();
        assert!(repo.is_empty().await);
        assert!(matches!(
            repo.update(&e).await,
            Err(SchedulerError::Persistence(_))
        ));
    }

    #[tokio::test]
    async fn test_find_filters_by_owner_and_drops_transient_fields() {
        let mut orphan = entity(2, "a");
        orphan.orphaned = true;
        let repo =
            InMemoryProcessRepository::with_records(vec![entity(1, "a"), orphan, entity(3, "b")])
                .unwrap();

        let found = repo.find("a").await.unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|e| !e.orphaned));
        assert_eq!(repo.next_id().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_id_sequences() {
        let repo = InMemoryProcessRepository::new();
        assert_eq!(repo.next_id().await.unwrap(), 1);
        assert_eq!(repo.next_id().await.unwrap(), 2);
        assert_eq!(repo.next_transient_id().await.unwrap(), -1);
        assert_eq!(repo.next_transient_id().await.unwrap(), -2);
    }
}
