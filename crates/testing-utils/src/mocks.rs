//! Mock implementations of the persistence ports
//!
//! Both doubles keep everything in memory and record the calls they receive so
//! tests can assert on what was written and when a transaction was closed.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use jobqueue_core::{SchedulerError, SchedulerResult};
use jobqueue_domain::entities::ProcessEntity;
use jobqueue_domain::repositories::{ProcessRepository, TransactionRuntime, TransactionToken};
use parking_lot::Mutex;

/// One call received by [`MockProcessRepository`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepositoryCall {
    Find(String),
    Persist(i64),
    Update(i64),
    Remove(i64),
}

/// Mock implementation of ProcessRepository for testing
#[derive(Debug, Clone)]
pub struct MockProcessRepository {
    records: Arc<Mutex<BTreeMap<i64, ProcessEntity>>>,
    calls: Arc<Mutex<Vec<RepositoryCall>>>,
    fail_writes: Arc<AtomicBool>,
    next_id: Arc<AtomicI64>,
    next_transient_id: Arc<AtomicI64>,
}

impl MockProcessRepository {
    pub fn new() -> Self {
        Self {
            records: Arc::new(Mutex::new(BTreeMap::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            fail_writes: Arc::new(AtomicBool::new(false)),
            next_id: Arc::new(AtomicI64::new(1)),
            next_transient_id: Arc::new(AtomicI64::new(-1)),
        }
    }

    pub fn with_records(records: Vec<ProcessEntity>) -> Self {
        let repository = Self::new();
        let max_id = records.iter().map(|r| r.id).max().unwrap_or(0);
        repository.next_id.store(max_id.max(0) + 1, Ordering::SeqCst);
        {
            let mut stored = repository.records.lock();
            for record in records {
                stored.insert(record.id, record);
            }
        }
        repository
    }

    /// Make every following persist/update/remove fail
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn get(&self, id: i64) -> Option<ProcessEntity> {
        self.records.lock().get(&id).cloned()
    }

    pub fn count(&self) -> usize {
        self.records.lock().len()
    }

    pub fn calls(&self) -> Vec<RepositoryCall> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    fn check_writable(&self) -> SchedulerResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SchedulerError::persistence("injected write failure"));
        }
        Ok(())
    }
}

impl Default for MockProcessRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessRepository for MockProcessRepository {
    async fn find(&self, queue_owner: &str) -> SchedulerResult<Vec<ProcessEntity>> {
        self.calls
            .lock()
            .push(RepositoryCall::Find(queue_owner.to_string()));
        let mut found: Vec<ProcessEntity> = self
            .records
            .lock()
            .values()
            .filter(|r| r.queue_owner == queue_owner)
            .cloned()
            .map(|mut r| {
                r.orphaned = false;
                r
            })
            .collect();
        found.sort_by_key(ProcessEntity::key);
        Ok(found)
    }

    async fn persist(&self, entity: &ProcessEntity) -> SchedulerResult<()> {
        self.calls.lock().push(RepositoryCall::Persist(entity.id));
        self.check_writable()?;
        let mut records = self.records.lock();
        if records.contains_key(&entity.id) {
            return Err(SchedulerError::persistence(format!(
                "duplicate record {}",
                entity.id
            )));
        }
        records.insert(entity.id, entity.clone());
        Ok(())
    }

    async fn update(&self, entity: &ProcessEntity) -> SchedulerResult<()> {
        self.calls.lock().push(RepositoryCall::Update(entity.id));
        self.check_writable()?;
        let mut records = self.records.lock();
        match records.get_mut(&entity.id) {
            Some(slot) => {
                *slot = entity.clone();
                Ok(())
            }
            None => Err(SchedulerError::persistence(format!(
                "missing record {}",
                entity.id
            ))),
        }
    }

    async fn remove(&self, entity: &ProcessEntity) -> SchedulerResult<()> {
        self.calls.lock().push(RepositoryCall::Remove(entity.id));
        self.check_writable()?;
        self.records.lock().remove(&entity.id);
        Ok(())
    }

    async fn next_id(&self) -> SchedulerResult<i64> {
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn next_transient_id(&self) -> SchedulerResult<i64> {
        Ok(self.next_transient_id.fetch_sub(1, Ordering::SeqCst))
    }
}

/// Transaction runtime that counts begin/commit/rollback calls
#[derive(Debug, Default)]
pub struct RecordingTransactionRuntime {
    sequence: AtomicU64,
    begun: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
    fail_commits: AtomicBool,
}

impl RecordingTransactionRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    pub fn begun(&self) -> u64 {
        self.begun.load(Ordering::SeqCst)
    }

    pub fn committed(&self) -> u64 {
        self.committed.load(Ordering::SeqCst)
    }

    pub fn rolled_back(&self) -> u64 {
        self.rolled_back.load(Ordering::SeqCst)
    }

    /// Transactions begun but not yet closed
    pub fn open(&self) -> u64 {
        self.begun() - self.committed() - self.rolled_back()
    }
}

#[async_trait]
impl TransactionRuntime for RecordingTransactionRuntime {
    async fn begin(&self, durable: bool) -> SchedulerResult<TransactionToken> {
        self.begun.fetch_add(1, Ordering::SeqCst);
        let id = self.sequence.fetch_add(1, Ordering::SeqCst);
        Ok(TransactionToken {
            id: format!("tx-{id}"),
            durable,
        })
    }

    async fn commit(&self, _token: &TransactionToken) -> SchedulerResult<()> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(SchedulerError::transaction("injected commit failure"));
        }
        self.committed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self, _token: &TransactionToken) -> SchedulerResult<()> {
        self.rolled_back.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
