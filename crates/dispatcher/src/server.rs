use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobqueue_core::{SchedulerError, SchedulerResult};
use jobqueue_domain::{
    IndexKind, ProcessEntity, ProcessIndexes, ProcessKey, ProcessStatus, QueueId,
};
use jobqueue_infrastructure::StructuredLogger;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use crate::context::EngineContext;
use crate::executor;
use crate::handle::ProcessHandle;
use crate::runner::{self, ProcessRunner, UnparkOutcome};
use crate::scheduler::ProcessScheduler;
use crate::transaction::Transaction;
use crate::unpark::UnparkCoordinator;
use crate::wrapper::{ProcessPolicies, ProcessWrapper};

/// 通过准入、等待交给执行器的作业
pub(crate) struct AdmittedRun {
    pub(crate) wrapper: Arc<ProcessWrapper>,
    pub(crate) runner: Arc<ProcessRunner>,
}

/// 一轮唤醒检查中准入的作业，批次释放时全部交给执行器
///
/// 检查中途返回或 panic 时已锁定的作业同样会被启动。
pub(crate) struct AdmittedBatch {
    server: Arc<ProcessServer>,
    runs: Vec<AdmittedRun>,
}

impl AdmittedBatch {
    pub(crate) fn new(server: Arc<ProcessServer>) -> Self {
        Self {
            server,
            runs: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, run: AdmittedRun) {
        self.runs.push(run);
    }
}

impl Drop for AdmittedBatch {
    fn drop(&mut self) {
        for run in self.runs.drain(..) {
            self.server.spawn_execution(run);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatistics {
    pub not_run: usize,
    pub running: usize,
    pub waiting: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerStatistics {
    pub owner: String,
    pub processes: usize,
    pub parked: usize,
    /// 按队列名称汇总，父队列包含子队列的作业
    pub queues: BTreeMap<String, QueueStatistics>,
}

/// 一个队列所有者名下的作业服务器
///
/// 持有该所有者的全部作业、各队列的状态索引和唤醒调度。准入检查在
/// `admission` 锁内串行进行，保证限制判断看到的索引与提交结果一致。
pub struct ProcessServer {
    owner: String,
    context: Arc<EngineContext>,
    pub(crate) processes: RwLock<BTreeMap<ProcessKey, Arc<ProcessWrapper>>>,
    pub(crate) indexes: RwLock<ProcessIndexes>,
    admission: AsyncMutex<()>,
    scheduler: Arc<ProcessScheduler>,
    coordinator: UnparkCoordinator,
    executions: TaskTracker,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
    self_ref: Weak<ProcessServer>,
}

impl ProcessServer {
    pub(crate) fn new(owner: impl Into<String>, context: Arc<EngineContext>) -> Arc<Self> {
        let owner = owner.into();
        let shutdown = context.shutdown.child_token();
        let (sender, receiver) = mpsc::unbounded_channel();
        let scheduler = ProcessScheduler::new(
            context.config.scheduler.max_sleep(),
            sender.clone(),
            shutdown.clone(),
        );
        let permits = Arc::new(Semaphore::new(context.config.execution.max_concurrent_runs));

        let server = Arc::new_cyclic(|self_ref| Self {
            owner,
            context,
            processes: RwLock::new(BTreeMap::new()),
            indexes: RwLock::new(ProcessIndexes::new()),
            admission: AsyncMutex::new(()),
            scheduler,
            coordinator: UnparkCoordinator::new(sender),
            executions: TaskTracker::new(),
            permits,
            shutdown: shutdown.clone(),
            self_ref: self_ref.clone(),
        });
        UnparkCoordinator::spawn(Arc::downgrade(&server), receiver, shutdown);
        server
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.context
    }

    pub fn scheduler(&self) -> &Arc<ProcessScheduler> {
        &self.scheduler
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub(crate) fn admission(&self) -> &AsyncMutex<()> {
        &self.admission
    }

    pub(crate) fn permits(&self) -> &Arc<Semaphore> {
        &self.permits
    }

    pub fn contains(&self, key: &ProcessKey) -> bool {
        self.processes.read().contains_key(key)
    }

    pub fn get(&self, key: &ProcessKey) -> Option<Arc<ProcessWrapper>> {
        self.processes.read().get(key).cloned()
    }

    pub fn find_by_id(&self, id: i64) -> Option<Arc<ProcessWrapper>> {
        self.processes
            .read()
            .values()
            .find(|wrapper| wrapper.id() == id)
            .cloned()
    }

    /// 按键排序的作业列表
    pub fn processes(&self) -> Vec<Arc<ProcessWrapper>> {
        self.processes.read().values().cloned().collect()
    }

    /// 按键顺序返回全部作业的句柄
    pub fn handles(self: &Arc<Self>) -> Vec<ProcessHandle> {
        self.processes()
            .into_iter()
            .map(|wrapper| ProcessHandle::new(self.clone(), wrapper))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.processes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.read().is_empty()
    }

    pub fn count(&self, queue: &QueueId, kind: IndexKind) -> usize {
        self.indexes.read().count(queue, kind)
    }

    pub(crate) fn attach_wrapper(&self, wrapper: &Arc<ProcessWrapper>) {
        let mut indexes = self.indexes.write();
        self.processes
            .write()
            .insert(wrapper.key().clone(), wrapper.clone());
        wrapper.with_entity(|entity| indexes.add(wrapper.queue(), entity));
    }

    pub(crate) fn detach_wrapper(&self, wrapper: &Arc<ProcessWrapper>) {
        let mut indexes = self.indexes.write();
        self.processes.write().remove(wrapper.key());
        indexes.remove(wrapper.key());
    }

    /// 修改记录并保持索引同步；不在服务器中的作业只修改不索引
    pub(crate) fn mutate_indexed<R>(
        &self,
        wrapper: &Arc<ProcessWrapper>,
        mutation: impl FnOnce(&mut ProcessEntity) -> R,
    ) -> R {
        let mut indexes = self.indexes.write();
        let present = self.processes.read().contains_key(wrapper.key());
        let mut entity = wrapper.entity_mut();
        indexes.remove(wrapper.key());
        let result = mutation(&mut entity);
        if present {
            indexes.add(wrapper.queue(), &entity);
        }
        result
    }

    /// 重新检查所有停放中的作业
    pub fn notify_all(&self) {
        let keys = self.scheduler.parked_keys();
        self.context.metrics.set_parked(keys.len());
        if !keys.is_empty() {
            self.coordinator.notify(keys);
        }
    }

    /// 被限制挡下的作业稍后再试，不早于原定唤醒时间
    pub(crate) fn defer(&self, wrapper: &Arc<ProcessWrapper>, runner: &ProcessRunner) {
        let interval = chrono::Duration::from_std(self.context.config.scheduler.renotify_interval())
            .unwrap_or_else(|_| chrono::Duration::seconds(1));
        let retry_at = Utc::now() + interval;
        let at = runner.wake_at().max(retry_at);
        self.scheduler.snooze(wrapper.key(), at);
    }

    pub(crate) fn spawn_execution(self: &Arc<Self>, run: AdmittedRun) {
        let server = self.clone();
        self.executions
            .spawn(async move { executor::execute(server, run.wrapper, run.runner).await });
    }

    /// 一轮唤醒检查
    ///
    /// 限制不可预测的队列逐个检查并立即启动；可预测队列按键顺序检查，一旦有作业
    /// 被挡下，同队列中排在后面的作业直接延后，不再检查，等到下一次
    /// [`notify_all`](Self::notify_all) 或延后时间到达时重新检查。本轮准入的作业在
    /// 检查结束后统一启动。
    pub(crate) async fn unpark_cycle(self: &Arc<Self>, pending: BTreeSet<ProcessKey>) {
        let mut groups: BTreeMap<QueueId, Vec<Arc<ProcessWrapper>>> = BTreeMap::new();
        let mut batch = AdmittedBatch::new(self.clone());

        for key in pending {
            let Some(wrapper) = self.get(&key) else {
                self.scheduler.unschedule(&key);
                continue;
            };
            if wrapper.queue().is_predictable() {
                groups
                    .entry(wrapper.queue().id().clone())
                    .or_default()
                    .push(wrapper);
                continue;
            }
            if let Err(e) = runner::unpark(self, &wrapper, None).await {
                error!("作业 {} 唤醒检查失败: {}", key, e);
            }
        }

        for (queue, wrappers) in groups {
            let mut remaining = wrappers.into_iter();
            while let Some(wrapper) = remaining.next() {
                match runner::unpark(self, &wrapper, Some(&mut batch)).await {
                    Ok(UnparkOutcome::Restricted) => {
                        debug!("队列 {} 已满，本轮剩余作业延后", queue);
                        for deferred in remaining.by_ref() {
                            self.defer_parked(&deferred);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => error!("作业 {} 唤醒检查失败: {}", wrapper.key(), e),
                }
            }
        }
        drop(batch);
    }

    fn defer_parked(&self, wrapper: &Arc<ProcessWrapper>) {
        let Some(runner) = wrapper.runner() else {
            return;
        };
        if runner.is_used() || wrapper.with_entity(ProcessEntity::is_failed) {
            return;
        }
        self.defer(wrapper, &runner);
    }

    /// 在事务中执行修改
    ///
    /// `mutation` 返回 [`SchedulerError::RollbackRequested`] 时事务被静默回滚，结果为
    /// `Ok(None)`。提交成功后依次执行 `post_commit` 和对 `start` 作业的重新调度。
    pub async fn do_transaction<R, M, P>(
        self: &Arc<Self>,
        durable: bool,
        mutation: M,
        post_commit: P,
        start: Option<&Arc<ProcessWrapper>>,
    ) -> SchedulerResult<Option<R>>
    where
        R: Send,
        M: FnOnce(&mut Transaction) -> SchedulerResult<R> + Send,
        P: FnOnce(&R) + Send,
    {
        let mut transaction = Transaction::begin(&self.context, durable).await?;
        let value = match mutation(&mut transaction) {
            Ok(value) => value,
            Err(SchedulerError::RollbackRequested) => {
                transaction.rollback(None).await;
                return Ok(None);
            }
            Err(e) => {
                transaction.rollback(Some(&e.to_string())).await;
                return Err(e);
            }
        };
        transaction.commit().await?;
        post_commit(&value);
        if let Some(wrapper) = start {
            wrapper.reschedule();
        }
        Ok(Some(value))
    }

    /// 加载仓储中属于本所有者的作业
    ///
    /// 上次停在运行中或已锁定的作业视为中断，记一次失败尝试后按重试计划调度。
    #[instrument(skip(self), fields(owner = %self.owner))]
    pub(crate) async fn init(self: &Arc<Self>) -> SchedulerResult<()> {
        let records = self.context.repository.find(&self.owner).await?;
        let now = Utc::now();
        let mut wrappers = Vec::with_capacity(records.len());
        let (mut orphaned, mut unscheduled) = (0usize, 0usize);

        for mut entity in records {
            if entity.status == ProcessStatus::Deleted {
                continue;
            }
            let Some(queue) = self.context.queues.get(&entity.queue_name) else {
                warn!(
                    "作业 {} 所属队列 {} 未登记，跳过加载",
                    entity.key(),
                    entity.queue_name
                );
                unscheduled += 1;
                continue;
            };
            let definition = entity
                .work_key
                .as_deref()
                .and_then(|key| self.context.works.get(key));
            if definition.is_none() {
                warn!("作业 {} 没有已登记的作业定义，不会被调度", entity.key());
                unscheduled += 1;
            }
            if matches!(entity.status, ProcessStatus::Running | ProcessStatus::Locked) {
                entity.orphaned = true;
                orphaned += 1;
            }
            wrappers.push(Arc::new(ProcessWrapper::new(
                entity,
                queue,
                definition,
                ProcessPolicies::default(),
                self.self_ref.clone(),
            )));
        }

        self.do_transaction(
            true,
            |tx| {
                for wrapper in &wrappers {
                    tx.adopt(self, wrapper);
                    if wrapper.with_entity(|e| e.orphaned) {
                        tx.update(self, wrapper, |e| e.record_failure(now));
                    }
                }
                Ok(())
            },
            |_| {},
            None,
        )
        .await?;

        StructuredLogger::log_rehydration(&self.owner, wrappers.len(), orphaned, unscheduled);
        for wrapper in &wrappers {
            wrapper.start();
        }
        Ok(())
    }

    pub fn statistics(&self) -> ServerStatistics {
        let wrappers = self.processes();
        let mut queues = BTreeMap::new();
        {
            let indexes = self.indexes.read();
            for wrapper in &wrappers {
                for queue in wrapper.queue().ancestors() {
                    queues.entry(queue.name().to_string()).or_insert_with(|| {
                        QueueStatistics {
                            not_run: indexes.count(queue.id(), IndexKind::NotRun),
                            running: indexes.count(queue.id(), IndexKind::Running),
                            waiting: indexes.count(queue.id(), IndexKind::Waiting),
                            failed: indexes.count(queue.id(), IndexKind::Failed),
                        }
                    });
                }
            }
        }
        ServerStatistics {
            owner: self.owner.clone(),
            processes: wrappers.len(),
            parked: self.scheduler.parked_count(),
            queues,
        }
    }

    /// 最近一个停放作业的唤醒时间
    pub fn next_wake(&self) -> Option<DateTime<Utc>> {
        self.processes()
            .iter()
            .filter_map(|wrapper| self.scheduler.wake_time(wrapper.key()))
            .min()
    }

    /// 停止调度并等待运行中的作业结束，超时返回 false
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        info!("作业服务器 {} 开始关闭", self.owner);
        self.shutdown.cancel();
        self.executions.close();
        let finished = tokio::time::timeout(timeout, self.executions.wait())
            .await
            .is_ok();
        if finished {
            info!("作业服务器 {} 已关闭", self.owner);
        } else {
            warn!(
                "作业服务器 {} 关闭超时，仍有 {} 个作业在运行",
                self.owner,
                self.executions.len()
            );
        }
        finished
    }
}
