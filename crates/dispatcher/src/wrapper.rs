use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobqueue_domain::ports::{Access, OutputProvider, Visibility};
use jobqueue_domain::{ProcessDefinition, ProcessEntity, ProcessKey, Queue};
use jobqueue_infrastructure::StructuredLogger;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::trace;

use crate::runner::ProcessRunner;
use crate::server::ProcessServer;

/// 作业级别的策略覆盖，未设置时使用队列上的策略
#[derive(Clone, Default)]
pub struct ProcessPolicies {
    pub visibility: Option<Arc<dyn Visibility>>,
    pub access: Option<Arc<dyn Access>>,
    pub output: Option<Arc<dyn OutputProvider>>,
}

#[derive(Default)]
struct WrapperState {
    runner: Option<Arc<ProcessRunner>>,
    reschedule_required: bool,
}

/// 服务器中一个作业的运行时外壳
///
/// 锁顺序：服务器索引 -> 服务器作业表 -> `state` -> `entity`。
pub struct ProcessWrapper {
    key: ProcessKey,
    queue: Arc<Queue>,
    definition: Option<Arc<ProcessDefinition>>,
    policies: ProcessPolicies,
    entity: Mutex<ProcessEntity>,
    state: Mutex<WrapperState>,
    deleted: AtomicBool,
    cycle: watch::Sender<u64>,
    server: Weak<ProcessServer>,
}

impl ProcessWrapper {
    pub(crate) fn new(
        entity: ProcessEntity,
        queue: Arc<Queue>,
        definition: Option<Arc<ProcessDefinition>>,
        policies: ProcessPolicies,
        server: Weak<ProcessServer>,
    ) -> Self {
        let (cycle, _) = watch::channel(0);
        Self {
            key: entity.key(),
            queue,
            definition,
            policies,
            entity: Mutex::new(entity),
            state: Mutex::new(WrapperState::default()),
            deleted: AtomicBool::new(false),
            cycle,
            server,
        }
    }

    pub fn key(&self) -> &ProcessKey {
        &self.key
    }

    pub fn id(&self) -> i64 {
        self.key.id
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    /// 没有可执行定义的作业（重新加载时未找到登记的定义）永远不会被调度
    pub fn definition(&self) -> Option<&Arc<ProcessDefinition>> {
        self.definition.as_ref()
    }

    pub fn visibility(&self) -> Arc<dyn Visibility> {
        self.policies
            .visibility
            .clone()
            .unwrap_or_else(|| self.queue.visibility())
    }

    pub fn access(&self) -> Arc<dyn Access> {
        self.policies
            .access
            .clone()
            .unwrap_or_else(|| self.queue.access())
    }

    pub fn output_provider(&self) -> Option<Arc<dyn OutputProvider>> {
        self.policies
            .output
            .clone()
            .or_else(|| self.queue.output_provider())
    }

    pub fn snapshot(&self) -> ProcessEntity {
        self.entity.lock().clone()
    }

    pub fn with_entity<R>(&self, f: impl FnOnce(&ProcessEntity) -> R) -> R {
        f(&self.entity.lock())
    }

    /// 直接修改记录；只允许事务使用，键字段不得修改
    pub(crate) fn entity_mut(&self) -> parking_lot::MutexGuard<'_, ProcessEntity> {
        self.entity.lock()
    }

    pub(crate) fn replace_entity(&self, entity: ProcessEntity) {
        *self.entity.lock() = entity;
    }

    pub fn runner(&self) -> Option<Arc<ProcessRunner>> {
        self.state.lock().runner.clone()
    }

    pub fn has_runner(&self) -> bool {
        self.state.lock().runner.is_some()
    }

    pub fn reschedule_required(&self) -> bool {
        self.state.lock().reschedule_required
    }

    /// 有运行器时标记需要重新调度
    pub(crate) fn request_reschedule(&self) {
        let mut state = self.state.lock();
        if state.runner.is_some() {
            state.reschedule_required = true;
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::SeqCst);
    }

    pub fn next_run_time(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.is_deleted() || self.definition.is_none() {
            return None;
        }
        self.entity.lock().next_run_time(now)
    }

    /// 为作业创建新的运行器并停放到下一次运行时间
    ///
    /// 已有运行器或没有下一次运行时间时返回 false。
    pub fn start(self: &Arc<Self>) -> bool {
        let Some(server) = self.server.upgrade() else {
            return false;
        };
        if server.is_shutting_down() {
            return false;
        }

        let runner = {
            let mut state = self.state.lock();
            if state.runner.is_some() {
                trace!("作业 {} 已有运行器", self.key);
                return false;
            }
            let Some(wake_at) = self.next_run_time(Utc::now()) else {
                return false;
            };
            let runner = Arc::new(ProcessRunner::new(wake_at, server.shutdown_token()));
            state.runner = Some(runner.clone());
            state.reschedule_required = false;
            runner
        };

        StructuredLogger::log_process_scheduled(self.key.id, &self.key.name, runner.wake_at());
        let scheduler = server.scheduler();
        scheduler.park(self.key.clone(), runner.wake_at());
        if runner.is_interrupted() {
            scheduler.wake_now(&self.key);
        }
        true
    }

    /// 先触发的中断请求优先：停放中的运行器被中断并立即唤醒，否则尝试启动新周期
    pub(crate) fn reschedule(self: &Arc<Self>) {
        let parked = {
            let state = self.state.lock();
            if state.reschedule_required {
                state.runner.clone().filter(|runner| !runner.is_used())
            } else {
                None
            }
        };
        match parked {
            Some(runner) => {
                runner.interrupt();
                if let Some(server) = self.server.upgrade() {
                    server.scheduler().wake_now(&self.key);
                }
            }
            None => {
                self.start();
            }
        }
    }

    pub(crate) fn clear_runner(&self, runner: &Arc<ProcessRunner>) {
        let mut state = self.state.lock();
        if state
            .runner
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, runner))
        {
            state.runner = None;
        }
    }

    pub(crate) fn bump_cycle(&self) {
        self.cycle.send_modify(|cycle| *cycle = cycle.wrapping_add(1));
    }

    /// 等待当前运行周期结束；没有运行器时立即返回
    pub async fn attach(&self) {
        let mut cycles = self.cycle.subscribe();
        let seen = *cycles.borrow_and_update();
        if !self.has_runner() {
            return;
        }
        loop {
            if cycles.changed().await.is_err() {
                return;
            }
            if *cycles.borrow_and_update() != seen {
                return;
            }
        }
    }

    /// 超时返回 false
    pub async fn attach_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.attach()).await.is_ok()
    }
}
