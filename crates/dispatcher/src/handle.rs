use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobqueue_core::{SchedulerError, SchedulerResult};
use jobqueue_domain::{Occurrence, ProcessEntity, ProcessKey, ProcessStatus};
use jobqueue_infrastructure::StructuredLogger;
use serde::Serialize;

use crate::runner::finish_cycle;
use crate::server::ProcessServer;
use crate::wrapper::ProcessWrapper;

/// 已提交作业的句柄
#[derive(Clone)]
pub struct ProcessHandle {
    server: Arc<ProcessServer>,
    wrapper: Arc<ProcessWrapper>,
}

impl ProcessHandle {
    pub(crate) fn new(server: Arc<ProcessServer>, wrapper: Arc<ProcessWrapper>) -> Self {
        Self { server, wrapper }
    }

    pub fn id(&self) -> i64 {
        self.wrapper.id()
    }

    pub fn key(&self) -> &ProcessKey {
        self.wrapper.key()
    }

    pub fn name(&self) -> &str {
        &self.wrapper.key().name
    }

    pub fn owner(&self) -> &str {
        self.server.owner()
    }

    pub fn server(&self) -> &Arc<ProcessServer> {
        &self.server
    }

    pub fn snapshot(&self) -> ProcessEntity {
        self.wrapper.snapshot()
    }

    pub fn status(&self) -> ProcessStatus {
        self.wrapper.with_entity(|e| e.status)
    }

    pub fn attempt(&self) -> u32 {
        self.wrapper.with_entity(|e| e.attempt)
    }

    pub fn run_count(&self) -> u32 {
        self.wrapper.with_entity(|e| e.run_count)
    }

    pub fn result_code(&self) -> i32 {
        self.wrapper.with_entity(|e| e.result_code)
    }

    pub fn is_failed(&self) -> bool {
        self.wrapper.with_entity(ProcessEntity::is_failed)
    }

    pub fn is_complete(&self) -> bool {
        self.wrapper.with_entity(ProcessEntity::is_complete)
    }

    pub fn is_deleted(&self) -> bool {
        self.wrapper.is_deleted()
    }

    /// 已有运行器
    pub fn is_scheduled(&self) -> bool {
        self.wrapper.has_runner()
    }

    /// 当前运行器的唤醒时间，没有运行器时按记录计算
    pub fn next_run_time(&self) -> Option<DateTime<Utc>> {
        match self.wrapper.runner() {
            Some(runner) => Some(runner.wake_at()),
            None => self.wrapper.next_run_time(Utc::now()),
        }
    }

    pub fn parameter(&self, name: &str) -> Option<serde_json::Value> {
        self.wrapper.with_entity(|e| e.parameters.get(name).cloned())
    }

    /// 等待当前运行周期结束
    pub async fn attach(&self) {
        self.wrapper.attach().await
    }

    /// 超时返回 false
    pub async fn attach_timeout(&self, timeout: Duration) -> bool {
        self.wrapper.attach_timeout(timeout).await
    }

    pub fn is_visible(&self, user: Option<&str>) -> bool {
        let snapshot = self.wrapper.snapshot();
        self.wrapper
            .visibility()
            .is_visible(&snapshot, user, self.server.owner())
    }

    pub fn can_delete(&self, user: Option<&str>) -> bool {
        let snapshot = self.wrapper.snapshot();
        self.wrapper
            .access()
            .can_delete(&snapshot, user, self.server.owner())
    }

    pub fn can_restart(&self, user: Option<&str>) -> bool {
        let snapshot = self.wrapper.snapshot();
        self.wrapper
            .access()
            .can_restart(&snapshot, user, self.server.owner())
    }

    fn ensure_present(&self) -> SchedulerResult<()> {
        if self.wrapper.is_deleted() || !self.server.contains(self.wrapper.key()) {
            return Err(SchedulerError::process_not_found(self.id()));
        }
        Ok(())
    }

    pub async fn set_parameter<T: Serialize>(&self, name: &str, value: T) -> SchedulerResult<()> {
        self.ensure_present()?;
        let value = serde_json::to_value(value)?;
        let (server, wrapper) = (&self.server, &self.wrapper);
        let persistent = wrapper.with_entity(|e| e.persistent);
        server
            .do_transaction(
                persistent,
                |tx| {
                    tx.update(server, wrapper, |e| {
                        e.parameters.insert(name.to_string(), value);
                    });
                    Ok(())
                },
                |_| {},
                None,
            )
            .await?;
        Ok(())
    }

    /// 更换周期定义，停放中的运行器按新定义重新调度
    pub async fn set_occurrence(&self, occurrence: Occurrence) -> SchedulerResult<()> {
        self.ensure_present()?;
        occurrence.validate()?;
        let (server, wrapper) = (&self.server, &self.wrapper);
        let persistent = wrapper.with_entity(|e| e.persistent);
        server
            .do_transaction(
                persistent,
                |tx| {
                    tx.update(server, wrapper, |e| e.occurrence = occurrence);
                    Ok(())
                },
                |_| wrapper.request_reschedule(),
                Some(wrapper),
            )
            .await?;
        Ok(())
    }

    /// 删除作业：记录被移除，运行中的作业收到取消信号
    pub async fn delete(&self, user: Option<&str>) -> SchedulerResult<()> {
        if self.wrapper.is_deleted() {
            return Ok(());
        }
        if !self.can_delete(user) {
            return Err(SchedulerError::permission(format!(
                "用户 {} 无权删除作业 {}",
                user.unwrap_or("-"),
                self.wrapper.key()
            )));
        }

        let (server, wrapper) = (&self.server, &self.wrapper);
        let persistent = wrapper.with_entity(|e| e.persistent);
        server
            .do_transaction(
                persistent,
                |tx| {
                    tx.update(server, wrapper, |e| e.status = ProcessStatus::Deleted);
                    tx.remove(server, wrapper);
                    Ok(())
                },
                |_| wrapper.mark_deleted(),
                None,
            )
            .await?;

        let key = wrapper.key();
        StructuredLogger::log_process_deleted(key.id, &key.name, user);
        if let Some(runner) = wrapper.runner() {
            runner.cancel();
            if runner.try_use() {
                server.scheduler().unschedule(key);
                finish_cycle(wrapper, &runner);
            }
        }
        Ok(())
    }

    /// 请求立即重新运行，清除失败与停止状态
    pub async fn restart(&self, user: Option<&str>) -> SchedulerResult<()> {
        self.ensure_present()?;
        if !self.can_restart(user) {
            return Err(SchedulerError::permission(format!(
                "用户 {} 无权重启作业 {}",
                user.unwrap_or("-"),
                self.wrapper.key()
            )));
        }

        let (server, wrapper) = (&self.server, &self.wrapper);
        let persistent = wrapper.with_entity(|e| e.persistent);
        server
            .do_transaction(
                persistent,
                |tx| {
                    tx.update(server, wrapper, |e| {
                        e.restart_requested = true;
                        e.attempt = 0;
                        e.result_code = 0;
                        e.orphaned = false;
                        if !matches!(e.status, ProcessStatus::Running | ProcessStatus::Locked) {
                            e.status = ProcessStatus::Restarted;
                        }
                    });
                    Ok(())
                },
                |_| {
                    let key = wrapper.key();
                    StructuredLogger::log_process_restarted(key.id, &key.name, user);
                    wrapper.request_reschedule();
                },
                Some(wrapper),
            )
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("key", self.wrapper.key())
            .field("owner", &self.server.owner())
            .finish()
    }
}
