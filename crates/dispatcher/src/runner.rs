//! 作业运行器：一次停放/唤醒/执行周期的状态机

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use jobqueue_core::{SchedulerError, SchedulerResult};
use jobqueue_domain::ProcessStatus;
use jobqueue_infrastructure::StructuredLogger;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::server::{AdmittedBatch, AdmittedRun, ProcessServer};
use crate::wrapper::ProcessWrapper;

/// 唤醒检查的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnparkOutcome {
    /// 通过准入，已交给执行器
    Admitted,
    /// 尚未到唤醒时间
    NotDue,
    /// 被队列限制挡下
    Restricted,
    /// 运行器已被占用或已不存在
    Skipped,
    /// 被中断、删除或需要重新调度，周期直接结束
    Finalized,
    /// 限制判断出错，记为一次失败尝试
    Failed,
}

/// 作业的一次运行周期
///
/// 每个作业同一时刻最多拥有一个运行器；`used` 保证一个运行器只被唤醒一次。
#[derive(Debug)]
pub struct ProcessRunner {
    wake_at: DateTime<Utc>,
    interrupted: AtomicBool,
    used: AtomicBool,
    cancel: CancellationToken,
}

impl ProcessRunner {
    pub fn new(wake_at: DateTime<Utc>, parent: &CancellationToken) -> Self {
        Self {
            wake_at,
            interrupted: AtomicBool::new(false),
            used: AtomicBool::new(false),
            cancel: parent.child_token(),
        }
    }

    pub fn wake_at(&self) -> DateTime<Utc> {
        self.wake_at
    }

    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// 占用运行器，只有第一个调用者成功
    pub fn try_use(&self) -> bool {
        self.used
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_used(&self) -> bool {
        self.used.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// 检查停放中的作业能否开始运行
///
/// `batch` 为 `Some` 时准入的作业先收集起来，由批次在整轮检查结束后统一启动。
/// 限制判断中的 panic 与返回错误同样处理，记为一次失败尝试。
pub(crate) async fn unpark(
    server: &Arc<ProcessServer>,
    wrapper: &Arc<ProcessWrapper>,
    batch: Option<&mut AdmittedBatch>,
) -> SchedulerResult<UnparkOutcome> {
    let key = wrapper.key();
    let Some(runner) = wrapper.runner() else {
        server.scheduler().unschedule(key);
        return Ok(UnparkOutcome::Skipped);
    };
    if runner.is_used() {
        return Ok(UnparkOutcome::Skipped);
    }

    if runner.is_interrupted() || wrapper.reschedule_required() || wrapper.is_deleted() {
        server.scheduler().unschedule(key);
        if !runner.try_use() {
            return Ok(UnparkOutcome::Skipped);
        }
        debug!("作业 {} 的运行器被中断，结束本周期", key);
        release_unstarted(server, wrapper).await;
        finish_cycle(wrapper, &runner);
        return Ok(UnparkOutcome::Finalized);
    }

    let now = Utc::now();
    if runner.wake_at() > now {
        return Ok(UnparkOutcome::NotDue);
    }

    let metrics = &server.context().metrics;
    let _admission = server.admission().lock().await;
    let snapshot = wrapper.snapshot();
    let verdict = {
        let indexes = server.indexes.read();
        panic::catch_unwind(AssertUnwindSafe(|| {
            wrapper.queue().can_run(&snapshot, &indexes)
        }))
        .unwrap_or_else(|_| {
            Err(SchedulerError::restriction(
                wrapper.queue().name(),
                "限制判断时发生panic",
            ))
        })
    };

    match verdict {
        Ok(true) => {
            if !runner.try_use() {
                return Ok(UnparkOutcome::Skipped);
            }
            server.scheduler().unschedule(key);
            let locked = server
                .do_transaction(
                    snapshot.persistent,
                    |tx| {
                        tx.update(server, wrapper, |entity| {
                            entity.status = ProcessStatus::Locked
                        });
                        Ok(())
                    },
                    |_| {},
                    None,
                )
                .await;
            if let Err(e) = locked {
                warn!("作业 {} 准入状态提交失败: {}", key, e);
                finish_cycle(wrapper, &runner);
                return Err(e);
            }

            metrics.record_admission();
            StructuredLogger::log_process_admitted(key.id, &key.name, wrapper.queue().name());
            let run = AdmittedRun {
                wrapper: wrapper.clone(),
                runner,
            };
            match batch {
                Some(batch) => batch.push(run),
                None => server.spawn_execution(run),
            }
            Ok(UnparkOutcome::Admitted)
        }
        Ok(false) => {
            metrics.record_rejection();
            StructuredLogger::log_process_rejected(key.id, &key.name, wrapper.queue().name());
            if !snapshot.is_failed() {
                server.defer(wrapper, &runner);
            }
            Ok(UnparkOutcome::Restricted)
        }
        Err(e) => {
            if !runner.try_use() {
                return Ok(UnparkOutcome::Skipped);
            }
            server.scheduler().unschedule(key);
            metrics.record_restriction_error();
            StructuredLogger::log_restriction_error(
                key.id,
                &key.name,
                wrapper.queue().name(),
                &e.to_string(),
            );
            let recorded = server
                .do_transaction(
                    snapshot.persistent,
                    |tx| {
                        tx.update(server, wrapper, |entity| entity.record_failure(now));
                        Ok(())
                    },
                    |_| {},
                    None,
                )
                .await;
            finish_cycle(wrapper, &runner);
            recorded?;
            Ok(UnparkOutcome::Failed)
        }
    }
}

/// 未开始执行的周期：已锁定的作业回到未运行状态
pub(crate) async fn release_unstarted(server: &Arc<ProcessServer>, wrapper: &Arc<ProcessWrapper>) {
    if wrapper.is_deleted() {
        return;
    }
    let (locked, persistent) =
        wrapper.with_entity(|e| (e.status == ProcessStatus::Locked, e.persistent));
    if !locked {
        return;
    }
    let released = server
        .do_transaction(
            persistent,
            |tx| {
                tx.update(server, wrapper, |e| {
                    if e.status == ProcessStatus::Locked {
                        e.status = ProcessStatus::NotRun;
                    }
                });
                Ok(())
            },
            |_| {},
            None,
        )
        .await;
    if let Err(e) = released {
        warn!("作业 {} 释放锁定状态失败: {}", wrapper.key(), e);
    }
}

/// 结束一个周期：清除运行器，未删除的作业立即按新状态重新停放，最后唤醒等待者
pub(crate) fn finish_cycle(wrapper: &Arc<ProcessWrapper>, runner: &Arc<ProcessRunner>) {
    wrapper.clear_runner(runner);
    if !wrapper.is_deleted() {
        wrapper.start();
    }
    wrapper.bump_cycle();
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_runner_is_used_once() {
        let root = CancellationToken::new();
        let runner = ProcessRunner::new(Utc::now() + Duration::seconds(5), &root);
        assert!(!runner.is_used());
        assert!(runner.try_use());
        assert!(!runner.try_use());
        assert!(runner.is_used());
    }

    #[test]
    fn test_runner_cancelled_with_parent() {
        let root = CancellationToken::new();
        let runner = ProcessRunner::new(Utc::now(), &root);
        assert!(!runner.cancellation_token().is_cancelled());
        root.cancel();
        assert!(runner.cancellation_token().is_cancelled());

        let other = ProcessRunner::new(Utc::now(), &CancellationToken::new());
        other.interrupt();
        assert!(other.is_interrupted());
        other.cancel();
        assert!(other.cancellation_token().is_cancelled());
    }
}
