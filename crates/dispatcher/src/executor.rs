//! 作业执行
//!
//! 一次运行依次经过：标记运行中、打开输出、前置动作、分段、失败分段、后置动作、
//! 关闭输出，最后在一个事务中写入本次运行的结果。每个分段在独立事务中执行，
//! 分段失败时它对参数的修改被丢弃。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::FutureExt;
use jobqueue_core::{SchedulerError, SchedulerResult};
use jobqueue_domain::work::result_code::{FAILURE, SUCCESS};
use jobqueue_domain::{
    OutputRequest, ProcessAction, ProcessContext, ProcessEntity, ProcessSection, ProcessStatus,
};
use jobqueue_infrastructure::StructuredLogger;
use tracing::{debug, error, warn};

use crate::runner::{finish_cycle, release_unstarted, ProcessRunner};
use crate::server::ProcessServer;
use crate::transaction::Transaction;
use crate::wrapper::ProcessWrapper;

/// 一次运行的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunOutcome {
    Finished { code: i32, attempt: u32, run_count: u32 },
    /// 运行被取消（删除或关闭），不写入结果
    Cancelled,
}

pub(crate) async fn execute(
    server: Arc<ProcessServer>,
    wrapper: Arc<ProcessWrapper>,
    runner: Arc<ProcessRunner>,
) {
    let permit = tokio::select! {
        permit = server.permits().clone().acquire_owned() => permit.ok(),
        _ = runner.cancellation_token().cancelled() => None,
    };

    match permit {
        Some(_permit) => {
            let metrics = server.context().metrics.clone();
            metrics.run_started();
            let started = Instant::now();
            let outcome = AssertUnwindSafe(run(&server, &wrapper, &runner))
                .catch_unwind()
                .await;
            metrics.run_finished();
            let elapsed = started.elapsed();

            let key = wrapper.key();
            let queue = wrapper.queue().name();
            let mut aborted = false;
            match outcome {
                Ok(Ok(RunOutcome::Finished {
                    code,
                    attempt,
                    run_count,
                })) => match code {
                    SUCCESS => {
                        metrics.record_run(queue, "ok", elapsed.as_secs_f64());
                        StructuredLogger::log_process_completed(
                            key.id,
                            &key.name,
                            run_count,
                            elapsed.as_millis() as u64,
                        );
                    }
                    FAILURE => {
                        metrics.record_run(queue, "error", elapsed.as_secs_f64());
                        if attempt > 1 {
                            metrics.record_retry();
                        }
                        StructuredLogger::log_process_failed(
                            key.id,
                            &key.name,
                            attempt,
                            "作业分段返回失败",
                        );
                    }
                    stopped => {
                        metrics.record_run(queue, "stopped", elapsed.as_secs_f64());
                        StructuredLogger::log_process_stopped(key.id, &key.name, stopped);
                    }
                },
                Ok(Ok(RunOutcome::Cancelled)) => {
                    debug!("作业 {} 的运行被取消", key);
                }
                Ok(Err(e)) => {
                    error!("作业 {} 执行异常: {}", key, e);
                    aborted = true;
                }
                Err(_) => {
                    error!("作业 {} 执行时发生panic", key);
                    aborted = true;
                }
            }
            if aborted {
                metrics.record_run(queue, "error", elapsed.as_secs_f64());
                record_aborted_run(&server, &wrapper).await;
            }
        }
        None => {
            debug!("作业 {} 在开始执行前被取消", wrapper.key());
            release_unstarted(&server, &wrapper).await;
        }
    }

    finish_cycle(&wrapper, &runner);
}

/// 运行在写入结果之前中断：记为一次失败尝试，之后按失败重试计划调度
///
/// 仓储仍不可写时只修改内存中的记录。
async fn record_aborted_run(server: &Arc<ProcessServer>, wrapper: &Arc<ProcessWrapper>) {
    if wrapper.is_deleted() {
        return;
    }
    let now = Utc::now();
    let persistent = wrapper.with_entity(|e| e.persistent);
    let recorded = server
        .do_transaction(
            persistent,
            |tx| {
                if wrapper.is_deleted() {
                    return Err(SchedulerError::RollbackRequested);
                }
                Ok(tx.update(server, wrapper, |e| {
                    e.record_failure(now);
                    e.attempt
                }))
            },
            |_| {},
            None,
        )
        .await;
    let attempt = match recorded {
        Ok(Some(attempt)) => attempt,
        Ok(None) => return,
        Err(e) => {
            warn!("作业 {} 失败状态写入失败，仅更新内存: {}", wrapper.key(), e);
            server.mutate_indexed(wrapper, |e| {
                e.record_failure(now);
                e.attempt
            })
        }
    };
    let key = wrapper.key();
    StructuredLogger::log_process_failed(key.id, &key.name, attempt, "作业运行中断");
}

async fn run(
    server: &Arc<ProcessServer>,
    wrapper: &Arc<ProcessWrapper>,
    runner: &Arc<ProcessRunner>,
) -> SchedulerResult<RunOutcome> {
    let Some(definition) = wrapper.definition().cloned() else {
        return Err(SchedulerError::work_not_registered(
            wrapper
                .with_entity(|e| e.work_key.clone())
                .unwrap_or_default(),
        ));
    };
    if runner.cancellation_token().is_cancelled() || wrapper.is_deleted() {
        return Ok(RunOutcome::Cancelled);
    }

    let now = Utc::now();
    let wake_at = runner.wake_at();
    let persistent = wrapper.with_entity(|e| e.persistent);
    let Some(entity) = server
        .do_transaction(
            persistent,
            |tx| {
                Ok(tx.update(server, wrapper, |e| {
                    e.status = ProcessStatus::Running;
                    e.started_at = Some(now);
                    if e.attempt == 0 {
                        e.scheduled_at = Some(wake_at);
                        e.current_section = 0;
                    }
                    e.restart_requested = false;
                    e.orphaned = false;
                    e.clone()
                }))
            },
            |_| {},
            None,
        )
        .await?
    else {
        return Ok(RunOutcome::Cancelled);
    };

    let key = wrapper.key();
    let sections = definition.sections();
    let first_section = if entity.attempt > 0 {
        entity.current_section.min(sections.len().saturating_sub(1))
    } else {
        0
    };
    StructuredLogger::log_process_started(key.id, &key.name, entity.attempt, first_section);

    let mut ctx = ProcessContext::new(&entity, runner.cancellation_token().clone());
    let mut code = SUCCESS;

    if let Some(request) = &entity.output {
        match open_output(wrapper, &entity, request) {
            Ok(output) => ctx.attach_output(output),
            Err(e) => {
                warn!("作业 {} 无法打开输出: {}", key, e);
                code = FAILURE;
            }
        }
    }

    if code == SUCCESS {
        code = run_actions(server, wrapper, definition.pre_actions(), &mut ctx).await;
    }

    let mut cancelled = false;
    if code == SUCCESS {
        let mut committed_section = entity.current_section;
        for (index, section) in sections.iter().enumerate().skip(first_section) {
            if ctx.is_cancelled() {
                cancelled = true;
                break;
            }
            if index != committed_section {
                server
                    .do_transaction(
                        persistent,
                        |tx| {
                            tx.update(server, wrapper, |e| e.current_section = index);
                            Ok(())
                        },
                        |_| {},
                        None,
                    )
                    .await?;
                committed_section = index;
            }
            ctx.set_section_index(index);
            code = run_section(server, wrapper, section, &mut ctx).await;
            if code != SUCCESS {
                break;
            }
        }

        if code == FAILURE && !cancelled {
            if let Some(failure) = definition.failure() {
                let failure_code = run_section(server, wrapper, failure, &mut ctx).await;
                if failure_code != SUCCESS {
                    warn!("作业 {} 的失败分段返回 {}", key, failure_code);
                }
            }
        }
    }

    let post = run_actions(server, wrapper, definition.post_actions(), &mut ctx).await;
    if post != SUCCESS && code == SUCCESS {
        code = FAILURE;
    }

    if let Some(mut output) = ctx.take_output() {
        if let Err(e) = output.close() {
            warn!("作业 {} 关闭输出失败: {}", key, e);
            if code == SUCCESS {
                code = FAILURE;
            }
        }
    }

    if cancelled {
        return Ok(RunOutcome::Cancelled);
    }

    let finished_at = Utc::now();
    let parameters = ctx.parameters().clone();
    let recorded = server
        .do_transaction(
            persistent,
            |tx| {
                if wrapper.is_deleted() {
                    return Err(SchedulerError::RollbackRequested);
                }
                let (exhausted, attempt, run_count) = tx.update(server, wrapper, |e| {
                    e.parameters = parameters;
                    match code {
                        SUCCESS => e.record_success(),
                        FAILURE => {
                            e.status = ProcessStatus::RunError;
                            e.attempt = e.attempt.saturating_add(1);
                            e.result_code = FAILURE;
                        }
                        stopped => {
                            e.status = ProcessStatus::RunError;
                            e.result_code = stopped;
                        }
                    }
                    let exhausted = code == SUCCESS
                        && !e.keep_completed
                        && e.next_run_time(finished_at).is_none();
                    (exhausted, e.attempt, e.run_count)
                });
                if exhausted {
                    tx.remove(server, wrapper);
                }
                Ok((attempt, run_count))
            },
            |_| {},
            None,
        )
        .await?;

    Ok(match recorded {
        Some((attempt, run_count)) => RunOutcome::Finished {
            code,
            attempt,
            run_count,
        },
        None => RunOutcome::Cancelled,
    })
}

fn open_output(
    wrapper: &ProcessWrapper,
    entity: &ProcessEntity,
    request: &OutputRequest,
) -> SchedulerResult<Box<dyn jobqueue_domain::Outputable>> {
    let provider = wrapper.output_provider().ok_or_else(|| {
        SchedulerError::config_error(format!("队列 {} 没有输出提供者", wrapper.queue().name()))
    })?;
    provider.get_outputable(
        &entity.queue_owner,
        entity.user.as_deref(),
        &entity.name,
        &request.report_type,
        &request.source_name,
    )
}

/// 在独立事务中执行一个分段，返回规范化后的结果码
async fn run_section(
    server: &Arc<ProcessServer>,
    wrapper: &Arc<ProcessWrapper>,
    section: &Arc<dyn ProcessSection>,
    ctx: &mut ProcessContext,
) -> i32 {
    let key = wrapper.key();
    let persistent = wrapper.with_entity(|e| e.persistent);
    let before = ctx.parameters().clone();
    let mut transaction = match Transaction::begin(server.context(), persistent).await {
        Ok(transaction) => transaction,
        Err(e) => {
            error!("作业 {} 分段 {} 无法开始事务: {}", key, section.name(), e);
            return FAILURE;
        }
    };

    let outcome = AssertUnwindSafe(section.execute(ctx)).catch_unwind().await;
    let code = match outcome {
        Ok(Ok(code)) if code < 0 => {
            warn!("作业 {} 分段 {} 返回无效结果码 {}", key, section.name(), code);
            FAILURE
        }
        Ok(Ok(code)) => code,
        Ok(Err(e)) => {
            warn!("作业 {} 分段 {} 执行失败: {}", key, section.name(), e);
            FAILURE
        }
        Err(_) => {
            error!("作业 {} 分段 {} 发生panic", key, section.name());
            FAILURE
        }
    };

    if code != SUCCESS {
        ctx.replace_parameters(before);
        transaction.rollback(None).await;
        return code;
    }

    if ctx.parameters() != &before {
        let parameters = ctx.parameters().clone();
        transaction.update(server, wrapper, |e| e.parameters = parameters);
    }
    if let Err(e) = transaction.commit().await {
        error!("作业 {} 分段 {} 提交失败: {}", key, section.name(), e);
        ctx.replace_parameters(before);
        return FAILURE;
    }
    code
}

/// 依次执行所有动作，任一动作失败时结果为失败
async fn run_actions(
    server: &Arc<ProcessServer>,
    wrapper: &Arc<ProcessWrapper>,
    actions: &[Arc<dyn ProcessAction>],
    ctx: &mut ProcessContext,
) -> i32 {
    let mut code = SUCCESS;
    for action in actions {
        let before = ctx.parameters().clone();
        let outcome = AssertUnwindSafe(action.run(ctx)).catch_unwind().await;
        match outcome {
            Ok(Ok(())) => {
                if action.requires_transaction() && ctx.parameters() != &before {
                    let parameters = ctx.parameters().clone();
                    let persistent = wrapper.with_entity(|e| e.persistent);
                    let committed = server
                        .do_transaction(
                            persistent,
                            |tx| {
                                tx.update(server, wrapper, |e| e.parameters = parameters);
                                Ok(())
                            },
                            |_| {},
                            None,
                        )
                        .await;
                    if let Err(e) = committed {
                        warn!("作业 {} 动作 {} 提交失败: {}", wrapper.key(), action.name(), e);
                        ctx.replace_parameters(before);
                        code = FAILURE;
                    }
                }
            }
            Ok(Err(e)) => {
                warn!("作业 {} 动作 {} 失败: {}", wrapper.key(), action.name(), e);
                code = FAILURE;
            }
            Err(_) => {
                error!("作业 {} 动作 {} 发生panic", wrapper.key(), action.name());
                code = FAILURE;
            }
        }
    }
    code
}
