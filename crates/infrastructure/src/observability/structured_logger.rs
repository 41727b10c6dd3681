//! Structured logging utilities
//!
//! Lifecycle events carry an `event` field plus `process.*` fields so that
//! JSON logs can be filtered per job.

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

pub struct StructuredLogger;

impl StructuredLogger {
    pub fn log_process_submitted(
        process_id: i64,
        process_name: &str,
        queue: &str,
        owner: &str,
        persistent: bool,
    ) {
        info!(
            event = "process_submitted",
            process.id = process_id,
            process.name = process_name,
            process.queue = queue,
            process.owner = owner,
            process.persistent = persistent,
            "Process submitted"
        );
    }

    pub fn log_process_scheduled(process_id: i64, process_name: &str, wake_at: DateTime<Utc>) {
        debug!(
            event = "process_scheduled",
            process.id = process_id,
            process.name = process_name,
            process.wake_at = %wake_at,
            "Process parked until wake time"
        );
    }

    pub fn log_process_admitted(process_id: i64, process_name: &str, queue: &str) {
        debug!(
            event = "process_admitted",
            process.id = process_id,
            process.name = process_name,
            process.queue = queue,
            "Process admitted by queue"
        );
    }

    pub fn log_process_rejected(process_id: i64, process_name: &str, queue: &str) {
        debug!(
            event = "process_rejected",
            process.id = process_id,
            process.name = process_name,
            process.queue = queue,
            "Process held back by queue restriction"
        );
    }

    pub fn log_process_started(process_id: i64, process_name: &str, attempt: u32, section: usize) {
        info!(
            event = "process_started",
            process.id = process_id,
            process.name = process_name,
            process.attempt = attempt,
            process.section = section,
            "Process run started"
        );
    }

    pub fn log_process_completed(
        process_id: i64,
        process_name: &str,
        run_count: u32,
        duration_ms: u64,
    ) {
        info!(
            event = "process_completed",
            process.id = process_id,
            process.name = process_name,
            process.run_count = run_count,
            duration_ms = duration_ms,
            "Process run completed successfully"
        );
    }

    pub fn log_process_failed(
        process_id: i64,
        process_name: &str,
        attempt: u32,
        error_message: &str,
    ) {
        warn!(
            event = "process_failed",
            process.id = process_id,
            process.name = process_name,
            process.attempt = attempt,
            error.message = error_message,
            "Process run failed"
        );
    }

    pub fn log_process_stopped(process_id: i64, process_name: &str, result_code: i32) {
        info!(
            event = "process_stopped",
            process.id = process_id,
            process.name = process_name,
            process.result_code = result_code,
            "Process stopped with controlled result code"
        );
    }

    pub fn log_process_deleted(process_id: i64, process_name: &str, user: Option<&str>) {
        info!(
            event = "process_deleted",
            process.id = process_id,
            process.name = process_name,
            user = user.unwrap_or("-"),
            "Process deleted"
        );
    }

    pub fn log_process_restarted(process_id: i64, process_name: &str, user: Option<&str>) {
        info!(
            event = "process_restarted",
            process.id = process_id,
            process.name = process_name,
            user = user.unwrap_or("-"),
            "Process restart requested"
        );
    }

    pub fn log_restriction_error(
        process_id: i64,
        process_name: &str,
        queue: &str,
        error_message: &str,
    ) {
        error!(
            event = "restriction_error",
            process.id = process_id,
            process.name = process_name,
            process.queue = queue,
            error.message = error_message,
            "Queue restriction failed, recorded as failed attempt"
        );
    }

    pub fn log_transaction_rollback(reason: &str, touched: usize) {
        warn!(
            event = "transaction_rollback",
            touched = touched,
            reason = reason,
            "Transaction rolled back"
        );
    }

    pub fn log_rehydration(owner: &str, loaded: usize, orphaned: usize, unscheduled: usize) {
        info!(
            event = "server_rehydrated",
            owner = owner,
            loaded = loaded,
            orphaned = orphaned,
            unscheduled = unscheduled,
            "Process server loaded persisted processes"
        );
    }
}
