//! Metrics collector for the job engine
//!
//! Handles are registered against whatever `metrics` recorder the host installs;
//! without one every call is a no-op.

use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram};
use tracing::debug;

pub struct MetricsCollector {
    // Run metrics
    runs_total: Counter,
    run_failures_total: Counter,
    run_retries_total: Counter,
    run_duration: Histogram,
    running_processes: Gauge,

    // Admission metrics
    admissions_total: Counter,
    rejections_total: Counter,
    restriction_errors_total: Counter,
    parked_processes: Gauge,
    unpark_cycle_duration: Histogram,

    // Transaction metrics
    transaction_commits_total: Counter,
    transaction_rollbacks_total: Counter,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            runs_total: counter!("jobqueue_process_runs_total"),
            run_failures_total: counter!("jobqueue_process_failures_total"),
            run_retries_total: counter!("jobqueue_process_retries_total"),
            run_duration: histogram!("jobqueue_process_run_duration_seconds"),
            running_processes: gauge!("jobqueue_running_processes"),
            admissions_total: counter!("jobqueue_admissions_total"),
            rejections_total: counter!("jobqueue_admission_rejections_total"),
            restriction_errors_total: counter!("jobqueue_restriction_errors_total"),
            parked_processes: gauge!("jobqueue_parked_processes"),
            unpark_cycle_duration: histogram!("jobqueue_unpark_cycle_duration_seconds"),
            transaction_commits_total: counter!("jobqueue_transaction_commits_total"),
            transaction_rollbacks_total: counter!("jobqueue_transaction_rollbacks_total"),
        }
    }

    /// Record a finished run; `outcome` is one of `ok`, `error`, `stopped`
    pub fn record_run(&self, queue: &str, outcome: &str, duration_seconds: f64) {
        self.runs_total.increment(1);
        self.run_duration.record(duration_seconds);
        counter!(
            "jobqueue_process_runs_by_outcome_total",
            "queue" => queue.to_string(),
            "outcome" => outcome.to_string()
        )
        .increment(1);
        if outcome == "error" {
            self.run_failures_total.increment(1);
        }

        debug!(
            queue = queue,
            outcome = outcome,
            duration_seconds = duration_seconds,
            "Process run recorded"
        );
    }

    pub fn record_retry(&self) {
        self.run_retries_total.increment(1);
    }

    pub fn run_started(&self) {
        self.running_processes.increment(1.0);
    }

    pub fn run_finished(&self) {
        self.running_processes.decrement(1.0);
    }

    pub fn record_admission(&self) {
        self.admissions_total.increment(1);
    }

    pub fn record_rejection(&self) {
        self.rejections_total.increment(1);
    }

    pub fn record_restriction_error(&self) {
        self.restriction_errors_total.increment(1);
    }

    pub fn set_parked(&self, parked: usize) {
        self.parked_processes.set(parked as f64);
    }

    pub fn record_unpark_cycle(&self, duration_seconds: f64) {
        self.unpark_cycle_duration.record(duration_seconds);
    }

    pub fn record_commit(&self) {
        self.transaction_commits_total.increment(1);
    }

    pub fn record_rollback(&self) {
        self.transaction_rollbacks_total.increment(1);
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        let metrics = MetricsCollector::new();
        metrics.record_run("reports", "ok", 0.25);
        metrics.record_run("reports", "error", 0.5);
        metrics.run_started();
        metrics.run_finished();
        metrics.set_parked(3);
        metrics.record_rollback();
    }
}
