//! Test helper utilities and instrumented process sections

use std::future::Future;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobqueue_core::{SchedulerError, SchedulerResult};
use jobqueue_domain::{ProcessContext, ProcessSection};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::time::sleep;

/// Test environment setup utilities
pub struct TestEnv;

impl TestEnv {
    /// Wait for a condition to be true with timeout
    pub async fn wait_for<F, Fut>(mut condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            if condition().await {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        condition().await
    }

    /// Synchronous variant for conditions that only read state
    pub async fn wait_until<F>(mut condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> bool,
    {
        Self::wait_for(move || std::future::ready(condition()), timeout).await
    }

    /// Install a test subscriber; repeated calls are ignored
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter("debug")
            .try_init();
    }

    pub fn timestamp_with_offset(offset_seconds: i64) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::seconds(offset_seconds)
    }
}

/// Section that counts its executions and returns a fixed code
pub struct CountingSection {
    name: String,
    code: i32,
    calls: Arc<AtomicUsize>,
}

impl CountingSection {
    pub fn new(name: &str) -> (Self, Arc<AtomicUsize>) {
        Self::with_code(name, 0)
    }

    pub fn with_code(name: &str, code: i32) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                name: name.to_string(),
                code,
                calls: calls.clone(),
            },
            calls,
        )
    }
}

#[async_trait]
impl ProcessSection for CountingSection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _ctx: &mut ProcessContext) -> SchedulerResult<i32> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.code)
    }
}

/// Section that fails the first `failures` executions, then succeeds
pub struct FlakySection {
    remaining_failures: AtomicI32,
    calls: Arc<AtomicUsize>,
}

impl FlakySection {
    pub fn new(failures: i32) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                remaining_failures: AtomicI32::new(failures),
                calls: calls.clone(),
            },
            calls,
        )
    }
}

#[async_trait]
impl ProcessSection for FlakySection {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn execute(&self, _ctx: &mut ProcessContext) -> SchedulerResult<i32> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.remaining_failures.fetch_sub(1, Ordering::SeqCst) > 0 {
            return Err(SchedulerError::execution("flaky section failure"));
        }
        Ok(0)
    }
}

/// Section that blocks until the test releases it and tracks peak concurrency
#[derive(Clone)]
pub struct GateSection {
    gate: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    entered: Arc<AtomicUsize>,
}

impl GateSection {
    pub fn new() -> Self {
        Self {
            gate: Arc::new(Semaphore::new(0)),
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            entered: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Let `count` blocked executions finish
    pub fn release(&self, count: usize) {
        self.gate.add_permits(count);
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }
}

impl Default for GateSection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessSection for GateSection {
    fn name(&self) -> &str {
        "gate"
    }

    async fn execute(&self, ctx: &mut ProcessContext) -> SchedulerResult<i32> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);

        let outcome = tokio::select! {
            permit = self.gate.acquire() => match permit {
                Ok(permit) => {
                    permit.forget();
                    Ok(0)
                }
                Err(_) => Err(SchedulerError::execution("gate closed")),
            },
            _ = ctx.cancellation_token().cancelled() => Ok(0),
        };
        self.active.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

/// Records the order in which jobs executed
#[derive(Clone, Default)]
pub struct ExecutionLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl ExecutionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.entries.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
