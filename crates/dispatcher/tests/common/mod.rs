#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use jobqueue_core::AppConfig;
use jobqueue_dispatcher::{EngineContext, ProcessBuilder, ProcessServerRegistry};
use jobqueue_domain::{ProcessEntity, Queue};
use jobqueue_testing_utils::{MockProcessRepository, RecordingTransactionRuntime, TestEnv};

pub const WAIT: Duration = Duration::from_secs(10);

pub struct Harness {
    pub context: Arc<EngineContext>,
    pub registry: Arc<ProcessServerRegistry>,
    pub repository: MockProcessRepository,
    pub runtime: Arc<RecordingTransactionRuntime>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_records(Vec::new(), |_| {})
    }

    pub fn with_config(configure: impl FnOnce(&mut AppConfig)) -> Self {
        Self::with_records(Vec::new(), configure)
    }

    pub fn with_records(records: Vec<ProcessEntity>, configure: impl FnOnce(&mut AppConfig)) -> Self {
        TestEnv::init_tracing();
        let mut config = AppConfig::default();
        config.scheduler.renotify_interval_ms = 50;
        configure(&mut config);

        let repository = MockProcessRepository::with_records(records);
        let runtime = Arc::new(RecordingTransactionRuntime::new());
        let context = Arc::new(EngineContext::new(
            config,
            Arc::new(repository.clone()),
            runtime.clone(),
        ));
        let registry = Arc::new(ProcessServerRegistry::new(context.clone()));
        Self {
            context,
            registry,
            repository,
            runtime,
        }
    }

    pub fn process(&self, queue: &Arc<Queue>) -> ProcessBuilder {
        ProcessBuilder::new(self.registry.clone(), queue.clone())
    }
}
