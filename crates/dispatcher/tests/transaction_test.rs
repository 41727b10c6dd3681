mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{Duration, Utc};
use common::{Harness, WAIT};
use jobqueue_core::SchedulerError;
use jobqueue_domain::{FnSection, Occurrence, ProcessStatus, Queue};
use jobqueue_testing_utils::{GateSection, RepositoryCall, TestEnv};

fn queue(name: &str) -> Arc<Queue> {
    Arc::new(Queue::builder(name).build())
}

#[tokio::test]
async fn test_persistent_job_is_written_and_released() {
    let harness = Harness::new();
    let handle = harness
        .process(&queue("durable"))
        .name("durable-job")
        .persistent(true)
        .section(FnSection::new("noop", |_| Ok(0)))
        .submit()
        .await
        .unwrap();

    let id = handle.id();
    assert!(id > 0);
    assert!(handle.attach_timeout(WAIT).await);
    assert!(handle.is_complete());

    let calls = harness.repository.calls();
    assert_eq!(calls.first(), Some(&RepositoryCall::Persist(id)));
    assert_eq!(calls.last(), Some(&RepositoryCall::Remove(id)));
    assert!(calls.contains(&RepositoryCall::Update(id)));
    assert!(harness.repository.get(id).is_none());
    assert_eq!(harness.runtime.open(), 0);
}

#[tokio::test]
async fn test_transient_job_never_touches_repository() {
    let harness = Harness::new();
    let handle = harness
        .process(&queue("volatile"))
        .name("volatile-job")
        .section(FnSection::new("noop", |_| Ok(0)))
        .submit()
        .await
        .unwrap();

    assert!(handle.attach_timeout(WAIT).await);
    assert!(harness.repository.calls().is_empty());
    assert!(harness.runtime.committed() >= 3);
}

#[tokio::test]
async fn test_failed_write_rolls_back_submit() {
    let harness = Harness::new();
    harness.repository.fail_writes(true);

    let result = harness
        .process(&queue("broken"))
        .name("lost")
        .persistent(true)
        .section(FnSection::new("noop", |_| Ok(0)))
        .submit()
        .await;

    assert!(matches!(result, Err(SchedulerError::Persistence(_))));
    let server = harness.registry.server("default").await.unwrap();
    assert!(server.is_empty());
    assert_eq!(server.scheduler().parked_count(), 0);
    assert_eq!(harness.runtime.rolled_back(), 1);
    assert_eq!(harness.repository.count(), 0);
}

#[tokio::test]
async fn test_failed_commit_restores_memory_state() {
    let harness = Harness::new();
    harness.runtime.fail_commits(true);

    let result = harness
        .process(&queue("flaky-commit"))
        .name("first")
        .section(FnSection::new("noop", |_| Ok(0)))
        .submit()
        .await;
    assert!(matches!(result, Err(SchedulerError::Transaction(_))));
    let server = harness.registry.server("default").await.unwrap();
    assert!(server.is_empty());

    harness.runtime.fail_commits(false);
    let handle = harness
        .process(&queue("flaky-commit"))
        .name("second")
        .section(FnSection::new("noop", |_| Ok(0)))
        .submit()
        .await
        .unwrap();
    assert!(handle.attach_timeout(WAIT).await);
    assert!(handle.is_complete());
}

#[tokio::test]
async fn test_parameter_change_is_persisted() {
    let harness = Harness::new();
    let handle = harness
        .process(&queue("later"))
        .name("parked")
        .persistent(true)
        .occurrence(Occurrence::at(Utc::now() + Duration::hours(1)))
        .section(FnSection::new("noop", |_| Ok(0)))
        .submit()
        .await
        .unwrap();
    harness.repository.clear_calls();

    handle.set_parameter("limit", 25).await.unwrap();
    assert_eq!(
        harness.repository.calls(),
        vec![RepositoryCall::Update(handle.id())]
    );
    let stored = harness.repository.get(handle.id()).unwrap();
    assert_eq!(stored.parameters["limit"], serde_json::json!(25));
}

#[tokio::test]
async fn test_failed_parameter_write_keeps_previous_value() {
    let harness = Harness::new();
    let handle = harness
        .process(&queue("later"))
        .name("guarded")
        .persistent(true)
        .parameter("limit", 10)
        .occurrence(Occurrence::at(Utc::now() + Duration::hours(1)))
        .section(FnSection::new("noop", |_| Ok(0)))
        .submit()
        .await
        .unwrap();

    harness.repository.fail_writes(true);
    assert!(handle.set_parameter("limit", 99).await.is_err());
    assert_eq!(handle.parameter("limit"), Some(serde_json::json!(10)));
    assert!(handle.is_scheduled());
}

#[tokio::test]
async fn test_delete_removes_persistent_record() {
    let harness = Harness::new();
    let handle = harness
        .process(&queue("later"))
        .name("doomed")
        .persistent(true)
        .occurrence(Occurrence::at(Utc::now() + Duration::hours(1)))
        .section(FnSection::new("noop", |_| Ok(0)))
        .submit()
        .await
        .unwrap();
    assert_eq!(harness.repository.count(), 1);

    handle.delete(None).await.unwrap();
    assert_eq!(harness.repository.count(), 0);
    assert!(handle.is_deleted());
    assert_eq!(handle.status(), ProcessStatus::Deleted);
    assert!(!handle.server().contains(handle.key()));
    assert!(TestEnv::wait_until(|| harness.runtime.open() == 0, WAIT).await);
}

#[tokio::test]
async fn test_result_write_failure_records_failed_attempt() {
    let harness = Harness::new();
    let runs = Arc::new(AtomicUsize::new(0));
    let section = {
        let (repository, runs) = (harness.repository.clone(), runs.clone());
        FnSection::new("breaks-storage", move |_| {
            runs.fetch_add(1, Ordering::SeqCst);
            repository.fail_writes(true);
            Ok(0)
        })
    };
    let handle = harness
        .process(&queue("fragile"))
        .name("fragile-job")
        .persistent(true)
        .section(section)
        .submit()
        .await
        .unwrap();

    assert!(TestEnv::wait_until(|| handle.is_failed(), WAIT).await);
    assert!(handle.attach_timeout(WAIT).await);
    assert_eq!(handle.status(), ProcessStatus::RunError);
    assert_eq!(handle.attempt(), 1);
    assert!(!handle.is_scheduled());

    harness.repository.fail_writes(false);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(harness.runtime.open(), 0);
}

#[tokio::test]
async fn test_delete_while_running_rolls_back_result() {
    let harness = Harness::new();
    let gate = GateSection::new();
    let handle = harness
        .process(&queue("busy"))
        .name("interrupted")
        .persistent(true)
        .section(gate.clone())
        .submit()
        .await
        .unwrap();
    let id = handle.id();
    assert!(TestEnv::wait_until(|| gate.entered() == 1, WAIT).await);
    harness.repository.clear_calls();
    let rolled_back = harness.runtime.rolled_back();

    handle.delete(None).await.unwrap();
    assert!(handle.attach_timeout(WAIT).await);

    assert_eq!(harness.repository.calls(), vec![RepositoryCall::Remove(id)]);
    assert!(harness.repository.get(id).is_none());
    assert_eq!(handle.status(), ProcessStatus::Deleted);
    assert!(harness.runtime.rolled_back() > rolled_back);
    assert!(TestEnv::wait_until(|| harness.runtime.open() == 0, WAIT).await);
    assert!(!handle.is_scheduled());
}
