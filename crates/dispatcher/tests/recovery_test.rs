mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::{Harness, WAIT};
use jobqueue_domain::{
    Occurrence, ProcessDefinition, ProcessStatus, Queue, Resilience, Schedule,
};
use jobqueue_testing_utils::{CountingSection, ProcessEntityBuilder, RepositoryCall, TestEnv};

fn reports_queue(harness: &Harness) -> Arc<Queue> {
    let queue = Arc::new(Queue::builder("reports").build());
    harness.context.queues.register(queue.clone()).unwrap();
    queue
}

#[tokio::test]
async fn test_interrupted_job_is_marked_failed() {
    let record = ProcessEntityBuilder::new()
        .with_id(10)
        .with_name("nightly")
        .with_queue("reports")
        .with_status(ProcessStatus::Running)
        .with_work_key("nightly-report")
        .persistent()
        .build();
    let harness = Harness::with_records(vec![record], |_| {});
    reports_queue(&harness);
    let (section, calls) = CountingSection::new("render");
    harness
        .context
        .works
        .register("nightly-report", ProcessDefinition::new().section(section))
        .unwrap();

    let server = harness.registry.server("default").await.unwrap();
    let wrapper = server.find_by_id(10).unwrap();
    let entity = wrapper.snapshot();
    assert_eq!(entity.status, ProcessStatus::RunError);
    assert_eq!(entity.attempt, 1);
    assert!(entity.is_failed());
    assert!(!wrapper.has_runner());
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let stored = harness.repository.get(10).unwrap();
    assert_eq!(stored.status, ProcessStatus::RunError);
    assert_eq!(stored.attempt, 1);
    assert_eq!(
        harness.repository.calls()[0],
        RepositoryCall::Find("default".to_string())
    );
}

#[tokio::test]
async fn test_interrupted_job_retries_from_failed_section() {
    let record = ProcessEntityBuilder::new()
        .with_id(11)
        .with_name("import")
        .with_queue("reports")
        .with_status(ProcessStatus::Running)
        .with_current_section(1)
        .with_resilience(
            Resilience::default()
                .with_failure(Occurrence::times(1, Schedule::immediate()))
                .unwrap(),
        )
        .with_work_key("import")
        .persistent()
        .keep_completed()
        .build();
    let harness = Harness::with_records(vec![record], |_| {});
    reports_queue(&harness);
    let (first, first_calls) = CountingSection::new("fetch");
    let (second, second_calls) = CountingSection::new("store");
    harness
        .context
        .works
        .register("import", ProcessDefinition::new().section(first).section(second))
        .unwrap();

    let server = harness.registry.server("default").await.unwrap();
    let wrapper = server.find_by_id(11).unwrap();
    assert!(
        TestEnv::wait_until(
            || wrapper.with_entity(|e| e.status == ProcessStatus::RunOk),
            WAIT
        )
        .await
    );

    assert_eq!(first_calls.load(Ordering::SeqCst), 0);
    assert_eq!(second_calls.load(Ordering::SeqCst), 1);
    let entity = wrapper.snapshot();
    assert_eq!(entity.attempt, 0);
    assert_eq!(entity.run_count, 1);
    assert!(!entity.orphaned);
}

#[tokio::test]
async fn test_rehydration_skips_unusable_records() {
    let records = vec![
        ProcessEntityBuilder::new()
            .with_id(20)
            .with_name("unknown-queue")
            .with_queue("missing")
            .persistent()
            .build(),
        ProcessEntityBuilder::new()
            .with_id(21)
            .with_name("gone")
            .with_queue("reports")
            .with_status(ProcessStatus::Deleted)
            .persistent()
            .build(),
        ProcessEntityBuilder::new()
            .with_id(22)
            .with_name("no-work")
            .with_queue("reports")
            .persistent()
            .build(),
        ProcessEntityBuilder::new()
            .with_id(23)
            .with_name("elsewhere")
            .with_owner("other")
            .with_queue("reports")
            .persistent()
            .build(),
    ];
    let harness = Harness::with_records(records, |_| {});
    reports_queue(&harness);

    let server = harness.registry.server("default").await.unwrap();
    assert_eq!(server.len(), 1);
    let wrapper = server.find_by_id(22).unwrap();
    assert!(wrapper.definition().is_none());
    assert!(!wrapper.has_runner());
    assert_eq!(server.scheduler().parked_count(), 0);
    assert!(server.find_by_id(20).is_none());
    assert!(server.find_by_id(21).is_none());
    assert!(server.find_by_id(23).is_none());
}

#[tokio::test]
async fn test_rehydrated_job_keeps_running_on_schedule() {
    let record = ProcessEntityBuilder::new()
        .with_id(30)
        .with_name("pending")
        .with_queue("reports")
        .with_work_key("pending-work")
        .persistent()
        .build();
    let harness = Harness::with_records(vec![record], |_| {});
    reports_queue(&harness);
    let (section, calls) = CountingSection::new("work");
    harness
        .context
        .works
        .register("pending-work", ProcessDefinition::new().section(section))
        .unwrap();

    harness.registry.server("default").await.unwrap();
    assert!(TestEnv::wait_until(|| calls.load(Ordering::SeqCst) == 1, WAIT).await);
    assert!(
        TestEnv::wait_until(|| harness.repository.get(30).is_none(), WAIT).await
    );
}

#[tokio::test]
async fn test_new_ids_follow_rehydrated_records() {
    let record = ProcessEntityBuilder::new()
        .with_id(40)
        .with_name("existing")
        .with_queue("reports")
        .persistent()
        .build();
    let harness = Harness::with_records(vec![record], |_| {});
    let queue = reports_queue(&harness);

    let handle = harness
        .process(&queue)
        .name("fresh")
        .persistent(true)
        .occurrence(Occurrence::at(chrono::Utc::now() + chrono::Duration::hours(1)))
        .section(CountingSection::new("noop").0)
        .submit()
        .await
        .unwrap();
    assert!(handle.id() > 40);
    assert_eq!(handle.server().len(), 2);
}
