//! Status ingestion through the broker consumer: correlation, rejection of
//! unknown runs, and idempotent replay.

use std::sync::Arc;
use std::time::Duration;

use timely::{
    EventBus, InMemoryStorage, JobRunStatus, JobStatusEvent, Scheduler, ScheduleStatus, Storage,
    QUEUE_JOB_STATUS,
};
use uuid::Uuid;

use crate::common::{broker_schedule, fake_clock, wait_for_schedule_status, MockBroker};

struct Settled {
    storage: Arc<InMemoryStorage>,
    broker: Arc<MockBroker>,
    schedule_id: timely::ScheduleId,
    group_id: timely::GroupId,
    job_run_id: timely::JobRunId,
}

/// Boot an engine over the mock broker, dispatch one broker schedule, and
/// return the ids needed to drive status callbacks.
async fn dispatch_one() -> (Settled, timely::SchedulerHandle, tokio::task::JoinHandle<()>) {
    let clock = fake_clock();
    let storage = Arc::new(InMemoryStorage::new());
    let broker = MockBroker::new();

    let schedule = broker_schedule(&clock, "once", "status-test-job");
    storage.add(&schedule).await.unwrap();

    let (handle, task) = Scheduler::with_storage(Arc::clone(&storage))
        .with_async_transport(broker.clone())
        .with_event_bus(Arc::new(EventBus::new()))
        .with_clock(clock)
        .with_tick_interval(Duration::from_millis(50))
        .start()
        .await
        .unwrap();

    wait_for_schedule_status(
        storage.as_ref(),
        schedule.id,
        ScheduleStatus::Scheduled,
        Duration::from_secs(2),
    )
    .await;

    let group = storage
        .get_job_run_group(schedule.id, schedule.group_id)
        .await
        .unwrap();

    (
        Settled {
            storage,
            broker,
            schedule_id: schedule.id,
            group_id: schedule.group_id,
            job_run_id: group[0].id,
        },
        handle,
        task,
    )
}

fn event_json(settled: &Settled, status: &str, reason: Option<&str>) -> Vec<u8> {
    serde_json::to_vec(&JobStatusEvent {
        schedule_id: settled.schedule_id,
        group_id: settled.group_id,
        job_run_id: settled.job_run_id,
        status: status.to_string(),
        reason: reason.map(str::to_string),
    })
    .unwrap()
}

#[tokio::test]
async fn test_failed_status_closes_run_with_reason() {
    let (settled, handle, task) = dispatch_one().await;

    settled
        .broker
        .deliver(
            QUEUE_JOB_STATUS,
            &event_json(&settled, "failed", Some("worker crashed")),
        )
        .await
        .unwrap();

    let group = settled
        .storage
        .get_job_run_group(settled.schedule_id, settled.group_id)
        .await
        .unwrap();
    assert_eq!(group[0].status, JobRunStatus::Failed);
    assert_eq!(group[0].reason.as_deref(), Some("worker crashed"));

    // No retry policy on this schedule, so the one-shot finishes.
    let schedule = settled
        .storage
        .get_schedule_by_id(settled.schedule_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(schedule.status, ScheduleStatus::Finished);

    handle.shutdown().await.unwrap();
    let _ = task.await;
}

#[tokio::test]
async fn test_unknown_run_is_nacked() {
    let (settled, handle, task) = dispatch_one().await;

    let bogus = serde_json::to_vec(&JobStatusEvent {
        schedule_id: settled.schedule_id,
        group_id: settled.group_id,
        job_run_id: timely::JobRunId::from_uuid(Uuid::new_v4()),
        status: "succeed".to_string(),
        reason: None,
    })
    .unwrap();

    let verdict = settled.broker.deliver(QUEUE_JOB_STATUS, &bogus).await;
    assert!(verdict.is_err());

    // The real run is untouched.
    let group = settled
        .storage
        .get_job_run_group(settled.schedule_id, settled.group_id)
        .await
        .unwrap();
    assert_eq!(group[0].status, JobRunStatus::Waiting);

    handle.shutdown().await.unwrap();
    let _ = task.await;
}

#[tokio::test]
async fn test_malformed_payload_is_nacked() {
    let (settled, handle, task) = dispatch_one().await;

    let verdict = settled
        .broker
        .deliver(QUEUE_JOB_STATUS, b"{\"not\": \"a status event\"")
        .await;

    assert!(verdict.is_err());

    handle.shutdown().await.unwrap();
    let _ = task.await;
}

/// Property: redelivering a terminal status event acks without touching the
/// run or the schedule.
#[tokio::test]
async fn test_terminal_replay_is_acked_and_unchanged() {
    let (settled, handle, task) = dispatch_one().await;

    settled
        .broker
        .deliver(QUEUE_JOB_STATUS, &event_json(&settled, "succeed", None))
        .await
        .unwrap();

    let run_before = settled
        .storage
        .get_job_run_group(settled.schedule_id, settled.group_id)
        .await
        .unwrap()
        .remove(0);
    let schedule_before = settled
        .storage
        .get_schedule_by_id(settled.schedule_id)
        .await
        .unwrap()
        .unwrap();

    // Broker redelivery of the same event, and a contradicting late event.
    settled
        .broker
        .deliver(QUEUE_JOB_STATUS, &event_json(&settled, "succeed", None))
        .await
        .unwrap();
    settled
        .broker
        .deliver(
            QUEUE_JOB_STATUS,
            &event_json(&settled, "failed", Some("late duplicate")),
        )
        .await
        .unwrap();

    let run_after = settled
        .storage
        .get_job_run_group(settled.schedule_id, settled.group_id)
        .await
        .unwrap()
        .remove(0);
    let schedule_after = settled
        .storage
        .get_schedule_by_id(settled.schedule_id)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(run_after, run_before);
    assert_eq!(schedule_after.status, schedule_before.status);
    assert_eq!(schedule_after.group_id, schedule_before.group_id);
    assert_eq!(
        schedule_after.next_execution_date,
        schedule_before.next_execution_date
    );

    handle.shutdown().await.unwrap();
    let _ = task.await;
}
