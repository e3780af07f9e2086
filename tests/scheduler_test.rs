//! Integration tests for the resource scheduler: ordering, admission,
//! failure handling, cancellation and queue persistence.

mod common;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use common::{fast_config, idle_probe, scheduler, scheduler_at, spawn_loop, FlakyQueueStore, ScriptedHandler};
use nightshift::core::{
    Admission, HandlerRegistry, InMemoryAuditSink, QueueStore, Refusal, SchedulerError,
    TaskPayload, TaskRequest, TaskState,
};
use nightshift::infra::InMemoryQueueStore;
use nightshift::util::{Clock, ManualClock, Priority, TaskKind};

fn labelled(kind: TaskKind, priority: Priority, label: &str) -> TaskRequest {
    TaskRequest::new(
        kind,
        priority,
        TaskPayload::new(format!("out/{label}")).with_input("label", label),
    )
}

fn unit(kind: TaskKind, ordinal: u64) -> TaskRequest {
    TaskRequest::new(
        kind,
        Priority::Normal,
        TaskPayload::new(format!("out/unit_{ordinal}")).with_input("ordinal", ordinal),
    )
}

async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), fut)
        .await
        .expect("timed out waiting")
}

#[tokio::test]
async fn test_priority_then_fifo_order() {
    let handler = ScriptedHandler::new();
    let sched = scheduler(fast_config(), Arc::new(InMemoryQueueStore::new()), handler.registry());

    sched.submit(labelled(TaskKind::Mastering, Priority::Low, "low")).unwrap();
    sched.submit(labelled(TaskKind::Mastering, Priority::Normal, "normal-1")).unwrap();
    sched.submit(labelled(TaskKind::Mastering, Priority::Critical, "critical")).unwrap();
    sched.submit(labelled(TaskKind::Mastering, Priority::Normal, "normal-2")).unwrap();

    within(sched.run_until_empty()).await.unwrap();

    assert_eq!(handler.labels(), vec!["critical", "normal-1", "normal-2", "low"]);
    let status = sched.status().await;
    assert_eq!(status.completed, 4);
    assert_eq!(status.pending, 0);
}

#[tokio::test]
async fn test_insufficient_memory_keeps_task_queued() {
    let handler = ScriptedHandler::new();
    let probe = idle_probe();
    probe.set_free_memory(4.0);
    let sched = scheduler_at(
        fast_config(),
        Arc::new(InMemoryQueueStore::new()),
        handler.registry(),
        Arc::clone(&probe),
        ManualClock::at_hour(12),
    );

    // Synthesis needs 6GB by default.
    let id = sched.submit(labelled(TaskKind::Synthesis, Priority::Critical, "tts")).unwrap();
    let head = sched.pending().remove(0);
    assert!(matches!(
        sched.admission_check(&head).await,
        Admission::Refused(Refusal::InsufficientMemory { .. })
    ));
    let status = sched.status().await;
    assert_eq!(status.next_task, Some(id));
    assert!(!status.next_admission.unwrap().allowed());

    let run = spawn_loop(&sched);
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(handler.calls().is_empty());
    assert_eq!(sched.task(id).unwrap().state, TaskState::Queued);

    probe.set_free_memory(12.0);
    let outcome = within(sched.wait(id)).await.unwrap();
    assert!(outcome.succeeded());

    sched.stop();
    within(run).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_overheated_device_refuses_admission() {
    let probe = idle_probe();
    probe.set_temperature(91.0);
    let sched = scheduler_at(
        fast_config(),
        Arc::new(InMemoryQueueStore::new()),
        HandlerRegistry::new(),
        probe,
        ManualClock::at_hour(12),
    );

    sched.submit(labelled(TaskKind::Mastering, Priority::Critical, "hot")).unwrap();
    let head = sched.pending().remove(0);
    let decision = sched.admission_check(&head).await;
    assert!(matches!(decision, Admission::Refused(Refusal::TooHot { .. })));
    assert!(decision.reason().contains("too hot"));
}

#[tokio::test]
async fn test_overnight_task_waits_for_window() {
    let handler = ScriptedHandler::new();
    let clock = ManualClock::at_hour(12);
    let sched = scheduler_at(
        fast_config(),
        Arc::new(InMemoryQueueStore::new()),
        handler.registry(),
        idle_probe(),
        clock.clone(),
    );

    let night = sched.submit(labelled(TaskKind::Mastering, Priority::Overnight, "night")).unwrap();
    let day = sched.submit(labelled(TaskKind::Mastering, Priority::Low, "day")).unwrap();

    let run = spawn_loop(&sched);
    assert!(within(sched.wait(day)).await.unwrap().succeeded());
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(handler.labels(), vec!["day"]);
    assert_eq!(sched.task(night).unwrap().state, TaskState::Queued);

    clock.advance(chrono::Duration::hours(11));
    assert!(within(sched.wait(night)).await.unwrap().succeeded());
    assert_eq!(handler.labels(), vec!["day", "night"]);

    sched.stop();
    within(run).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_concurrency_limit_is_respected() {
    let handler = ScriptedHandler::new();
    for ordinal in 1..=3 {
        handler.block(ordinal);
    }
    let sched = scheduler(
        fast_config().with_max_concurrent(2),
        Arc::new(InMemoryQueueStore::new()),
        handler.registry(),
    );
    for ordinal in 1..=3 {
        sched.submit(unit(TaskKind::Mastering, ordinal)).unwrap();
    }

    let run = spawn_loop(&sched);
    within(async {
        while sched.status().await.running < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(60)).await;

    let status = sched.status().await;
    assert_eq!(status.running, 2);
    assert_eq!(status.pending, 1);
    assert_eq!(handler.calls().len(), 2);
    run.abort();
}

#[tokio::test]
async fn test_handler_failure_is_not_retried() {
    let handler = ScriptedHandler::new();
    handler.fail_always(TaskKind::Synthesis, Some(7));
    let sched = scheduler(fast_config(), Arc::new(InMemoryQueueStore::new()), handler.registry());

    let id = sched.submit(unit(TaskKind::Synthesis, 7)).unwrap();
    within(sched.run_until_empty()).await.unwrap();

    let outcome = within(sched.wait(id)).await.unwrap();
    assert_eq!(outcome.state, TaskState::Failed);
    assert!(outcome.error.unwrap().contains("broken"));
    assert_eq!(handler.count(TaskKind::Synthesis, 7), 1);
    assert_eq!(sched.status().await.failed, 1);
}

#[tokio::test]
async fn test_missing_handler_fails_task() {
    let sched = scheduler(
        fast_config(),
        Arc::new(InMemoryQueueStore::new()),
        HandlerRegistry::new(),
    );
    let id = sched.submit(labelled(TaskKind::VideoGeneration, Priority::High, "video")).unwrap();
    within(sched.run_until_empty()).await.unwrap();

    let outcome = within(sched.wait(id)).await.unwrap();
    assert_eq!(outcome.state, TaskState::Failed);
    assert!(outcome.error.unwrap().contains("no handler"));
}

#[tokio::test]
async fn test_timeout_fails_task_and_frees_slot() {
    let slow = ScriptedHandler::new().with_delay(Duration::from_secs(30));
    let sched = scheduler(
        fast_config().with_task_timeout(Duration::from_secs(1)),
        Arc::new(InMemoryQueueStore::new()),
        slow.registry(),
    );
    let id = sched.submit(labelled(TaskKind::Mastering, Priority::Normal, "slow")).unwrap();
    within(sched.run_until_empty()).await.unwrap();

    let outcome = within(sched.wait(id)).await.unwrap();
    assert_eq!(outcome.state, TaskState::Failed);
    assert!(outcome.error.unwrap().contains("timed out"));
    let status = sched.status().await;
    assert_eq!(status.running, 0);
    assert_eq!(status.failed, 1);
}

#[tokio::test]
async fn test_cancel_queued_task() {
    let sched = scheduler(
        fast_config(),
        Arc::new(InMemoryQueueStore::new()),
        HandlerRegistry::new(),
    );
    let id = sched.submit(labelled(TaskKind::Mastering, Priority::Normal, "gone")).unwrap();

    let waiter = {
        let sched = sched.clone();
        tokio::spawn(async move { sched.wait(id).await })
    };
    tokio::task::yield_now().await;

    sched.cancel(id).unwrap();
    let outcome = within(waiter).await.unwrap().unwrap();
    assert_eq!(outcome.state, TaskState::Cancelled);
    assert!(sched.pending().is_empty());
    assert_eq!(sched.status().await.cancelled, 1);

    assert!(matches!(
        sched.cancel(id),
        Err(SchedulerError::InvalidTransition { .. })
    ));
    assert!(matches!(
        sched.cancel(nightshift::util::TaskId::new()),
        Err(SchedulerError::TaskNotFound(_))
    ));
}

#[tokio::test]
async fn test_running_task_cannot_be_cancelled() {
    let handler = ScriptedHandler::new();
    handler.block(1);
    let sched = scheduler(fast_config(), Arc::new(InMemoryQueueStore::new()), handler.registry());
    let id = sched.submit(unit(TaskKind::Mastering, 1)).unwrap();

    let run = spawn_loop(&sched);
    within(async {
        while sched.task(id).map(|t| t.state) != Some(TaskState::Running) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    assert!(matches!(
        sched.cancel(id),
        Err(SchedulerError::InvalidTransition { .. })
    ));
    run.abort();
}

#[tokio::test]
async fn test_wait_on_unknown_task() {
    let sched = scheduler(
        fast_config(),
        Arc::new(InMemoryQueueStore::new()),
        HandlerRegistry::new(),
    );
    let err = sched.wait(nightshift::util::TaskId::new()).await.unwrap_err();
    assert!(matches!(err, SchedulerError::TaskNotFound(_)));
}

#[tokio::test]
async fn test_estimate_completion_sums_queue() {
    let clock = ManualClock::at_hour(9);
    let sched = scheduler_at(
        fast_config(),
        Arc::new(InMemoryQueueStore::new()),
        HandlerRegistry::new(),
        idle_probe(),
        clock.clone(),
    );
    sched
        .submit(labelled(TaskKind::Synthesis, Priority::Normal, "a").with_estimate(30.0))
        .unwrap();
    sched
        .submit(labelled(TaskKind::Mastering, Priority::Low, "b").with_estimate(45.0))
        .unwrap();

    let estimate = sched.estimate_completion();
    assert_eq!(estimate.tasks_remaining, 2);
    assert!((estimate.total_minutes - 75.0).abs() < 1e-9);
    assert_eq!(
        estimate.completion_at - clock.now(),
        chrono::Duration::minutes(75)
    );
}

#[tokio::test]
async fn test_snapshot_restores_pending_tasks() {
    let store = Arc::new(InMemoryQueueStore::new());
    let first = scheduler(fast_config(), Arc::clone(&store) as Arc<dyn QueueStore>, HandlerRegistry::new());
    let low = first.submit(labelled(TaskKind::Mastering, Priority::Low, "low")).unwrap();
    let critical = first
        .submit(labelled(TaskKind::Mastering, Priority::Critical, "critical"))
        .unwrap();
    let normal = first.submit(labelled(TaskKind::Mastering, Priority::Normal, "normal")).unwrap();

    let snapshot = store.load().unwrap().unwrap();
    let saved: Vec<_> = snapshot.pending_tasks.iter().map(|t| t.id).collect();
    assert_eq!(saved, vec![critical, normal, low]);

    // A second process over the same store picks the queue back up.
    let handler = ScriptedHandler::new();
    let mut restoring = fast_config();
    restoring.restore_pending = true;
    let second = scheduler(restoring, Arc::clone(&store) as Arc<dyn QueueStore>, handler.registry());
    let restored: Vec<_> = second.pending().iter().map(|t| t.id).collect();
    assert_eq!(restored, saved);

    within(second.run_until_empty()).await.unwrap();
    assert_eq!(handler.labels(), vec!["critical", "normal", "low"]);
    assert!(within(second.wait(low)).await.unwrap().succeeded());
    assert!(store.load().unwrap().unwrap().pending_tasks.is_empty());
}

#[tokio::test]
async fn test_snapshot_not_restored_by_default() {
    let store = Arc::new(InMemoryQueueStore::new());
    let first = scheduler(fast_config(), Arc::clone(&store) as Arc<dyn QueueStore>, HandlerRegistry::new());
    first.submit(labelled(TaskKind::Mastering, Priority::Low, "low")).unwrap();

    let second = scheduler(fast_config(), Arc::clone(&store) as Arc<dyn QueueStore>, HandlerRegistry::new());
    assert!(second.pending().is_empty());
}

#[tokio::test]
async fn test_persistence_failure_stops_run_loop() {
    let store = Arc::new(FlakyQueueStore::default());
    let handler = ScriptedHandler::new();
    let sched = scheduler(fast_config(), Arc::clone(&store) as Arc<dyn QueueStore>, handler.registry());

    let id = sched.submit(labelled(TaskKind::Mastering, Priority::Normal, "kept")).unwrap();
    let waiter = {
        let sched = sched.clone();
        tokio::spawn(async move { sched.wait(id).await })
    };
    tokio::task::yield_now().await;

    store.break_writes();
    let err = sched
        .submit(labelled(TaskKind::Mastering, Priority::Normal, "rolled-back"))
        .unwrap_err();
    assert!(matches!(err, SchedulerError::Persistence(_)));
    assert_eq!(sched.pending().len(), 1);

    let err = within(sched.run_loop()).await.unwrap_err();
    assert!(matches!(err, SchedulerError::Persistence(_)));
    assert!(handler.calls().is_empty());
    assert!(matches!(
        within(waiter).await.unwrap(),
        Err(SchedulerError::Stopped(_))
    ));
}

#[tokio::test]
async fn test_stop_lets_running_task_finish() {
    let handler = ScriptedHandler::new().with_delay(Duration::from_millis(100));
    let sched = scheduler(fast_config(), Arc::new(InMemoryQueueStore::new()), handler.registry());
    let first = sched.submit(labelled(TaskKind::Mastering, Priority::High, "first")).unwrap();
    let second = sched.submit(labelled(TaskKind::Mastering, Priority::Low, "second")).unwrap();

    let run = spawn_loop(&sched);
    within(async {
        while sched.status().await.running == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    sched.stop();
    within(run).await.unwrap().unwrap();

    assert_eq!(sched.task(first).unwrap().state, TaskState::Completed);
    assert_eq!(sched.task(second).unwrap().state, TaskState::Queued);
    assert_eq!(handler.labels(), vec!["first"]);
}

#[tokio::test]
async fn test_stop_without_running_loop_does_not_block_next_run() {
    let handler = ScriptedHandler::new();
    let sched = scheduler(fast_config(), Arc::new(InMemoryQueueStore::new()), handler.registry());
    sched.stop();

    let id = sched.submit(labelled(TaskKind::Mastering, Priority::Normal, "late")).unwrap();
    within(sched.run_until_empty()).await.unwrap();

    assert_eq!(sched.task(id).unwrap().state, TaskState::Completed);
    assert_eq!(handler.labels(), vec!["late"]);
}

#[tokio::test]
async fn test_finished_tasks_are_retained_up_to_the_limit() {
    let handler = ScriptedHandler::new();
    let sched = scheduler(
        fast_config().with_finished_retention(50),
        Arc::new(InMemoryQueueStore::new()),
        handler.registry(),
    );
    let requests = (0..300).map(|n| labelled(TaskKind::Packaging, Priority::Normal, &format!("pkg-{n}")));
    let ids = sched.submit_batch(requests).unwrap();
    let cancelled = sched.submit(labelled(TaskKind::Packaging, Priority::Low, "dropped")).unwrap();
    sched.cancel(cancelled).unwrap();
    within(sched.run_until_empty()).await.unwrap();

    let status = sched.status().await;
    assert_eq!(status.completed, 300);
    assert_eq!(status.cancelled, 1);
    assert_eq!(sched.retained_finished(), 50);

    // The oldest outcomes are gone, the most recent are still served.
    assert!(sched.task(cancelled).is_none());
    assert!(sched.task(ids[0]).is_none());
    assert!(matches!(
        within(sched.wait(ids[0])).await,
        Err(SchedulerError::TaskNotFound(_))
    ));
    let last = *ids.last().unwrap();
    assert_eq!(within(sched.wait(last)).await.unwrap().state, TaskState::Completed);
    assert_eq!(sched.task(ids[250]).unwrap().state, TaskState::Completed);
    assert!(sched.task(ids[249]).is_none());
}

#[tokio::test]
async fn test_audit_records_lifecycle() {
    let handler = ScriptedHandler::new();
    let audit = InMemoryAuditSink::new(64);
    let sched = scheduler(fast_config(), Arc::new(InMemoryQueueStore::new()), handler.registry())
        .with_audit(Box::new(audit.clone()));

    let done = sched.submit(labelled(TaskKind::Mastering, Priority::Normal, "done")).unwrap();
    let dropped = sched.submit(labelled(TaskKind::Mastering, Priority::Low, "dropped")).unwrap();
    sched.cancel(dropped).unwrap();
    within(sched.run_until_empty()).await.unwrap();

    let actions = |id: nightshift::util::TaskId| -> Vec<String> {
        audit.events_for(id).into_iter().map(|e| e.action).collect()
    };
    assert_eq!(actions(done), vec!["submit", "start", "complete"]);
    assert_eq!(actions(dropped), vec!["submit", "cancel"]);
}

#[tokio::test]
async fn test_progress_reaches_running_task() {
    let handler = ScriptedHandler::new();
    handler.block(1);
    let sched = scheduler(fast_config(), Arc::new(InMemoryQueueStore::new()), handler.registry());
    let id = sched
        .submit(unit(TaskKind::Mastering, 1).with_estimate(10.0))
        .unwrap();

    let run = spawn_loop(&sched);
    within(async {
        while sched.task(id).map(|t| t.progress) != Some(0.5) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    let estimate = sched.estimate_completion();
    assert_eq!(estimate.tasks_remaining, 1);
    assert!((estimate.total_minutes - 5.0).abs() < 1e-9);
    run.abort();
}
