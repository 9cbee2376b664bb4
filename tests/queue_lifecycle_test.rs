//! End-to-end lifecycle tests for the queue: enqueue, claim, dispatch,
//! outcome persistence, graceful shutdown, and maintenance rescue. All run
//! against the in-memory storage backend.

use duraq::{
    HandlerFn, Metadata, MemoryTaskStorage, ProcessError, ProcessorOptions, QueueContext, Task,
    TaskManager, TaskQueue, TaskStatus, TaskStorage,
};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// Opt into queue logs with e.g. RUST_LOG=duraq=debug.
static TRACING: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
});

async fn wait_for_status(
    storage: &MemoryTaskStorage,
    id: Uuid,
    status: TaskStatus,
    deadline: Duration,
) -> Task {
    let end = tokio::time::Instant::now() + deadline;
    loop {
        if let Ok(task) = storage.get_task(id).await {
            if task.status == status {
                return task;
            }
        }
        assert!(
            tokio::time::Instant::now() < end,
            "task {id} never reached status {status}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn fast_options() -> ProcessorOptions {
    Lazy::force(&TRACING);
    ProcessorOptions::default().with_fetch_tick(Duration::from_millis(20))
}

#[tokio::test]
async fn test_happy_path_new_to_done() {
    let storage = Arc::new(MemoryTaskStorage::new());
    let manager = TaskManager::new(storage.clone());

    let task = Task::new("happy", r#"{"n":1}"#);
    manager.enqueue(&QueueContext::new(), &task).await.unwrap();

    let mut queue = TaskQueue::new(storage.clone());
    queue.register(
        "happy",
        Arc::new(HandlerFn::new(|_ctx: QueueContext, _task: Task| async {
            Ok::<(), ProcessError>(())
        })),
        fast_options().with_workers(1),
    );

    let shutdown = CancellationToken::new();
    queue.run(&shutdown).unwrap();

    let done = wait_for_status(&storage, task.id, TaskStatus::Done, Duration::from_secs(2)).await;
    assert_eq!(done.attempts, 0);
    assert!(done.errors.is_none());
    assert!(done.updated_at.is_some());

    queue.stop().await;
}

#[tokio::test]
async fn test_timeout_counts_attempt_and_schedules_retry() {
    let storage = Arc::new(MemoryTaskStorage::new());
    let manager = TaskManager::new(storage.clone());

    let task = Task::new("slow", "{}");
    manager.enqueue(&QueueContext::new(), &task).await.unwrap();

    let mut queue = TaskQueue::new(storage.clone());
    queue.register(
        "slow",
        Arc::new(HandlerFn::new(|_ctx: QueueContext, _task: Task| async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok::<(), ProcessError>(())
        })),
        fast_options()
            .with_task_timeout(Duration::from_millis(50))
            .with_max_attempts(5)
            .with_next_attempt_at(duraq::static_delay(Duration::from_secs(60))),
    );

    let shutdown = CancellationToken::new();
    queue.run(&shutdown).unwrap();

    let failed =
        wait_for_status(&storage, task.id, TaskStatus::Error, Duration::from_secs(2)).await;
    assert_eq!(failed.attempts, 1);
    assert!(failed
        .errors
        .as_deref()
        .unwrap()
        .contains("attempt 1: task processing timeout: 50ms"));

    let wait = failed.next_attempt_at - chrono::Utc::now();
    assert!(wait > chrono::Duration::seconds(50), "wait was {wait}");
    assert!(wait <= chrono::Duration::seconds(61), "wait was {wait}");

    queue.stop().await;
}

#[tokio::test]
async fn test_max_attempts_exhausted_is_terminal() {
    let storage = Arc::new(MemoryTaskStorage::new());
    let manager = TaskManager::new(storage.clone());

    let task = Task::new("failing", "{}");
    manager.enqueue(&QueueContext::new(), &task).await.unwrap();

    let mut queue = TaskQueue::new(storage.clone());
    queue.register(
        "failing",
        Arc::new(HandlerFn::new(|_ctx: QueueContext, _task: Task| async {
            Err::<(), _>(ProcessError::failed("boom"))
        })),
        fast_options().with_max_attempts(1),
    );

    let shutdown = CancellationToken::new();
    queue.run(&shutdown).unwrap();

    let exhausted = wait_for_status(
        &storage,
        task.id,
        TaskStatus::AttemptsLeft,
        Duration::from_secs(2),
    )
    .await;
    assert_eq!(exhausted.attempts, 1);
    assert_eq!(exhausted.errors.as_deref(), Some("attempt 1: boom\n"));

    // Terminal: no further claims happen.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let still = storage.get_task(task.id).await.unwrap();
    assert_eq!(still.status, TaskStatus::AttemptsLeft);
    assert_eq!(still.attempts, 1);

    queue.stop().await;
}

#[tokio::test]
async fn test_handler_cancel_is_terminal_without_attempt() {
    let storage = Arc::new(MemoryTaskStorage::new());
    let manager = TaskManager::new(storage.clone());

    let task = Task::new("cancelable", "{}");
    manager.enqueue(&QueueContext::new(), &task).await.unwrap();

    let mut queue = TaskQueue::new(storage.clone());
    queue.register(
        "cancelable",
        Arc::new(HandlerFn::new(|_ctx: QueueContext, _task: Task| async {
            Err::<(), _>(ProcessError::Canceled)
        })),
        fast_options(),
    );

    let shutdown = CancellationToken::new();
    queue.run(&shutdown).unwrap();

    let canceled = wait_for_status(
        &storage,
        task.id,
        TaskStatus::Canceled,
        Duration::from_secs(2),
    )
    .await;
    assert_eq!(canceled.attempts, 0);

    queue.stop().await;
}

#[tokio::test]
async fn test_graceful_stop_requeues_in_flight_tasks() {
    let storage = Arc::new(MemoryTaskStorage::new());
    let manager = TaskManager::new(storage.clone());

    let mut ids = Vec::new();
    for i in 0..10 {
        let task = Task::with_external_id("draining", "{}", format!("drain-{i}"));
        ids.push(task.id);
        manager.enqueue(&QueueContext::new(), &task).await.unwrap();
    }

    let mut queue = TaskQueue::new(storage.clone());
    queue.register(
        "draining",
        Arc::new(HandlerFn::new(|ctx: QueueContext, _task: Task| async move {
            tokio::select! {
                () = ctx.cancellation().cancelled() => Err(ProcessError::Shutdown),
                () = tokio::time::sleep(Duration::from_millis(90)) => Ok(()),
            }
        })),
        fast_options()
            .with_fetch_tick(Duration::from_millis(10))
            .with_workers(1)
            .with_fetch_max_tasks(100),
    );

    let shutdown = CancellationToken::new();
    queue.run(&shutdown).unwrap();

    // Let roughly one task finish, then stop mid-flight.
    tokio::time::sleep(Duration::from_millis(150)).await;
    queue.stop().await;

    let mut by_status: HashMap<TaskStatus, usize> = HashMap::new();
    for id in &ids {
        let task = storage.get_task(*id).await.unwrap();
        *by_status.entry(task.status).or_default() += 1;
        assert_eq!(task.attempts, 0, "shutdown must not count attempts");
    }

    // Completed work stays done, the in-flight and queued tasks went back
    // to new, and nothing is left processing after stop returns.
    assert!(by_status.get(&TaskStatus::Done).copied().unwrap_or(0) >= 1);
    assert!(by_status.get(&TaskStatus::New).copied().unwrap_or(0) >= 1);
    assert_eq!(by_status.get(&TaskStatus::Processing).copied().unwrap_or(0), 0);
    for status in by_status.keys() {
        assert!(
            matches!(
                status,
                TaskStatus::Done | TaskStatus::New | TaskStatus::Pending
            ),
            "unexpected status {status} after stop"
        );
    }
}

#[tokio::test]
async fn test_each_task_is_dispatched_exactly_once() {
    let storage = Arc::new(MemoryTaskStorage::new());
    let manager = TaskManager::new(storage.clone());

    let mut ids = Vec::new();
    for i in 0..20 {
        let task = Task::with_external_id("counted", "{}", format!("count-{i}"));
        ids.push(task.id);
        manager.enqueue(&QueueContext::new(), &task).await.unwrap();
    }

    let seen: Arc<Mutex<HashMap<Uuid, usize>>> = Arc::new(Mutex::new(HashMap::new()));
    let seen_in_handler = seen.clone();

    let mut queue = TaskQueue::new(storage.clone());
    queue.register(
        "counted",
        Arc::new(HandlerFn::new(move |_ctx: QueueContext, task: Task| {
            let seen = seen_in_handler.clone();
            async move {
                *seen.lock().entry(task.id).or_default() += 1;
                Ok::<(), ProcessError>(())
            }
        })),
        fast_options()
            .with_fetch_tick(Duration::from_millis(10))
            .with_workers(4),
    );

    let shutdown = CancellationToken::new();
    queue.run(&shutdown).unwrap();

    for id in &ids {
        wait_for_status(&storage, *id, TaskStatus::Done, Duration::from_secs(3)).await;
    }
    queue.stop().await;

    let seen = seen.lock();
    for id in &ids {
        assert_eq!(seen.get(id), Some(&1), "task {id} not handled exactly once");
    }
}

#[tokio::test]
async fn test_metadata_round_trips_from_producer_to_consumer() {
    let storage = Arc::new(MemoryTaskStorage::new());
    let manager = TaskManager::new(storage.clone());

    let observed: Arc<Mutex<Option<Metadata>>> = Arc::new(Mutex::new(None));
    let observed_in_handler = observed.clone();

    let task = Task::new("annotated", "{}");
    let ctx = QueueContext::new()
        .with_value("tenant", json!("acme"))
        .with_value("request_id", json!("r-42"));
    manager.enqueue(&ctx, &task).await.unwrap();

    let mut queue = TaskQueue::new(storage.clone());
    queue.register(
        "annotated",
        Arc::new(HandlerFn::new(move |ctx: QueueContext, _task: Task| {
            let observed = observed_in_handler.clone();
            async move {
                *observed.lock() = Some(ctx.values());
                Ok::<(), ProcessError>(())
            }
        })),
        fast_options(),
    );

    let shutdown = CancellationToken::new();
    queue.run(&shutdown).unwrap();
    wait_for_status(&storage, task.id, TaskStatus::Done, Duration::from_secs(2)).await;
    queue.stop().await;

    let values = observed.lock().clone().expect("handler never ran");
    assert_eq!(values.get("tenant"), Some(&json!("acme")));
    assert_eq!(values.get("request_id"), Some(&json!("r-42")));
}

#[tokio::test]
async fn test_panic_is_contained_and_row_left_for_healer() {
    let storage = Arc::new(MemoryTaskStorage::new());
    let manager = TaskManager::new(storage.clone());

    let panicking = Task::with_external_id("panicky", "{}", "boom-1");
    manager
        .enqueue(&QueueContext::new(), &panicking)
        .await
        .unwrap();

    let mut queue = TaskQueue::new(storage.clone());
    queue.register(
        "panicky",
        Arc::new(HandlerFn::new(|_ctx: QueueContext, task: Task| async move {
            if task.external_id == "boom-1" {
                panic!("handler exploded");
            }
            Ok::<(), ProcessError>(())
        })),
        fast_options().with_workers(2),
    );

    let shutdown = CancellationToken::new();
    queue.run(&shutdown).unwrap();

    // The panicking task parks in processing.
    wait_for_status(
        &storage,
        panicking.id,
        TaskStatus::Processing,
        Duration::from_secs(2),
    )
    .await;

    // The processor survives and keeps handling other tasks.
    let healthy = Task::with_external_id("panicky", "{}", "fine-1");
    manager
        .enqueue(&QueueContext::new(), &healthy)
        .await
        .unwrap();
    wait_for_status(&storage, healthy.id, TaskStatus::Done, Duration::from_secs(2)).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    let parked = storage.get_task(panicking.id).await.unwrap();
    assert_eq!(parked.status, TaskStatus::Processing);

    queue.stop().await;
}

#[tokio::test]
async fn test_healer_rescues_frozen_task_through_processor() {
    let storage = Arc::new(MemoryTaskStorage::new());

    // A task orphaned two hours ago by a dead worker.
    let mut frozen = Task::new("rescued", "{}");
    frozen.status = TaskStatus::Processing;
    frozen.updated_at = Some(chrono::Utc::now() - chrono::Duration::hours(2));
    storage.hard_update_task(frozen.clone()).await;

    let mut queue = TaskQueue::new(storage.clone());
    queue.register(
        "rescued",
        Arc::new(HandlerFn::new(|_ctx: QueueContext, _task: Task| async {
            Ok::<(), ProcessError>(())
        })),
        fast_options().with_healer(duraq::queue::MaintenanceOptions {
            period: Duration::from_millis(30),
            timeout: Duration::from_secs(5),
            updated_ago: Duration::from_secs(3600),
        }),
    );

    let shutdown = CancellationToken::new();
    queue.run(&shutdown).unwrap();

    // Cured back to claimable, then processed to completion.
    let done =
        wait_for_status(&storage, frozen.id, TaskStatus::Done, Duration::from_secs(3)).await;
    assert!(done
        .errors
        .as_deref()
        .unwrap()
        .contains(": task is frozen\n"));
    assert_eq!(done.attempts, 0, "curing must not count an attempt");

    queue.stop().await;
}

#[tokio::test]
async fn test_cleaner_deletes_terminal_tasks_past_retention() {
    let storage = Arc::new(MemoryTaskStorage::new());

    let mut expired = Task::new("cleaned", "{}");
    expired.status = TaskStatus::Done;
    expired.updated_at = Some(chrono::Utc::now() - chrono::Duration::hours(4));
    storage.hard_update_task(expired.clone()).await;

    let mut recent = Task::new("cleaned", "{}");
    recent.status = TaskStatus::Done;
    recent.updated_at = Some(chrono::Utc::now());
    storage.hard_update_task(recent.clone()).await;

    let mut queue = TaskQueue::new(storage.clone());
    queue.register(
        "cleaned",
        Arc::new(duraq::NoopTaskHandler),
        fast_options().with_cleaner(duraq::queue::MaintenanceOptions {
            period: Duration::from_millis(30),
            timeout: Duration::from_secs(5),
            updated_ago: Duration::from_secs(3 * 3600),
        }),
    );

    let shutdown = CancellationToken::new();
    queue.run(&shutdown).unwrap();

    let end = tokio::time::Instant::now() + Duration::from_secs(2);
    while storage.get_task(expired.id).await.is_ok() {
        assert!(
            tokio::time::Instant::now() < end,
            "cleaner never deleted the expired task"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Retention spares the fresh terminal row.
    assert!(storage.get_task(recent.id).await.is_ok());

    queue.stop().await;
}

#[tokio::test]
async fn test_top_level_cancellation_cascades() {
    let storage = Arc::new(MemoryTaskStorage::new());
    let manager = TaskManager::new(storage.clone());

    let task = Task::new("cascaded", "{}");
    manager.enqueue(&QueueContext::new(), &task).await.unwrap();

    let mut queue = TaskQueue::new(storage.clone());
    queue.register(
        "cascaded",
        Arc::new(HandlerFn::new(|_ctx: QueueContext, _task: Task| async {
            Ok::<(), ProcessError>(())
        })),
        fast_options(),
    );

    let shutdown = CancellationToken::new();
    queue.run(&shutdown).unwrap();
    wait_for_status(&storage, task.id, TaskStatus::Done, Duration::from_secs(2)).await;

    // Cancelling the top-level token stops the loops; stop() then drains
    // without hanging.
    shutdown.cancel();
    queue.stop().await;

    // No further claims after shutdown.
    let late = Task::new("cascaded", "{}");
    manager.enqueue(&QueueContext::new(), &late).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        storage.get_task(late.id).await.unwrap().status,
        TaskStatus::New
    );
}
