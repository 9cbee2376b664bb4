//! # duraq
//!
//! duraq is a durable, relational-database-backed task queue. Producers
//! enqueue typed units of work with opaque JSON payloads; per-type
//! processors claim eligible rows in atomic batches and dispatch each task
//! to a handler inside a bounded worker pool; the outcome (success,
//! retryable failure, permanent failure, cancellation) is persisted on the
//! row. Two background maintenance loops keep the queue healthy: a *healer*
//! that resurrects tasks stuck mid-processing and a *cleaner* that
//! garbage-collects terminal tasks past a retention window.
//!
//! ## Architecture Overview
//!
//! - **Task table**: one row per task, with a unique `(type, external_id)`
//!   idempotency key and a `next_attempt_at` ordering column. PostgreSQL,
//!   SQLite, and in-memory backends implement the same storage contract.
//! - **Claim**: `new`/`error` rows whose `next_attempt_at` has passed are
//!   atomically flipped to `pending` inside one transaction, so a task is
//!   dispatched exactly once no matter how many processes poll the table.
//!   (Handler side effects must still be idempotent; execution is
//!   at-least-once across crashes.)
//! - **Processor**: per task type, a tick-driven fetch loop feeding a
//!   semaphore-bounded worker pool. Handlers run under a wall-clock budget
//!   with panic containment; before/after hooks persist the state
//!   transitions.
//! - **Healer / cleaner**: periodic loops per task type that cure stuck
//!   rows back to `error` and delete terminal rows past retention.
//!
//! ## Example
//!
//! ```rust,ignore
//! use duraq::{
//!     HandlerFn, ProcessorOptions, QueueContext, Task, TaskManager, TaskQueue,
//!     create_task_storage,
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let storage = create_task_storage("postgres://localhost/queue").await?;
//!
//!     let manager = TaskManager::new(storage.clone());
//!     let ctx = QueueContext::new().with_value("tenant", "acme".into());
//!     manager
//!         .enqueue(&ctx, &Task::new("email", r#"{"to":"a@example.com"}"#))
//!         .await?;
//!
//!     let mut queue = TaskQueue::new(storage);
//!     queue.register(
//!         "email",
//!         Arc::new(HandlerFn::new(|ctx: QueueContext, task: Task| async move {
//!             // tenant round-trips: ctx.value("tenant") == Some("acme")
//!             send_email(&task.payload).await?;
//!             Ok(())
//!         })),
//!         ProcessorOptions::default(),
//!     );
//!
//!     let shutdown = CancellationToken::new();
//!     queue.run(&shutdown)?;
//!     tokio::signal::ctrl_c().await?;
//!     queue.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Error Handling
//!
//! Library error strings use the format
//! `error-duraq-<domain>-<number> <message>: <details>`. The processing
//! sentinels (`task canceled`, `task processing timeout: …`) are uncoded
//! because their text is part of the persisted `errors` log contract.

/// Cancellation-aware context carrying task metadata between producers and
/// consumers.
pub mod context;

pub mod errors;

/// High-level enqueue/query façade over task storage.
pub mod manager;

/// Metrics collection for queue observability.
///
/// Names the series the queue emits (enqueue volume, processing outcomes,
/// retry attempts, maintenance passes, worker slots) behind a trait with
/// statsd and no-op backends.
pub mod metrics;

/// Queue processing: per-type processors, hooks, and the healer/cleaner
/// maintenance loops.
pub mod queue;

/// Retry-delay schedules mapping attempt counts to next-attempt times.
pub mod retry;

/// Storage layer: the task table contract with PostgreSQL, SQLite, and
/// in-memory backends.
pub mod storage;

/// Task entity, status machine, and metadata.
pub mod task;

#[cfg(test)]
pub mod test_helpers;

pub use context::QueueContext;
pub use errors::{ProcessError, QueueError, StorageError};
pub use manager::TaskManager;
pub use metrics::{
    NoOpQueueMetrics, QueueMetrics, QueueOperation, SharedQueueMetrics, StatsdQueueMetrics,
};
pub use queue::{
    HandlerFn, NoopTaskHandler, ProcessorOptions, QueueProcessor, TaskHandler, TaskQueue,
};
pub use retry::{
    round_step_delay, static_delay, step_delay, NextAttemptFn, FIBONACCI_PERIODS, STRONG_PERIODS,
};
pub use storage::{
    create_task_storage, MemoryTaskStorage, PostgresTaskStorage, SharedTaskStorage,
    SqliteTaskStorage, TaskFilter, TaskStorage,
};
pub use task::{Metadata, Task, TaskStatus};
