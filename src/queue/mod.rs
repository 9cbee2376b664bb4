//! Queue processing: per-type processors, their hooks, and the maintenance
//! loops that keep the table healthy.
//!
//! [`TaskQueue`] is the top-level coordinator: register one handler per task
//! type, then [`run`](TaskQueue::run) to start every processor (each with
//! its own fetch loop, worker pool, healer, and cleaner) and
//! [`stop`](TaskQueue::stop) for a graceful shutdown.

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub mod cleaner;
pub mod healer;
pub mod hooks;
mod maintenance;
pub mod processor;

pub use cleaner::QueueCleaner;
pub use healer::{QueueHealer, FROZEN_TASK_NOTE};
pub use hooks::{
    AfterProcessingHook, BeforeProcessingHook, LogAfter, LogBefore, MarkProcessing, PersistOutcome,
};
pub use processor::{MaintenanceOptions, PanicHandler, ProcessorOptions, QueueProcessor};

use crate::context::QueueContext;
use crate::errors::{ProcessError, QueueError};
use crate::metrics::{NoOpQueueMetrics, SharedQueueMetrics};
use crate::storage::SharedTaskStorage;
use crate::task::Task;

/// Processes a single task.
///
/// Return `Ok(())` for success, [`ProcessError::Canceled`] to move the task
/// to the terminal `canceled` status, [`ProcessError::Shutdown`] when the
/// context's cancellation token fired, and any other error for a retryable
/// failure. Handlers should honor `ctx.cancellation()` at their own
/// suspension points; side effects must be idempotent since dispatch is
/// exactly-once but execution is not.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, ctx: &QueueContext, task: &Task) -> Result<(), ProcessError>;
}

/// Adapter that lets an async closure act as a [`TaskHandler`].
pub struct HandlerFn<F>(F);

impl<F> HandlerFn<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> TaskHandler for HandlerFn<F>
where
    F: Fn(QueueContext, Task) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ProcessError>> + Send,
{
    async fn handle(&self, ctx: &QueueContext, task: &Task) -> Result<(), ProcessError> {
        (self.0)(ctx.clone(), task.clone()).await
    }
}

/// Handler that logs the task and succeeds. Useful for wiring tests.
pub struct NoopTaskHandler;

#[async_trait]
impl TaskHandler for NoopTaskHandler {
    async fn handle(&self, _ctx: &QueueContext, task: &Task) -> Result<(), ProcessError> {
        info!(task_id = %task.id, task_type = %task.task_type, handler = "noop", "process task");
        Ok(())
    }
}

/// Top-level coordinator for multiple per-type processors sharing one
/// storage backend.
pub struct TaskQueue {
    storage: SharedTaskStorage,
    metrics: SharedQueueMetrics,
    processors: HashMap<String, QueueProcessor>,
}

impl TaskQueue {
    pub fn new(storage: SharedTaskStorage) -> Self {
        Self::with_metrics(storage, Arc::new(NoOpQueueMetrics::new()))
    }

    pub fn with_metrics(storage: SharedTaskStorage, metrics: SharedQueueMetrics) -> Self {
        Self {
            storage,
            metrics,
            processors: HashMap::new(),
        }
    }

    /// Register a processor for a task type. Call before [`run`](Self::run).
    /// Registering the same type again replaces the previous processor.
    pub fn register(
        &mut self,
        task_type: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
        options: ProcessorOptions,
    ) {
        let task_type = task_type.into();
        let processor = QueueProcessor::new(
            Arc::clone(&self.storage),
            task_type.clone(),
            handler,
            options,
            Arc::clone(&self.metrics),
        );
        self.processors.insert(task_type, processor);
    }

    /// Look up a registered processor, e.g. to tune its maintenance loops.
    pub fn processor(&self, task_type: &str) -> Option<&QueueProcessor> {
        self.processors.get(task_type)
    }

    /// Start every registered processor. Non-blocking; the loops run until
    /// [`stop`](Self::stop) or until `shutdown` is cancelled.
    pub fn run(&self, shutdown: &CancellationToken) -> Result<(), QueueError> {
        if self.processors.is_empty() {
            return Err(QueueError::NoProcessors);
        }

        let mut run_err = None;
        for processor in self.processors.values() {
            if let Err(err) = processor.run(shutdown) {
                error!(error = %err, processor = %processor.name(), "failed to run processor");
                run_err = Some(err);
            }
        }

        match run_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Gracefully shut down all processors, concurrently, and wait for each
    /// to drain.
    pub async fn stop(&self) {
        futures::future::join_all(
            self.processors
                .values()
                .map(|processor| processor.stop()),
        )
        .await;
    }
}
