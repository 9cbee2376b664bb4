//! Hooks running around each handler invocation.
//!
//! The default before-chain marks the task `processing` in storage and logs
//! it; the default after-chain classifies the handler outcome into the
//! persisted state and logs the result. User hooks are appended after the
//! defaults, so they observe the final persisted status. To run user hooks
//! before the persist, replace the after-chain and include
//! [`PersistOutcome`] at the position of choice.

use async_trait::async_trait;
use tracing::{error, info};

use crate::context::QueueContext;
use crate::errors::ProcessError;
use crate::metrics::SharedQueueMetrics;
use crate::retry::NextAttemptFn;
use crate::storage::SharedTaskStorage;
use crate::task::{Task, TaskStatus};

/// Hook called before task processing begins.
#[async_trait]
pub trait BeforeProcessingHook: Send + Sync {
    async fn call(&self, ctx: &QueueContext, task: &mut Task);
}

/// Hook called after task processing completes.
#[async_trait]
pub trait AfterProcessingHook: Send + Sync {
    async fn call(&self, ctx: &QueueContext, task: &mut Task, result: &Result<(), ProcessError>);
}

/// Default before-hook: move the task to `processing` and persist the
/// transition so the healer can spot workers that died mid-flight.
pub struct MarkProcessing {
    storage: SharedTaskStorage,
}

impl MarkProcessing {
    pub fn new(storage: SharedTaskStorage) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl BeforeProcessingHook for MarkProcessing {
    async fn call(&self, _ctx: &QueueContext, task: &mut Task) {
        task.status = TaskStatus::Processing;
        if let Err(err) = self.storage.update_task(task.id, task).await {
            error!(error = %err, task_id = %task.id, "failed to update task state");
        }
    }
}

/// Default log line before processing the task.
pub struct LogBefore;

#[async_trait]
impl BeforeProcessingHook for LogBefore {
    async fn call(&self, _ctx: &QueueContext, task: &mut Task) {
        info!(
            task_id = %task.id,
            external_id = %task.external_id,
            task_type = %task.task_type,
            status = %task.status,
            attempts = task.attempts,
            created_at = %task.created_at,
            updated_at = ?task.updated_at,
            "processing task"
        );
    }
}

/// Default after-hook: the outcome classifier. Decides the persisted state
/// from the handler result and writes it back.
pub struct PersistOutcome {
    storage: SharedTaskStorage,
    max_attempts: i32,
    next_attempt_at: NextAttemptFn,
    metrics: SharedQueueMetrics,
}

impl PersistOutcome {
    pub fn new(
        storage: SharedTaskStorage,
        max_attempts: i32,
        next_attempt_at: NextAttemptFn,
        metrics: SharedQueueMetrics,
    ) -> Self {
        Self {
            storage,
            max_attempts: max_attempts.max(1),
            next_attempt_at,
            metrics,
        }
    }
}

#[async_trait]
impl AfterProcessingHook for PersistOutcome {
    async fn call(&self, _ctx: &QueueContext, task: &mut Task, result: &Result<(), ProcessError>) {
        match result {
            Ok(()) => {
                task.status = TaskStatus::Done;
            }
            Err(ProcessError::Canceled) => {
                task.status = TaskStatus::Canceled;
            }
            Err(ProcessError::Shutdown) => {
                requeue_task(self.storage.as_ref(), task).await;
                return;
            }
            Err(err) => {
                task.attempts = (task.attempts + 1).max(1);
                task.add_error(err);
                if task.attempts >= self.max_attempts {
                    task.status = TaskStatus::AttemptsLeft;
                } else {
                    task.status = TaskStatus::Error;
                    task.next_attempt_at = (self.next_attempt_at)(task.attempts);
                }
            }
        }

        if let Err(err) = self.storage.update_task(task.id, task).await {
            error!(error = %err, task_id = %task.id, "failed to update task state");
        }

        self.metrics
            .task_processed(&task.task_type, task.status)
            .await;
        self.metrics
            .task_attempts(&task.task_type, task.attempts)
            .await;
    }
}

/// Default log line after processing the task.
pub struct LogAfter;

#[async_trait]
impl AfterProcessingHook for LogAfter {
    async fn call(&self, _ctx: &QueueContext, task: &mut Task, result: &Result<(), ProcessError>) {
        match result {
            Ok(()) => {
                info!(
                    task_id = %task.id,
                    task_type = %task.task_type,
                    status = %task.status,
                    "processed task successfully"
                );
            }
            Err(err) => {
                error!(
                    task_id = %task.id,
                    external_id = %task.external_id,
                    task_type = %task.task_type,
                    status = %task.status,
                    attempts = task.attempts,
                    errors = task.errors.as_deref().unwrap_or(""),
                    error = %err,
                    "failed to process task"
                );
            }
        }
    }
}

/// Return a task to the queue during graceful shutdown: back to `new`, no
/// attempt counted. The write runs on a storage call that observes no
/// cancellation, so shutdown cannot truncate it.
pub(crate) async fn requeue_task(storage: &dyn crate::storage::TaskStorage, task: &mut Task) {
    info!(task_id = %task.id, "graceful shutdown: return task to queue");
    task.status = TaskStatus::New;
    if let Err(err) = storage.update_task(task.id, task).await {
        error!(error = %err, task_id = %task.id, "failed to update task state");
    }
}
