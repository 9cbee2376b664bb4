//! High-level enqueue/query façade over task storage.

use std::sync::Arc;
use tracing::{error, warn};
use uuid::Uuid;

use crate::context::QueueContext;
use crate::errors::StorageError;
use crate::metrics::{NoOpQueueMetrics, SharedQueueMetrics};
use crate::storage::{SharedTaskStorage, TaskFilter};
use crate::task::Task;

/// Payloads above this size get a warning; large rows slow down insert and
/// fetch.
const BIG_PAYLOAD_BYTES: usize = 100 * 1024;

/// Combines validation, metrics, and storage access behind a single
/// producer-facing API.
#[derive(Clone)]
pub struct TaskManager {
    storage: SharedTaskStorage,
    metrics: SharedQueueMetrics,
}

impl TaskManager {
    pub fn new(storage: SharedTaskStorage) -> Self {
        Self::with_metrics(storage, Arc::new(NoOpQueueMetrics::new()))
    }

    pub fn with_metrics(storage: SharedTaskStorage, metrics: SharedQueueMetrics) -> Self {
        Self { storage, metrics }
    }

    /// Add a task to the queue. Ambient metadata on `ctx` is merged into the
    /// task at insertion time.
    pub async fn enqueue(&self, ctx: &QueueContext, task: &Task) -> Result<(), StorageError> {
        if task.payload.len() > BIG_PAYLOAD_BYTES {
            warn!(
                payload_size = task.payload.len(),
                task_id = %task.id,
                task_type = %task.task_type,
                "big payload size detected, may cause performance problems"
            );
        }

        self.metrics
            .task_enqueued(&task.task_type, task.payload.len())
            .await;

        self.storage.add_task(ctx, task).await
    }

    /// Fire-and-forget enqueue. The error, if any, is logged and dropped.
    pub fn enqueue_async(&self, ctx: &QueueContext, task: Task) {
        let manager = self.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(err) = manager.enqueue(&ctx, &task).await {
                error!(error = %err, task_id = %task.id, "failed to add task to queue");
            }
        });
    }

    /// Fetch a single task by id.
    pub async fn get(&self, id: Uuid) -> Result<Task, StorageError> {
        self.storage.get_task(id).await
    }

    /// Fetch up to `limit` tasks matching the filter.
    pub async fn get_tasks(
        &self,
        filter: &TaskFilter,
        limit: i64,
    ) -> Result<Vec<Task>, StorageError> {
        self.storage.get_tasks(filter, limit).await
    }

    /// Reset a task's attempt counter and move it back to `new`, making a
    /// failed task retryable from the beginning.
    pub async fn reset_attempts(&self, id: Uuid) -> Result<(), StorageError> {
        self.storage.reset_attempts(id).await
    }
}
