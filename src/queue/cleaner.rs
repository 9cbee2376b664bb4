//! Cleaner: garbage collection of terminal tasks past retention.
//!
//! Rows in `done`, `canceled`, or `attempts_left` that have not been touched
//! within the retention window are deleted. This is the sole source of task
//! deletion in normal operation.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::maintenance::{MaintenanceJob, MaintenanceLoop};
use crate::errors::StorageError;
use crate::metrics::{QueueOperation, SharedQueueMetrics};
use crate::storage::SharedTaskStorage;
use crate::task::{Task, TaskStatus};

pub(crate) const DEFAULT_CLEANER_PERIOD: Duration = Duration::from_secs(5 * 60);
pub(crate) const DEFAULT_CLEANER_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_CLEANER_UPDATED_AGO: Duration = Duration::from_secs(3 * 60 * 60);

struct CleanJob {
    storage: SharedTaskStorage,
    task_type: String,
    updated_ago: Mutex<Duration>,
}

#[async_trait]
impl MaintenanceJob for CleanJob {
    async fn process(&self) -> Result<Vec<Task>, StorageError> {
        let updated_ago = *self.updated_ago.lock();
        self.storage
            .delete_tasks(&self.task_type, &TaskStatus::TERMINAL, updated_ago)
            .await
    }
}

/// Periodic loop that deletes terminal tasks past retention for one task
/// type.
pub struct QueueCleaner {
    job: Arc<CleanJob>,
    maintenance: MaintenanceLoop,
}

impl QueueCleaner {
    pub(crate) fn new(
        storage: SharedTaskStorage,
        task_type: impl Into<String>,
        metrics: SharedQueueMetrics,
    ) -> Self {
        let task_type = task_type.into();
        let job = Arc::new(CleanJob {
            storage,
            task_type: task_type.clone(),
            updated_ago: Mutex::new(DEFAULT_CLEANER_UPDATED_AGO),
        });
        let maintenance = MaintenanceLoop::new(
            "cleaner",
            task_type,
            QueueOperation::Clean,
            DEFAULT_CLEANER_PERIOD,
            DEFAULT_CLEANER_TIMEOUT,
            Arc::clone(&job) as Arc<dyn MaintenanceJob>,
            metrics,
        );
        Self { job, maintenance }
    }

    /// Set the retention window; terminal rows older than this are deleted.
    pub fn set_updated_ago(&self, updated_ago: Duration) {
        *self.job.updated_ago.lock() = updated_ago;
    }

    /// Set the interval between cleaner passes. Applies from the next pass.
    pub fn set_process_period(&self, period: Duration) {
        self.maintenance.set_period(period);
    }

    /// Set the per-pass timeout.
    pub fn set_process_timeout(&self, timeout: Duration) {
        self.maintenance.set_timeout(timeout);
    }

    pub(crate) fn run(&self, shutdown: &CancellationToken) {
        self.maintenance.run(shutdown);
    }

    pub(crate) async fn stop(&self) {
        self.maintenance.stop().await;
    }

    /// Run one cleanup pass immediately, outside the periodic loop.
    pub async fn clean_tasks(&self) -> Result<Vec<Task>, StorageError> {
        self.job.process().await
    }
}
