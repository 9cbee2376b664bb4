//! Healer: resurrection of tasks stuck mid-processing.
//!
//! Any non-terminal row whose `updated_at` is older than the configured
//! threshold is assumed orphaned (worker crashed, process killed, network
//! partition) and moved back to `error` so it becomes claimable again. The
//! attempt counter is intentionally not incremented, since the failure was
//! not attributable to the user handler.

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

/// Note appended to the error log of every cured task.
pub const FROZEN_TASK_NOTE: &str = "task is frozen";

pub(crate) const DEFAULT_HEALER_PERIOD: Duration = Duration::from_secs(5 * 60);
pub(crate) const DEFAULT_HEALER_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_HEALER_UPDATED_AGO: Duration = Duration::from_secs(60 * 60);

struct HealJob {
    storage: SharedTaskStorage,
    task_type: String,
    updated_ago: Mutex<Duration>,
}

#[async_trait]
impl MaintenanceJob for HealJob {
    async fn process(&self) -> Result<Vec<Task>, StorageError> {
        let updated_ago = *self.updated_ago.lock();
        self.storage
            .cure_tasks(
                &self.task_type,
                &TaskStatus::STUCK,
                updated_ago,
                FROZEN_TASK_NOTE,
            )
            .await
    }
}

/// Periodic loop that cures stuck `pending`/`processing` tasks for one task
/// type.
pub struct QueueHealer {
    job: Arc<HealJob>,
    maintenance: MaintenanceLoop,
}

impl QueueHealer {
    pub(crate) fn new(
        storage: SharedTaskStorage,
        task_type: impl Into<String>,
        metrics: SharedQueueMetrics,
    ) -> Self {
        let task_type = task_type.into();
        let job = Arc::new(HealJob {
            storage,
            task_type: task_type.clone(),
            updated_ago: Mutex::new(DEFAULT_HEALER_UPDATED_AGO),
        });
        let maintenance = MaintenanceLoop::new(
            "healer",
            task_type,
            QueueOperation::Heal,
            DEFAULT_HEALER_PERIOD,
            DEFAULT_HEALER_TIMEOUT,
            Arc::clone(&job) as Arc<dyn MaintenanceJob>,
            metrics,
        );
        Self { job, maintenance }
    }

    /// Set the staleness threshold beyond which a task counts as stuck.
    pub fn set_updated_ago(&self, updated_ago: Duration) {
        *self.job.updated_ago.lock() = updated_ago;
    }

    /// Set the interval between healer passes. Applies from the next pass.
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

    /// Run one healing pass immediately, outside the periodic loop.
    pub async fn cure_tasks(&self) -> Result<Vec<Task>, StorageError> {
        self.job.process().await
    }
}
