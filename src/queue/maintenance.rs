//! Shared periodic loop for the maintenance processors (healer, cleaner).
//!
//! Each loop sleeps for its period, runs one pass of its job under a per-run
//! timeout, logs every affected row, and repeats until the cancellation
//! token fires. Period and timeout are adjustable at runtime; a change
//! applies from the next pass.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::StorageError;
use crate::metrics::{QueueOperation, SharedQueueMetrics};
use crate::task::Task;

/// One maintenance pass over the queue. Returns the affected rows.
#[async_trait]
pub(crate) trait MaintenanceJob: Send + Sync + 'static {
    async fn process(&self) -> Result<Vec<Task>, StorageError>;
}

struct RunState {
    cancel: CancellationToken,
    stopped: oneshot::Receiver<()>,
}

pub(crate) struct MaintenanceLoop {
    name: &'static str,
    task_type: String,
    operation: QueueOperation,
    period: Arc<Mutex<Duration>>,
    timeout: Arc<Mutex<Duration>>,
    job: Arc<dyn MaintenanceJob>,
    metrics: SharedQueueMetrics,
    run_state: Mutex<Option<RunState>>,
}

impl MaintenanceLoop {
    pub(crate) fn new(
        name: &'static str,
        task_type: String,
        operation: QueueOperation,
        period: Duration,
        timeout: Duration,
        job: Arc<dyn MaintenanceJob>,
        metrics: SharedQueueMetrics,
    ) -> Self {
        Self {
            name,
            task_type,
            operation,
            period: Arc::new(Mutex::new(period)),
            timeout: Arc::new(Mutex::new(timeout)),
            job,
            metrics,
            run_state: Mutex::new(None),
        }
    }

    pub(crate) fn set_period(&self, period: Duration) {
        *self.period.lock() = period;
    }

    pub(crate) fn set_timeout(&self, timeout: Duration) {
        *self.timeout.lock() = timeout;
    }

    /// Launch the loop in a background task. Non-blocking.
    pub(crate) fn run(&self, shutdown: &CancellationToken) {
        let mut state = self.run_state.lock();
        if state.is_some() {
            warn!(
                processor = self.name,
                task_type = %self.task_type,
                "maintenance processor is already running"
            );
            return;
        }

        let cancel = shutdown.child_token();
        let (stopped_tx, stopped_rx) = oneshot::channel();
        *state = Some(RunState {
            cancel: cancel.clone(),
            stopped: stopped_rx,
        });
        drop(state);

        let name = self.name;
        let task_type = self.task_type.clone();
        let operation = self.operation;
        let period = Arc::clone(&self.period);
        let timeout = Arc::clone(&self.timeout);
        let job = Arc::clone(&self.job);
        let metrics = Arc::clone(&self.metrics);

        tokio::spawn(async move {
            info!(processor = name, task_type = %task_type, "start maintenance processor");
            loop {
                let sleep_for = *period.lock();
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(sleep_for) => {
                        let timeout_for = *timeout.lock();
                        run_pass(
                            name,
                            &task_type,
                            operation,
                            timeout_for,
                            job.as_ref(),
                            &metrics,
                        )
                        .await;
                    }
                }
            }
            info!(processor = name, task_type = %task_type, "maintenance processor stopped");
            let _ = stopped_tx.send(());
        });
    }

    /// Cancel the loop and wait for it to drain.
    pub(crate) async fn stop(&self) {
        let state = self.run_state.lock().take();
        if let Some(state) = state {
            info!(
                processor = self.name,
                task_type = %self.task_type,
                "graceful shutdown"
            );
            state.cancel.cancel();
            let _ = state.stopped.await;
            info!(
                processor = self.name,
                task_type = %self.task_type,
                "graceful shutdown finished"
            );
        }
    }
}

async fn run_pass(
    name: &'static str,
    task_type: &str,
    operation: QueueOperation,
    timeout: Duration,
    job: &dyn MaintenanceJob,
    metrics: &SharedQueueMetrics,
) {
    debug!(processor = name, task_type, "start maintenance pass");
    let started = Instant::now();

    match tokio::time::timeout(timeout, job.process()).await {
        Ok(Ok(tasks)) => {
            info!(
                processor = name,
                task_type,
                count = tasks.len(),
                "processed queue"
            );
            metrics
                .operation(task_type, operation, tasks.len(), started.elapsed())
                .await;

            for task in &tasks {
                info!(
                    processor = name,
                    task_id = %task.id,
                    external_id = %task.external_id,
                    task_type = %task.task_type,
                    status = %task.status,
                    errors = task.errors.as_deref().unwrap_or(""),
                    created_at = %task.created_at,
                    updated_at = ?task.updated_at,
                    "processed queue task"
                );
            }
        }
        Ok(Err(err)) => {
            error!(processor = name, task_type, error = %err, "process failed");
        }
        Err(_) => {
            error!(
                processor = name,
                task_type,
                timeout = ?timeout,
                "maintenance pass timed out"
            );
        }
    }
}
