//! Test helper utilities for duraq tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

use crate::metrics::{QueueMetrics, QueueOperation};
use crate::task::TaskStatus;

/// Metrics backend that records every measurement for assertions.
#[derive(Default)]
pub struct RecordingQueueMetrics {
    enqueued: Mutex<Vec<(String, usize)>>,
    processed: Mutex<Vec<(String, TaskStatus)>>,
    attempts: Mutex<Vec<(String, i32)>>,
    operations: Mutex<Vec<(String, QueueOperation, usize)>>,
    workers: Mutex<HashMap<String, usize>>,
}

impl RecordingQueueMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payload sizes recorded at enqueue for one task type, in order.
    pub fn enqueued_payload_sizes(&self, task_type: &str) -> Vec<usize> {
        self.enqueued
            .lock()
            .iter()
            .filter(|(recorded_type, _)| recorded_type == task_type)
            .map(|(_, bytes)| *bytes)
            .collect()
    }

    /// How many outcomes were persisted with the given type and status.
    pub fn processed_count(&self, task_type: &str, status: TaskStatus) -> usize {
        self.processed
            .lock()
            .iter()
            .filter(|(recorded_type, recorded_status)| {
                recorded_type == task_type && *recorded_status == status
            })
            .count()
    }

    /// Attempt counts recorded at outcome persistence for one task type.
    pub fn recorded_attempts(&self, task_type: &str) -> Vec<i32> {
        self.attempts
            .lock()
            .iter()
            .filter(|(recorded_type, _)| recorded_type == task_type)
            .map(|(_, attempts)| *attempts)
            .collect()
    }

    /// Total rows touched across all recorded passes of one operation.
    pub fn operation_rows(&self, operation: QueueOperation) -> usize {
        self.operations
            .lock()
            .iter()
            .filter(|(_, recorded_op, _)| *recorded_op == operation)
            .map(|(_, _, rows)| *rows)
            .sum()
    }

    /// Last recorded worker-slot gauge for one task type.
    pub fn worker_count(&self, task_type: &str) -> Option<usize> {
        self.workers.lock().get(task_type).copied()
    }
}

#[async_trait]
impl QueueMetrics for RecordingQueueMetrics {
    async fn task_enqueued(&self, task_type: &str, payload_bytes: usize) {
        self.enqueued
            .lock()
            .push((task_type.to_string(), payload_bytes));
    }

    async fn task_processed(&self, task_type: &str, status: TaskStatus) {
        self.processed.lock().push((task_type.to_string(), status));
    }

    async fn task_attempts(&self, task_type: &str, attempts: i32) {
        self.attempts.lock().push((task_type.to_string(), attempts));
    }

    async fn operation(
        &self,
        task_type: &str,
        operation: QueueOperation,
        rows: usize,
        _elapsed: Duration,
    ) {
        self.operations
            .lock()
            .push((task_type.to_string(), operation, rows));
    }

    async fn workers(&self, task_type: &str, count: usize) {
        self.workers.lock().insert(task_type.to_string(), count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_backend_replays_measurements() {
        let metrics = RecordingQueueMetrics::new();

        metrics.task_enqueued("email", 2).await;
        metrics.task_enqueued("email", 128).await;
        metrics.task_enqueued("sms", 7).await;
        assert_eq!(metrics.enqueued_payload_sizes("email"), vec![2, 128]);
        assert_eq!(metrics.enqueued_payload_sizes("sms"), vec![7]);

        metrics.task_processed("email", TaskStatus::Done).await;
        metrics.task_processed("email", TaskStatus::Error).await;
        metrics.task_processed("email", TaskStatus::Done).await;
        assert_eq!(metrics.processed_count("email", TaskStatus::Done), 2);
        assert_eq!(metrics.processed_count("email", TaskStatus::Error), 1);
        assert_eq!(metrics.processed_count("sms", TaskStatus::Done), 0);

        metrics.task_attempts("email", 1).await;
        metrics.task_attempts("email", 3).await;
        assert_eq!(metrics.recorded_attempts("email"), vec![1, 3]);

        metrics
            .operation("email", QueueOperation::Clean, 4, Duration::from_millis(5))
            .await;
        metrics
            .operation("email", QueueOperation::Clean, 2, Duration::from_millis(5))
            .await;
        metrics
            .operation("email", QueueOperation::Heal, 9, Duration::from_millis(5))
            .await;
        assert_eq!(metrics.operation_rows(QueueOperation::Clean), 6);
        assert_eq!(metrics.operation_rows(QueueOperation::Heal), 9);
        assert_eq!(metrics.operation_rows(QueueOperation::Fetch), 0);

        metrics.workers("email", 10).await;
        metrics.workers("email", 4).await;
        assert_eq!(metrics.worker_count("email"), Some(4));
        assert_eq!(metrics.worker_count("sms"), None);
    }
}
