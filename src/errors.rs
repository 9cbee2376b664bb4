use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("error-duraq-storage-1 task already exists: {external_id}")]
    DuplicateTask { external_id: String },

    #[error("error-duraq-storage-2 payload format is invalid, expected JSON: {details}")]
    InvalidPayload { details: String },

    #[error("error-duraq-storage-3 task not found: {id}")]
    TaskNotFound { id: Uuid },

    #[error("error-duraq-storage-4 unsupported database scheme: {url}")]
    UnsupportedScheme { url: String },

    #[error("error-duraq-storage-5 database connection failed: {source}")]
    ConnectionFailed {
        #[source]
        source: sqlx::Error,
    },

    #[error("error-duraq-storage-6 transaction failed: {source}")]
    TransactionFailed {
        #[source]
        source: sqlx::Error,
    },

    #[error("error-duraq-storage-7 query execution failed: {source}")]
    QueryFailed {
        #[source]
        source: sqlx::Error,
    },

    #[error("error-duraq-storage-8 stored row is corrupt: {details}")]
    CorruptRow { details: String },
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("error-duraq-queue-1 no processors registered")]
    NoProcessors,

    #[error("error-duraq-queue-2 processor for task type {task_type} is already running")]
    AlreadyRunning { task_type: String },
}

/// Outcome of one handler invocation, classified by the after-hooks into the
/// persisted task state.
///
/// The `Canceled` and `Timeout` display strings are appended verbatim to the
/// task's `errors` log, so they intentionally carry no error code prefix.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The handler decided the task must not run again. Moves the task to
    /// the terminal `canceled` status without counting an attempt.
    #[error("task canceled")]
    Canceled,

    /// The handler observed the cancellation token during graceful shutdown.
    /// The task is requeued as `new` without counting an attempt.
    #[error("shutdown in progress")]
    Shutdown,

    /// Produced by the processor when the handler exceeded its wall-clock
    /// budget. Counted as a retryable attempt.
    #[error("task processing timeout: {timeout:?}")]
    Timeout { timeout: Duration },

    /// Any other handler failure. Counted as a retryable attempt.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl ProcessError {
    /// Convenience constructor for retryable failures from plain messages.
    pub fn failed(message: impl Into<String>) -> Self {
        ProcessError::Failed(anyhow::anyhow!(message.into()))
    }
}
