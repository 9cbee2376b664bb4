//! Storage layer: the task table contract and its backends.
//!
//! All backends implement the same [`TaskStorage`] trait. The PostgreSQL and
//! SQLite backends persist to a `task` table with a unique
//! `(type, external_id)` index; the in-memory backend backs unit and
//! integration tests. Times are stored and compared in UTC everywhere, and
//! payloads are validated as JSON in user code before insertion so the
//! contract holds even on engines that cannot enforce it themselves.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

mod memory;
mod postgres;
mod sqlite;

pub use memory::MemoryTaskStorage;
pub use postgres::PostgresTaskStorage;
pub use sqlite::SqliteTaskStorage;

use crate::context::QueueContext;
use crate::errors::StorageError;
use crate::task::{Task, TaskStatus};

/// Filtering criteria for task queries. An empty filter is allowed and
/// matches every row up to the query limit.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    /// Restrict to this set of task ids.
    pub ids: Vec<Uuid>,
    /// Restrict to one task type.
    pub task_type: Option<String>,
    /// Restrict to one exact status.
    pub status: Option<TaskStatus>,
    /// Restrict to any of these statuses.
    pub statuses: Vec<TaskStatus>,
    /// Restrict to rows last updated at or before `now - Δ`.
    pub updated_ago: Option<Duration>,
}

impl TaskFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ids(mut self, ids: Vec<Uuid>) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_statuses(mut self, statuses: Vec<TaskStatus>) -> Self {
        self.statuses = statuses;
        self
    }

    pub fn with_updated_ago(mut self, updated_ago: Duration) -> Self {
        self.updated_ago = Some(updated_ago);
        self
    }
}

/// Contract every task storage backend must honor.
///
/// The claim operation ([`get_tasks_for_processing`]) is the hot path: it
/// must atomically move eligible rows to `pending` so that no two claimers
/// ever hold the same row, across any number of processes.
///
/// [`get_tasks_for_processing`]: TaskStorage::get_tasks_for_processing
#[async_trait]
pub trait TaskStorage: Send + Sync {
    /// Insert a new task. Ambient metadata from `ctx` is merged into the
    /// task's metadata (context values win on key collisions).
    ///
    /// Fails with [`StorageError::DuplicateTask`] when
    /// `(task_type, external_id)` collides and
    /// [`StorageError::InvalidPayload`] when the payload is not valid JSON.
    async fn add_task(&self, ctx: &QueueContext, task: &Task) -> Result<(), StorageError>;

    /// Fetch a single task by id, or [`StorageError::TaskNotFound`].
    async fn get_task(&self, id: Uuid) -> Result<Task, StorageError>;

    /// Fetch up to `limit` tasks matching the filter.
    async fn get_tasks(&self, filter: &TaskFilter, limit: i64) -> Result<Vec<Task>, StorageError>;

    /// Claim up to `max_tasks` eligible rows for dispatch: rows of the given
    /// type in `new` or `error` status whose `next_attempt_at` has passed,
    /// ordered by `next_attempt_at` ascending. Every returned task is
    /// `pending` in storage by the time this returns, or none is.
    async fn get_tasks_for_processing(
        &self,
        task_type: &str,
        max_tasks: i64,
    ) -> Result<Vec<Task>, StorageError>;

    /// Write back a task's mutable fields (`status`, `attempts`, `errors`,
    /// `next_attempt_at`) and refresh `updated_at` — both in storage and on
    /// the passed task.
    async fn update_task(&self, id: Uuid, task: &mut Task) -> Result<(), StorageError>;

    /// Delete rows of the given type, in any of the given statuses, last
    /// updated at or before `now - updated_ago`. Returns the deleted rows.
    async fn delete_tasks(
        &self,
        task_type: &str,
        statuses: &[TaskStatus],
        updated_ago: Duration,
    ) -> Result<Vec<Task>, StorageError>;

    /// Move stuck rows back to `error` so they become claimable again: rows
    /// of the given type, in any of the given statuses, last updated at or
    /// before `now - updated_ago` get status `error`, an
    /// `attempt N: <note>` line appended to their error log, and a fresh
    /// `updated_at`. The attempt counter is not incremented. Returns the
    /// cured rows.
    async fn cure_tasks(
        &self,
        task_type: &str,
        statuses: &[TaskStatus],
        updated_ago: Duration,
        note: &str,
    ) -> Result<Vec<Task>, StorageError>;

    /// Within one transaction: reset `attempts` to 0, move the task back to
    /// `new`, make it immediately claimable, and note the reset in its
    /// error log.
    async fn reset_attempts(&self, id: Uuid) -> Result<(), StorageError>;
}

/// Shared handle to a task storage backend.
pub type SharedTaskStorage = Arc<dyn TaskStorage>;

/// Connect to the database named by `database_url` and return the matching
/// storage backend. Supports `postgres://` (and `postgresql://`) and
/// `sqlite://` URLs.
pub async fn create_task_storage(database_url: &str) -> Result<SharedTaskStorage, StorageError> {
    if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://") {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect(database_url)
            .await
            .map_err(|source| StorageError::ConnectionFailed { source })?;
        return Ok(Arc::new(PostgresTaskStorage::new(pool)));
    }

    if database_url.starts_with("sqlite://") || database_url.starts_with("sqlite:") {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .connect(database_url)
            .await
            .map_err(|source| StorageError::ConnectionFailed { source })?;
        return Ok(Arc::new(SqliteTaskStorage::new(pool)));
    }

    Err(StorageError::UnsupportedScheme {
        url: database_url.to_string(),
    })
}

/// Validate that a payload is a syntactically well-formed JSON document.
pub(crate) fn validate_payload(payload: &str) -> Result<(), StorageError> {
    serde_json::from_str::<serde::de::IgnoredAny>(payload)
        .map(|_| ())
        .map_err(|err| StorageError::InvalidPayload {
            details: err.to_string(),
        })
}

/// Cutoff timestamp for "updated at or before now − Δ" comparisons.
pub(crate) fn updated_cutoff(updated_ago: Duration) -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now() - chrono::Duration::from_std(updated_ago).unwrap_or(chrono::Duration::MAX)
}
