//! SQLite implementation of task storage.
//!
//! SQLite has no row-level `FOR UPDATE`, but its single-writer transaction
//! model already serializes concurrent claimers: once the claim transaction
//! flips rows to `pending`, no other transaction can observe them as
//! claimable. Payload JSON is validated in user code since the engine cannot
//! enforce it, and ids and timestamps are stored as text (RFC 3339, UTC).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::Sqlite;
use std::time::Duration;
use tracing::error;
use uuid::Uuid;

use super::{updated_cutoff, validate_payload, TaskFilter, TaskStorage};
use crate::context::QueueContext;
use crate::errors::StorageError;
use crate::task::{Metadata, Task, TaskStatus};

const TASK_COLUMNS: &str =
    "id, type, external_id, payload, status, attempts, errors, metadata, created_at, updated_at, next_attempt_at";

/// SQLite-backed task storage.
pub struct SqliteTaskStorage {
    pool: SqlitePool,
}

impl SqliteTaskStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the `task` table, the unique idempotency index, and the
    /// secondary indexes backing the claim and maintenance queries.
    pub async fn initialize_schema(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS task (
                id TEXT PRIMARY KEY,
                type TEXT NOT NULL,
                external_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                errors TEXT,
                metadata TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT,
                next_attempt_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|source| StorageError::QueryFailed { source })?;

        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_task_type_external_id
            ON task (type, external_id)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|source| StorageError::QueryFailed { source })?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_task_claim
            ON task (type, status, next_attempt_at)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|source| StorageError::QueryFailed { source })?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_task_maintenance
            ON task (type, status, updated_at)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|source| StorageError::QueryFailed { source })?;

        Ok(())
    }
}

#[async_trait]
impl TaskStorage for SqliteTaskStorage {
    async fn add_task(&self, ctx: &QueueContext, task: &Task) -> Result<(), StorageError> {
        validate_payload(&task.payload)?;
        let metadata = task.metadata.merge(&ctx.values());

        let result = sqlx::query(
            r#"
            INSERT INTO task
                (id, type, external_id, payload, status, attempts, errors, metadata,
                 created_at, updated_at, next_attempt_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(task.id.to_string())
        .bind(&task.task_type)
        .bind(&task.external_id)
        .bind(&task.payload)
        .bind(task.status.as_str())
        .bind(task.attempts)
        .bind(&task.errors)
        .bind(metadata.to_json())
        .bind(task.created_at)
        .bind(task.updated_at)
        .bind(task.next_attempt_at)
        .execute(&self.pool)
        .await;

        if let Err(err) = result {
            let classified = classify_engine_error(err, &task.external_id);
            error!(error = %classified, task_id = %task.id, "failed to add task");
            return Err(classified);
        }

        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Task, StorageError> {
        let row: Option<TaskRow> =
            sqlx::query_as(&format!("SELECT {TASK_COLUMNS} FROM task WHERE id = ?1"))
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(|source| StorageError::QueryFailed { source })?;

        row.map(Task::try_from)
            .transpose()?
            .ok_or(StorageError::TaskNotFound { id })
    }

    async fn get_tasks(&self, filter: &TaskFilter, limit: i64) -> Result<Vec<Task>, StorageError> {
        let mut builder = sqlx::QueryBuilder::<Sqlite>::new(format!(
            "SELECT {TASK_COLUMNS} FROM task WHERE 1 = 1"
        ));

        if !filter.ids.is_empty() {
            builder.push(" AND id IN (");
            let mut separated = builder.separated(", ");
            for id in &filter.ids {
                separated.push_bind(id.to_string());
            }
            builder.push(")");
        }
        if let Some(task_type) = &filter.task_type {
            builder.push(" AND type = ").push_bind(task_type);
        }
        if let Some(status) = filter.status {
            builder.push(" AND status = ").push_bind(status.as_str());
        }
        if !filter.statuses.is_empty() {
            builder.push(" AND status IN (");
            let mut separated = builder.separated(", ");
            for status in &filter.statuses {
                separated.push_bind(status.as_str());
            }
            builder.push(")");
        }
        if let Some(updated_ago) = filter.updated_ago {
            builder
                .push(" AND updated_at <= ")
                .push_bind(updated_cutoff(updated_ago));
        }
        builder.push(" LIMIT ").push_bind(limit);

        let rows: Vec<TaskRow> = builder
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(|source| StorageError::QueryFailed { source })?;

        rows.into_iter().map(Task::try_from).collect()
    }

    async fn get_tasks_for_processing(
        &self,
        task_type: &str,
        max_tasks: i64,
    ) -> Result<Vec<Task>, StorageError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|source| StorageError::TransactionFailed { source })?;

        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            r#"
            SELECT {TASK_COLUMNS} FROM task
            WHERE type = ?1
              AND status IN ('new', 'error')
              AND next_attempt_at <= ?2
            ORDER BY next_attempt_at ASC
            LIMIT ?3
            "#
        ))
        .bind(task_type)
        .bind(Utc::now())
        .bind(max_tasks)
        .fetch_all(&mut *tx)
        .await
        .map_err(|source| StorageError::QueryFailed { source })?;

        if rows.is_empty() {
            tx.commit()
                .await
                .map_err(|source| StorageError::TransactionFailed { source })?;
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let mut builder = sqlx::QueryBuilder::<Sqlite>::new("UPDATE task SET status = 'pending', updated_at = ");
        builder.push_bind(now);
        builder.push(" WHERE id IN (");
        let mut separated = builder.separated(", ");
        for row in &rows {
            separated.push_bind(row.id.clone());
        }
        builder.push(")");

        builder
            .build()
            .execute(&mut *tx)
            .await
            .map_err(|source| StorageError::QueryFailed { source })?;

        tx.commit()
            .await
            .map_err(|source| StorageError::TransactionFailed { source })?;

        rows.into_iter()
            .map(|row| {
                let mut task = Task::try_from(row)?;
                task.status = TaskStatus::Pending;
                task.updated_at = Some(now);
                Ok(task)
            })
            .collect()
    }

    async fn update_task(&self, id: Uuid, task: &mut Task) -> Result<(), StorageError> {
        task.updated_at = Some(Utc::now());

        sqlx::query(
            r#"
            UPDATE task
            SET status = ?1, attempts = ?2, errors = ?3, updated_at = ?4, next_attempt_at = ?5
            WHERE id = ?6
            "#,
        )
        .bind(task.status.as_str())
        .bind(task.attempts)
        .bind(&task.errors)
        .bind(task.updated_at)
        .bind(task.next_attempt_at)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|source| StorageError::QueryFailed { source })?;

        Ok(())
    }

    async fn delete_tasks(
        &self,
        task_type: &str,
        statuses: &[TaskStatus],
        updated_ago: Duration,
    ) -> Result<Vec<Task>, StorageError> {
        let mut builder = sqlx::QueryBuilder::<Sqlite>::new("DELETE FROM task WHERE type = ");
        builder.push_bind(task_type);
        builder.push(" AND status IN (");
        let mut separated = builder.separated(", ");
        for status in statuses {
            separated.push_bind(status.as_str());
        }
        builder.push(") AND updated_at <= ");
        builder.push_bind(updated_cutoff(updated_ago));
        builder.push(format!(" RETURNING {TASK_COLUMNS}"));

        let rows: Vec<TaskRow> = builder
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(|source| StorageError::QueryFailed { source })?;

        rows.into_iter().map(Task::try_from).collect()
    }

    async fn cure_tasks(
        &self,
        task_type: &str,
        statuses: &[TaskStatus],
        updated_ago: Duration,
        note: &str,
    ) -> Result<Vec<Task>, StorageError> {
        // `attempt <attempts>: <note>\n` appended server-side, as in the
        // PostgreSQL backend; char(10) is the newline.
        let mut builder = sqlx::QueryBuilder::<Sqlite>::new(
            "UPDATE task SET status = 'error', errors = COALESCE(errors, '') || 'attempt ' || attempts || ': ' || ",
        );
        builder.push_bind(note);
        builder.push(" || char(10), updated_at = ");
        builder.push_bind(Utc::now());
        builder.push(" WHERE type = ");
        builder.push_bind(task_type);
        builder.push(" AND status IN (");
        let mut separated = builder.separated(", ");
        for status in statuses {
            separated.push_bind(status.as_str());
        }
        builder.push(") AND updated_at <= ");
        builder.push_bind(updated_cutoff(updated_ago));
        builder.push(format!(" RETURNING {TASK_COLUMNS}"));

        let rows: Vec<TaskRow> = builder
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(|source| StorageError::QueryFailed { source })?;

        rows.into_iter().map(Task::try_from).collect()
    }

    async fn reset_attempts(&self, id: Uuid) -> Result<(), StorageError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|source| StorageError::TransactionFailed { source })?;

        let row: Option<TaskRow> =
            sqlx::query_as(&format!("SELECT {TASK_COLUMNS} FROM task WHERE id = ?1"))
                .bind(id.to_string())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|source| StorageError::QueryFailed { source })?;

        let mut task = row
            .map(Task::try_from)
            .transpose()?
            .ok_or(StorageError::TaskNotFound { id })?;

        let now = Utc::now();
        task.attempts = 0;
        task.status = TaskStatus::New;
        task.next_attempt_at = now;
        let log = task.errors.get_or_insert_with(String::new);
        log.push_str(&format!("reset attempts: {}\n", now.to_rfc3339()));

        sqlx::query(
            r#"
            UPDATE task
            SET status = ?1, attempts = ?2, errors = ?3, updated_at = ?4, next_attempt_at = ?5
            WHERE id = ?6
            "#,
        )
        .bind(task.status.as_str())
        .bind(task.attempts)
        .bind(&task.errors)
        .bind(now)
        .bind(task.next_attempt_at)
        .bind(id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(|source| StorageError::QueryFailed { source })?;

        tx.commit()
            .await
            .map_err(|source| StorageError::TransactionFailed { source })
    }
}

fn classify_engine_error(err: sqlx::Error, external_id: &str) -> StorageError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            return StorageError::DuplicateTask {
                external_id: external_id.to_string(),
            };
        }
    }
    StorageError::QueryFailed { source: err }
}

// Helper struct for database queries; the id round-trips through text.
#[derive(Debug, sqlx::FromRow)]
struct TaskRow {
    id: String,
    #[sqlx(rename = "type")]
    task_type: String,
    external_id: String,
    payload: String,
    status: String,
    attempts: i32,
    errors: Option<String>,
    metadata: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
    next_attempt_at: DateTime<Utc>,
}

impl TryFrom<TaskRow> for Task {
    type Error = StorageError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let id = Uuid::parse_str(&row.id).map_err(|err| StorageError::CorruptRow {
            details: format!("bad task id {}: {err}", row.id),
        })?;
        Ok(Task {
            id,
            task_type: row.task_type,
            external_id: row.external_id,
            payload: row.payload,
            status: row.status.parse()?,
            attempts: row.attempts,
            errors: row.errors,
            metadata: Metadata::from_json(row.metadata.as_deref()),
            created_at: row.created_at,
            updated_at: row.updated_at,
            next_attempt_at: row.next_attempt_at,
        })
    }
}
