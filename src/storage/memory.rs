//! In-memory implementation for testing.
//!
//! Honors the same contract as the SQL backends: duplicate detection on
//! `(type, external_id)`, payload validation, atomic claim under the write
//! lock, and cutoff-based cure/delete. Rows with no `updated_at` are never
//! cured or deleted, matching SQL `NULL` comparison semantics.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{updated_cutoff, validate_payload, TaskFilter, TaskStorage};
use crate::context::QueueContext;
use crate::errors::StorageError;
use crate::task::{Task, TaskStatus};

/// In-memory task storage backed by a map under an async lock.
#[derive(Default)]
pub struct MemoryTaskStorage {
    tasks: Arc<RwLock<HashMap<Uuid, Task>>>,
}

impl MemoryTaskStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a stored row verbatim, without touching `updated_at`. Test
    /// hook for backdating rows into healer/cleaner windows.
    pub async fn hard_update_task(&self, task: Task) {
        self.tasks.write().await.insert(task.id, task);
    }

    /// Number of stored rows. Test hook.
    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }
}

#[async_trait]
impl TaskStorage for MemoryTaskStorage {
    async fn add_task(&self, ctx: &QueueContext, task: &Task) -> Result<(), StorageError> {
        validate_payload(&task.payload)?;

        let mut tasks = self.tasks.write().await;
        if tasks.values().any(|existing| {
            existing.task_type == task.task_type && existing.external_id == task.external_id
        }) {
            return Err(StorageError::DuplicateTask {
                external_id: task.external_id.clone(),
            });
        }

        let mut stored = task.clone();
        stored.metadata = task.metadata.merge(&ctx.values());
        tasks.insert(stored.id, stored);
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Task, StorageError> {
        self.tasks
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StorageError::TaskNotFound { id })
    }

    async fn get_tasks(&self, filter: &TaskFilter, limit: i64) -> Result<Vec<Task>, StorageError> {
        let cutoff = filter.updated_ago.map(updated_cutoff);
        let tasks = self.tasks.read().await;

        Ok(tasks
            .values()
            .filter(|task| {
                if !filter.ids.is_empty() && !filter.ids.contains(&task.id) {
                    return false;
                }
                if let Some(task_type) = &filter.task_type {
                    if &task.task_type != task_type {
                        return false;
                    }
                }
                if let Some(status) = filter.status {
                    if task.status != status {
                        return false;
                    }
                }
                if !filter.statuses.is_empty() && !filter.statuses.contains(&task.status) {
                    return false;
                }
                if let Some(cutoff) = cutoff {
                    match task.updated_at {
                        Some(updated_at) if updated_at <= cutoff => {}
                        _ => return false,
                    }
                }
                true
            })
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn get_tasks_for_processing(
        &self,
        task_type: &str,
        max_tasks: i64,
    ) -> Result<Vec<Task>, StorageError> {
        let now = Utc::now();
        let mut tasks = self.tasks.write().await;

        let mut eligible: Vec<Uuid> = tasks
            .values()
            .filter(|task| {
                task.task_type == task_type
                    && TaskStatus::CLAIMABLE.contains(&task.status)
                    && task.next_attempt_at <= now
            })
            .map(|task| task.id)
            .collect();
        eligible.sort_by_key(|id| tasks[id].next_attempt_at);
        eligible.truncate(max_tasks.max(0) as usize);

        let mut claimed = Vec::with_capacity(eligible.len());
        for id in eligible {
            let task = tasks.get_mut(&id).expect("eligible id present");
            task.status = TaskStatus::Pending;
            task.updated_at = Some(now);
            claimed.push(task.clone());
        }
        Ok(claimed)
    }

    async fn update_task(&self, id: Uuid, task: &mut Task) -> Result<(), StorageError> {
        task.updated_at = Some(Utc::now());

        let mut tasks = self.tasks.write().await;
        if let Some(stored) = tasks.get_mut(&id) {
            stored.status = task.status;
            stored.attempts = task.attempts;
            stored.errors = task.errors.clone();
            stored.updated_at = task.updated_at;
            stored.next_attempt_at = task.next_attempt_at;
        }
        Ok(())
    }

    async fn delete_tasks(
        &self,
        task_type: &str,
        statuses: &[TaskStatus],
        updated_ago: Duration,
    ) -> Result<Vec<Task>, StorageError> {
        let cutoff = updated_cutoff(updated_ago);
        let mut tasks = self.tasks.write().await;

        let doomed: Vec<Uuid> = tasks
            .values()
            .filter(|task| {
                task.task_type == task_type
                    && statuses.contains(&task.status)
                    && matches!(task.updated_at, Some(updated_at) if updated_at <= cutoff)
            })
            .map(|task| task.id)
            .collect();

        Ok(doomed
            .into_iter()
            .filter_map(|id| tasks.remove(&id))
            .collect())
    }

    async fn cure_tasks(
        &self,
        task_type: &str,
        statuses: &[TaskStatus],
        updated_ago: Duration,
        note: &str,
    ) -> Result<Vec<Task>, StorageError> {
        let cutoff = updated_cutoff(updated_ago);
        let now = Utc::now();
        let mut tasks = self.tasks.write().await;

        let mut cured = Vec::new();
        for task in tasks.values_mut() {
            if task.task_type != task_type
                || !statuses.contains(&task.status)
                || !matches!(task.updated_at, Some(updated_at) if updated_at <= cutoff)
            {
                continue;
            }
            task.status = TaskStatus::Error;
            task.add_error(&note);
            task.updated_at = Some(now);
            cured.push(task.clone());
        }
        Ok(cured)
    }

    async fn reset_attempts(&self, id: Uuid) -> Result<(), StorageError> {
        let now = Utc::now();
        let mut tasks = self.tasks.write().await;

        let task = tasks
            .get_mut(&id)
            .ok_or(StorageError::TaskNotFound { id })?;
        task.attempts = 0;
        task.status = TaskStatus::New;
        task.next_attempt_at = now;
        let log = task.errors.get_or_insert_with(String::new);
        log.push_str(&format!("reset attempts: {}\n", now.to_rfc3339()));
        task.updated_at = Some(now);
        Ok(())
    }
}
