//! Task entity, status machine, and metadata.
//!
//! A [`Task`] is the sole persisted entity of the queue: a typed unit of work
//! with an opaque JSON payload, an idempotency key, an attempt counter, and a
//! human-readable error log accumulated across attempts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use tracing::error;
use uuid::Uuid;

use crate::errors::StorageError;

/// Lifecycle states of a task.
///
/// Terminal states (`Done`, `Canceled`, `AttemptsLeft`) are never mutated by
/// the queue except through deletion or an explicit attempts reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Ready to be picked up by a fetcher.
    New,
    /// Claimed by a fetcher, waiting for a worker slot.
    Pending,
    /// Currently running inside a worker.
    Processing,
    /// Processed successfully.
    Done,
    /// Canceled by its handler.
    Canceled,
    /// Failed with retry attempts remaining.
    Error,
    /// Failed and exhausted all retry attempts.
    AttemptsLeft,
}

impl TaskStatus {
    /// Statuses a fetcher may claim.
    pub const CLAIMABLE: [TaskStatus; 2] = [TaskStatus::New, TaskStatus::Error];

    /// Statuses the cleaner garbage-collects.
    pub const TERMINAL: [TaskStatus; 3] = [
        TaskStatus::Done,
        TaskStatus::Canceled,
        TaskStatus::AttemptsLeft,
    ];

    /// Statuses the healer treats as potentially stuck.
    pub const STUCK: [TaskStatus; 2] = [TaskStatus::Processing, TaskStatus::Pending];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::New => "new",
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Done => "done",
            TaskStatus::Canceled => "canceled",
            TaskStatus::Error => "error",
            TaskStatus::AttemptsLeft => "attempts_left",
        }
    }

    /// True for statuses that never transition further.
    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(TaskStatus::New),
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "done" => Ok(TaskStatus::Done),
            "canceled" => Ok(TaskStatus::Canceled),
            "error" => Ok(TaskStatus::Error),
            "attempts_left" => Ok(TaskStatus::AttemptsLeft),
            other => Err(StorageError::CorruptRow {
                details: format!("unknown task status: {other}"),
            }),
        }
    }
}

/// Arbitrary key-value data attached to a task for tracking and context
/// propagation between producer and consumer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(serde_json::Map<String, Value>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Combine with another metadata map; values from `other` win on key
    /// collisions.
    pub fn merge(&self, other: &Metadata) -> Metadata {
        let mut merged = self.0.clone();
        for (key, value) in &other.0 {
            merged.insert(key.clone(), value.clone());
        }
        Metadata(merged)
    }

    /// Serialize to a JSON object string for storage.
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_else(|err| {
            error!(error = %err, "failed to serialize task metadata");
            "{}".to_string()
        })
    }

    /// Deserialize from a stored JSON string. A missing or malformed value
    /// yields an empty map so a corrupt metadata column never blocks a task.
    pub fn from_json(raw: Option<&str>) -> Metadata {
        let Some(raw) = raw else {
            return Metadata::default();
        };
        match serde_json::from_str(raw) {
            Ok(map) => Metadata(map),
            Err(err) => {
                error!(error = %err, "failed to deserialize task metadata");
                Metadata::default()
            }
        }
    }
}

impl FromIterator<(String, Value)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Metadata(iter.into_iter().collect())
    }
}

/// A unit of work in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Client-generated, time-ordered (UUIDv7) identifier.
    pub id: Uuid,
    /// Partition key; one processor exists per value.
    pub task_type: String,
    /// Producer-supplied idempotency key. `(task_type, external_id)` is
    /// unique in storage.
    pub external_id: String,
    /// Opaque JSON document. Validated before insertion.
    pub payload: String,
    pub status: TaskStatus,
    /// Count of completed attempts; 0 before the first.
    pub attempts: i32,
    /// Append-only log of attempt failures.
    pub errors: Option<String>,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    /// Set on every mutation except insertion.
    pub updated_at: Option<DateTime<Utc>>,
    /// Earliest moment a fetcher may claim this row.
    pub next_attempt_at: DateTime<Utc>,
}

impl Task {
    /// Create a new task with the given type and JSON payload. The external
    /// id defaults to a random `internal-` key, so unrelated enqueues never
    /// collide on the idempotency index.
    pub fn new(task_type: impl Into<String>, payload: impl Into<String>) -> Self {
        let now = Utc::now();
        Task {
            id: Uuid::now_v7(),
            task_type: task_type.into(),
            external_id: format!("internal-{}", ulid::Ulid::new()),
            payload: payload.into(),
            status: TaskStatus::New,
            attempts: 0,
            errors: None,
            metadata: Metadata::default(),
            created_at: now,
            updated_at: None,
            next_attempt_at: now,
        }
    }

    /// Create a new task with an explicit external id for idempotency.
    pub fn with_external_id(
        task_type: impl Into<String>,
        payload: impl Into<String>,
        external_id: impl Into<String>,
    ) -> Self {
        let mut task = Task::new(task_type, payload);
        task.external_id = external_id.into();
        task
    }

    /// Attach metadata to the task at construction time.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Append an error line for the current attempt to the task's error log.
    pub fn add_error(&mut self, err: &dyn fmt::Display) {
        let log = self.errors.get_or_insert_with(String::new);
        log.push_str(&format!("attempt {}: {}\n", self.attempts, err));
    }
}
