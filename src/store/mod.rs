//! The Store: durable task persistence and the atomic primitives that
//! drive the lifecycle state machine (spec §3, §4.1).

mod sqlite;

pub use sqlite::{SqliteStore, StoreOptions};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::result::TaskResult;

/// Globally unique task identifier, assigned by the Producer at enqueue
/// time. Stable for the life of the task.
pub type TaskId = String;

/// One row's lifecycle state. Transitions form the DAG `Pending ->
/// InProgress -> (Success|Failed)`; nothing reverses direction within a
/// worker's ownership (spec §3 invariant 5). Recovery is the only path
/// that moves a row backwards, and it is the Store's own doing, not a
/// caller-visible transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    InProgress,
    Success,
    Failed,
}

impl TaskState {
    pub(crate) fn as_sql(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::InProgress => "in_progress",
            TaskState::Success => "success",
            TaskState::Failed => "failed",
        }
    }

    pub(crate) fn from_sql(s: &str) -> Self {
        match s {
            "pending" => TaskState::Pending,
            "in_progress" => TaskState::InProgress,
            "success" => TaskState::Success,
            "failed" => TaskState::Failed,
            other => unreachable!("unknown task status persisted in store: {other}"),
        }
    }
}

/// Value returned by a successful reservation. Carries no mutable state:
/// the worker decodes `payload` and executes it, then calls back into the
/// store with the outcome.
#[derive(Debug, Clone)]
pub struct ReservedTask {
    pub id: TaskId,
    pub payload: Vec<u8>,
    pub started_at: DateTime<Utc>,
}

/// Durable persistence and the atomic primitives the lifecycle engine
/// needs. Every method executes as a single serializable transaction
/// against the underlying medium (spec §4.1 "Concurrency discipline").
#[async_trait]
pub trait Store: Send + Sync {
    /// Idempotent. MUST NOT create duplicate resources on repeat calls.
    async fn connect(&self) -> Result<(), StoreError>;

    /// Idempotent. After `close()`, other operations fail with
    /// `StoreError::Closed`.
    async fn close(&self) -> Result<(), StoreError>;

    /// Inserts one `pending` row. Fails with `StoreError::Duplicate` if
    /// `task_id` already exists.
    async fn enqueue(
        &self,
        task_id: &TaskId,
        payload: Vec<u8>,
        available_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Atomically reserves up to `max_items` eligible rows
    /// (`status = pending && available_at <= now`), transitioning each to
    /// `in_progress`. Tie-break: `available_at` asc, then `enqueued_at`
    /// asc, then insertion order.
    async fn reserve(
        &self,
        max_items: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReservedTask>, StoreError>;

    /// Transitions `in_progress -> success`. Returns `Ok(false)` ("not
    /// applied") if the row isn't currently `in_progress`; never
    /// downgrades a terminal row.
    async fn mark_success(
        &self,
        task_id: &TaskId,
        value: Vec<u8>,
        finished_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Symmetric to `mark_success` for the `failed` terminal state.
    async fn mark_failure(
        &self,
        task_id: &TaskId,
        error: String,
        traceback: Option<String>,
        finished_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// `None` if the row doesn't exist, or exists but is not yet
    /// terminal ("not ready yet", used by the Producer's wait loop).
    async fn get_result(&self, task_id: &TaskId) -> Result<Option<TaskResult>, StoreError>;
}
