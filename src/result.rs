//! The Result object (spec §3, §4.4): a terminal-only snapshot of a task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::TaskId;

/// Terminal outcome of a task. A closed enum rather than a free-form
/// string status, serialized with `#[serde(rename_all = "snake_case")]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Success,
    Failed,
}

/// Returned by `Store::get_result` and `TaskQueue::get_result` only once a
/// task has reached a terminal state. `value` holds **encoded bytes**;
/// decoding is a separate step (`TaskQueue::deserialize_result`) so a
/// caller can inspect `error`/`traceback` without paying the decode cost
/// or risking a codec error when that's all they wanted.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub status: TaskOutcome,
    pub value: Option<Vec<u8>>,
    pub error: Option<String>,
    pub traceback: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}
