//! The Producer (`TaskQueue`): accepts submissions, assigns identifiers,
//! delegates encoding, computes eligibility, persists via the Store, and
//! surfaces results (spec §4.2).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::codec::EnvelopeCodec;
use crate::error::{QueueError, ValidationError};
use crate::result::TaskResult;
use crate::store::{Store, TaskId};

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(50);
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Construction options for [`TaskQueue`].
pub struct TaskQueueOptions {
    /// Applied when `get_result` is called without an explicit timeout.
    /// `None` means "poll indefinitely".
    pub default_result_timeout: Option<Duration>,
}

impl Default for TaskQueueOptions {
    fn default() -> Self {
        Self {
            default_result_timeout: None,
        }
    }
}

/// Accepts task submissions and surfaces their terminal results. Rust has
/// no `async with`; the scoped-acquisition contract of the source is
/// expressed here as an explicit `connect`/`close` pair rather than a
/// guard type, since there is no safe way to run async cleanup from a
/// synchronous `Drop` (see DESIGN.md).
pub struct TaskQueue {
    store: Arc<dyn Store>,
    codec: Arc<dyn EnvelopeCodec>,
    options: TaskQueueOptions,
}

impl TaskQueue {
    /// Connects the underlying store and returns a ready-to-use queue.
    pub async fn connect(
        store: Arc<dyn Store>,
        codec: Arc<dyn EnvelopeCodec>,
        options: TaskQueueOptions,
    ) -> Result<Self, QueueError> {
        store.connect().await?;
        Ok(Self {
            store,
            codec,
            options,
        })
    }

    /// Releases the underlying store. Idempotent.
    pub async fn close(&self) -> Result<(), QueueError> {
        self.store.close().await?;
        Ok(())
    }

    /// Submits `handler(args, kwargs)` for execution, optionally not
    /// before `eta`, with an opaque `context` blob carried alongside.
    /// Returns the assigned [`TaskId`].
    pub async fn enqueue(
        &self,
        handler: &str,
        args: Value,
        kwargs: Value,
        eta: Option<DateTime<Utc>>,
        context: Option<Vec<u8>>,
    ) -> Result<TaskId, QueueError> {
        if handler.trim().is_empty() {
            return Err(ValidationError::MissingHandler.into());
        }

        let task_id = uuid::Uuid::new_v4().to_string();
        let available_at = eta.unwrap_or_else(Utc::now);
        let payload = self
            .codec
            .encode_envelope(handler, args, kwargs, context)
            .map_err(QueueError::Codec)?;

        self.store.enqueue(&task_id, payload, available_at).await?;
        Ok(task_id)
    }

    /// Polls `Store::get_result` until a terminal [`TaskResult`] appears or
    /// `timeout` elapses. `None` signals "not ready yet"; a timeout is
    /// never raised as an error (spec §4.2: callers distinguish "not
    /// ready" from "failed" this way).
    ///
    /// `timeout = Some(Duration::ZERO)` probes once and returns
    /// immediately (spec §9 Open Question decision).
    pub async fn get_result(
        &self,
        task_id: &TaskId,
        timeout: Option<Duration>,
    ) -> Result<Option<TaskResult>, QueueError> {
        let timeout = timeout.or(self.options.default_result_timeout);
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);

        let mut interval = MIN_POLL_INTERVAL;
        loop {
            if let Some(result) = self.store.get_result(task_id).await? {
                return Ok(Some(result));
            }

            let Some(deadline) = deadline else {
                tokio::time::sleep(interval).await;
                interval = (interval * 2).min(MAX_POLL_INTERVAL);
                continue;
            };

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let sleep_for = interval.min(deadline - now);
            tokio::time::sleep(sleep_for).await;
            interval = (interval * 2).min(MAX_POLL_INTERVAL);
        }
    }

    /// Convenience: decodes `result.value` via the configured codec.
    pub fn deserialize_result(&self, result: &TaskResult) -> Result<Value, QueueError> {
        match &result.value {
            Some(bytes) => self.codec.decode_value(bytes).map_err(QueueError::Codec),
            None => Ok(Value::Null),
        }
    }
}
