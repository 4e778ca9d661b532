//! The reference durable Store: a single-file relational store with
//! WAL-style concurrency, and an in-process variant sharing one
//! connection (spec §4.1, §6).
//!
//! Grounded on the teacher's `TaskDb` (`adv_sqlite.rs`/`task_manager`):
//! the same `OpenFlags`/pragma sequence, the same `open_or_create` shape.
//! The atomic reservation query is grounded on the `apalis`-derived sqlite
//! backend's `fetch_next` (`UPDATE ... WHERE status = 'Pending' ...
//! RETURNING *`), extended with spec's tie-break ordering via a bounded
//! subquery.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags};

use crate::error::StoreError;
use crate::result::{TaskOutcome, TaskResult};
use crate::store::{ReservedTask, Store, TaskId, TaskState};

/// Tuning knobs for the reference store.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// How long a connection blocks waiting on `SQLITE_BUSY` before
    /// surfacing `StoreError::Io`.
    pub busy_timeout: Duration,

    /// If set, `connect()` sweeps `in_progress` rows whose `started_at` is
    /// older than this horizon back to `pending` (spec §9 Open Question:
    /// "In-progress lease recovery"). Default: disabled, matching the
    /// reference implementation's documented lack of a lease: a crashed
    /// worker's tasks are not retried without this opt-in.
    pub lease_horizon: Option<Duration>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_secs(5),
            lease_horizon: None,
        }
    }
}

#[derive(Debug)]
enum Backend {
    File(PathBuf),
    Memory,
}

/// Durable store backed by SQLite. Construct with [`SqliteStore::open_file`]
/// for a persistent, crash-durable database, or [`SqliteStore::open_memory`]
/// for a purely in-process instance intended for tests.
#[derive(Debug)]
pub struct SqliteStore {
    backend: Backend,
    options: StoreOptions,
    // A single shared, mutex-guarded connection for both backends. The
    // in-memory variant requires this (a `:memory:` URI is a private
    // per-connection database, spec §4.1/§9); the file-backed variant
    // could instead use a per-operation connection or a pool, but spec
    // explicitly permits either strategy as long as the concurrency
    // properties in §5 hold, so one code path covers both (Open Question
    // decision, see DESIGN.md).
    conn: Arc<Mutex<Option<Connection>>>,
}

impl SqliteStore {
    /// Open (creating if absent) a durable, file-backed store at `path`.
    pub fn open_file(path: impl Into<PathBuf>, options: StoreOptions) -> Self {
        Self {
            backend: Backend::File(path.into()),
            options,
            conn: Arc::new(Mutex::new(None)),
        }
    }

    /// Open a purely in-process store. Intended as a testing tool, not a
    /// production path: it is single-writer by construction (spec §9).
    pub fn open_memory(options: StoreOptions) -> Self {
        Self {
            backend: Backend::Memory,
            options,
            conn: Arc::new(Mutex::new(None)),
        }
    }

    fn open_connection(&self) -> Result<Connection, StoreError> {
        let conn = match &self.backend {
            Backend::File(path) => {
                let conn = Connection::open_with_flags(
                    path,
                    OpenFlags::SQLITE_OPEN_READ_WRITE
                        | OpenFlags::SQLITE_OPEN_CREATE
                        | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                )
                .map_err(|e| StoreError::Connect(e.to_string()))?;
                conn.pragma_update(None, "journal_mode", "WAL")
                    .map_err(|e| StoreError::Connect(e.to_string()))?;
                conn.pragma_update(None, "synchronous", "NORMAL")
                    .map_err(|e| StoreError::Connect(e.to_string()))?;
                conn
            }
            Backend::Memory => Connection::open_in_memory()
                .map_err(|e| StoreError::Connect(e.to_string()))?,
        };
        conn.pragma_update(None, "foreign_keys", true)
            .map_err(|e| StoreError::Connect(e.to_string()))?;
        conn.pragma_update(None, "temp_store", "MEMORY")
            .map_err(|e| StoreError::Connect(e.to_string()))?;
        conn.busy_timeout(self.options.busy_timeout)
            .map_err(|e| StoreError::Connect(e.to_string()))?;
        create_schema(&conn)?;
        Ok(conn)
    }

    fn sweep_stranded(&self, conn: &Connection) -> Result<(), StoreError> {
        let Some(horizon) = self.options.lease_horizon else {
            return Ok(());
        };
        let cutoff = Utc::now()
            - chrono::Duration::from_std(horizon)
                .unwrap_or_else(|_| chrono::Duration::zero());
        conn.execute(
            "UPDATE tasks SET status = 'pending', started_at = NULL
             WHERE status = 'in_progress' AND started_at <= ?1",
            params![cutoff],
        )?;
        Ok(())
    }

    /// Run `f` with exclusive access to the live connection, off the async
    /// runtime's reactor thread (every `rusqlite` call is blocking).
    async fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            match guard.as_ref() {
                Some(conn) => f(conn),
                None => Err(StoreError::Closed),
            }
        })
        .await
        .map_err(|e| StoreError::Io(format!("store task panicked: {e}")))?
    }
}

fn create_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id           TEXT PRIMARY KEY NOT NULL,
            status       TEXT NOT NULL,
            payload      BLOB NOT NULL,
            value        BLOB,
            error        TEXT,
            traceback    TEXT,
            available_at TEXT NOT NULL,
            enqueued_at  TEXT NOT NULL,
            started_at   TEXT,
            finished_at  TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_tasks_status_available
            ON tasks(status, available_at);
        "#,
    )?;
    Ok(())
}

#[async_trait]
impl Store for SqliteStore {
    async fn connect(&self) -> Result<(), StoreError> {
        let conn = self.conn.clone();
        let new_conn = {
            let guard = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.is_none()
        };
        if !new_conn {
            // Idempotent: already connected, nothing to do.
            return Ok(());
        }
        let opened = self.open_connection()?;
        self.sweep_stranded(&opened)?;
        let mut guard = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Some(opened);
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            *guard = None;
        })
        .await
        .map_err(|e| StoreError::Io(format!("store task panicked: {e}")))?;
        Ok(())
    }

    async fn enqueue(
        &self,
        task_id: &TaskId,
        payload: Vec<u8>,
        available_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let id = task_id.clone();
        let enqueued_at = Utc::now();
        self.with_conn(move |conn| {
            let result = conn.execute(
                "INSERT INTO tasks (id, status, payload, available_at, enqueued_at)
                 VALUES (?1, 'pending', ?2, ?3, ?4)",
                params![id, payload, available_at, enqueued_at],
            );
            match result {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Err(StoreError::Duplicate(id.clone()))
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn reserve(
        &self,
        max_items: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReservedTask>, StoreError> {
        if max_items == 0 {
            return Ok(Vec::new());
        }
        let max_items = max_items as i64;
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "UPDATE tasks
                 SET status = 'in_progress', started_at = ?1
                 WHERE id IN (
                     SELECT id FROM tasks
                     WHERE status = 'pending' AND available_at <= ?1
                     ORDER BY available_at ASC, enqueued_at ASC, rowid ASC
                     LIMIT ?2
                 )
                 RETURNING id, payload, started_at",
            )?;
            let rows = stmt.query_map(params![now, max_items], |row| {
                Ok(ReservedTask {
                    id: row.get(0)?,
                    payload: row.get(1)?,
                    started_at: row.get(2)?,
                })
            })?;
            let mut reserved = Vec::with_capacity(max_items as usize);
            for row in rows {
                reserved.push(row?);
            }
            Ok(reserved)
        })
        .await
    }

    async fn mark_success(
        &self,
        task_id: &TaskId,
        value: Vec<u8>,
        finished_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let id = task_id.clone();
        self.with_conn(move |conn| {
            let affected = conn.execute(
                "UPDATE tasks SET status = 'success', value = ?1, finished_at = ?2
                 WHERE id = ?3 AND status = 'in_progress'",
                params![value, finished_at, id],
            )?;
            Ok(affected > 0)
        })
        .await
    }

    async fn mark_failure(
        &self,
        task_id: &TaskId,
        error: String,
        traceback: Option<String>,
        finished_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let id = task_id.clone();
        self.with_conn(move |conn| {
            let affected = conn.execute(
                "UPDATE tasks SET status = 'failed', error = ?1, traceback = ?2, finished_at = ?3
                 WHERE id = ?4 AND status = 'in_progress'",
                params![error, traceback, finished_at, id],
            )?;
            Ok(affected > 0)
        })
        .await
    }

    async fn get_result(&self, task_id: &TaskId) -> Result<Option<TaskResult>, StoreError> {
        let id = task_id.clone();
        self.with_conn(move |conn| {
            let row = conn.query_row(
                "SELECT status, value, error, traceback, enqueued_at, started_at, finished_at
                 FROM tasks WHERE id = ?1",
                params![id],
                |row| {
                    let status: String = row.get(0)?;
                    Ok((
                        TaskState::from_sql(&status),
                        row.get::<_, Option<Vec<u8>>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, DateTime<Utc>>(4)?,
                        row.get::<_, Option<DateTime<Utc>>>(5)?,
                        row.get::<_, Option<DateTime<Utc>>>(6)?,
                    ))
                },
            );
            let (status, value, error, traceback, enqueued_at, started_at, finished_at) =
                match row {
                    Ok(row) => row,
                    Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
                    Err(e) => return Err(e.into()),
                };

            let outcome = match status {
                TaskState::Success => TaskOutcome::Success,
                TaskState::Failed => TaskOutcome::Failed,
                // Not yet terminal: "not ready", signaled as `None`.
                TaskState::Pending | TaskState::InProgress => return Ok(None),
            };

            Ok(Some(TaskResult {
                task_id: id.clone(),
                status: outcome,
                value,
                error,
                traceback,
                enqueued_at,
                started_at: started_at.unwrap_or(enqueued_at),
                finished_at: finished_at.unwrap_or(enqueued_at),
            }))
        })
        .await
    }
}
