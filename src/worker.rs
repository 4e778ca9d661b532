//! The Worker: a bounded-concurrency scheduler that polls the Store,
//! dispatches reserved tasks to registered handlers, and reports terminal
//! outcomes back (spec §4.3, §6).
//!
//! Grounded on the teacher's `reqactor::Actor::serve_in_background`: a
//! `tokio::sync::Semaphore` sized to `max_concurrency`, one spawned task per
//! unit of dispatched work, a `tokio::sync::Notify` used to wake the loop
//! early. Three deliberate departures from that pattern, recorded in
//! DESIGN.md: the permit is acquired *before* a task is spawned rather than
//! inside it (spec §4.3 requires capacity to bound how much is reserved, not
//! just how much runs); dispatches are tracked with a `JoinSet` instead of a
//! manual `mpsc` done-channel, since draining needs to await everything in
//! flight rather than just observe completions; and a handler panic is
//! caught with `futures::FutureExt::catch_unwind` and turned into a `failed`
//! row instead of propagating out of the spawned task.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::{AssertUnwindSafe, FutureExt};
use serde_json::Value;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::task::JoinSet;

use crate::codec::{EnvelopeCodec, Handler, HandlerKind, HandlerRegistry};
use crate::error::{HandlerError, ValidationError, WorkerError};
use crate::store::{ReservedTask, Store};

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const DRAINING: u8 = 2;
const STOPPED: u8 = 3;

/// Observable lifecycle state of a [`Worker`] (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Running,
    Draining,
    Stopped,
}

fn state_from_u8(v: u8) -> WorkerState {
    match v {
        IDLE => WorkerState::Idle,
        RUNNING => WorkerState::Running,
        DRAINING => WorkerState::Draining,
        STOPPED => WorkerState::Stopped,
        _ => unreachable!("worker state out of range"),
    }
}

/// Construction options for [`Worker`].
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Upper bound on simultaneously in-flight dispatches.
    pub max_concurrency: usize,

    /// How long the polling loop waits between reservation attempts that
    /// came back empty, and the ceiling on how long it waits while at full
    /// capacity.
    pub poll_interval: Duration,

    /// Upper bound on how many tasks a single `reserve()` call may claim at
    /// once; further capped by the permits actually available.
    pub batch_size: usize,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 1,
            poll_interval: Duration::from_millis(500),
            batch_size: 10,
        }
    }
}

/// Polls the Store for eligible work and dispatches it to registered
/// handlers under a strict concurrency bound. One `Worker` owns one polling
/// loop; multiple workers (in this process or others) may share a Store
/// safely, since reservation is the Store's atomic primitive, not the
/// Worker's (spec §5).
pub struct Worker {
    store: Arc<dyn Store>,
    codec: Arc<dyn EnvelopeCodec>,
    registry: Arc<HandlerRegistry>,
    options: WorkerOptions,
    state: Arc<AtomicU8>,
    drain_notify: Arc<Notify>,
    semaphore: Arc<Semaphore>,
    loop_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Worker {
    /// Validates `options` and builds a worker in the `idle` state. Call
    /// [`Worker::start`] to begin polling.
    pub fn new(
        store: Arc<dyn Store>,
        codec: Arc<dyn EnvelopeCodec>,
        registry: Arc<HandlerRegistry>,
        options: WorkerOptions,
    ) -> Result<Self, ValidationError> {
        if options.max_concurrency == 0 {
            return Err(ValidationError::NonPositiveConcurrency);
        }
        if options.batch_size == 0 {
            return Err(ValidationError::NonPositiveBatchSize);
        }
        let semaphore = Arc::new(Semaphore::new(options.max_concurrency));
        Ok(Self {
            store,
            codec,
            registry,
            options,
            state: Arc::new(AtomicU8::new(IDLE)),
            drain_notify: Arc::new(Notify::new()),
            semaphore,
            loop_handle: Mutex::new(None),
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        state_from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Permits currently unclaimed. Equals `max_concurrency` whenever no
    /// dispatch is in flight; used by tests to assert no permit leaks past
    /// `stop()` (spec §5 testable property).
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Transitions `idle -> running` and spawns the polling loop. Calling
    /// `start` twice, or on a worker that is draining or stopped, is an
    /// error; this is the one operation the spec requires to fail loudly
    /// rather than absorb into a `failed` row, since there's no task to
    /// attach the failure to.
    pub fn start(self: &Arc<Self>) -> Result<(), WorkerError> {
        self.state
            .compare_exchange(IDLE, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|current| match state_from_u8(current) {
                WorkerState::Stopped => WorkerError::InvalidState("worker has already stopped"),
                _ => WorkerError::InvalidState("worker is already running"),
            })?;

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.run().await });

        // `start` is synchronous and cannot itself be async (it hands back
        // control before the loop's first iteration runs), so stash the
        // handle with `try_lock`: nothing else can hold this mutex yet
        // because `state` only just flipped to `Running`.
        *self
            .loop_handle
            .try_lock()
            .expect("loop handle uncontended immediately after start") = Some(handle);
        Ok(())
    }

    /// Requests a graceful drain: stop reserving new work, let every
    /// in-flight dispatch finish, then transition to `stopped`. Idempotent
    /// and safe to call concurrently or before `start` (spec §6 shutdown
    /// contract).
    pub async fn stop(&self) -> Result<(), WorkerError> {
        loop {
            match self.state.load(Ordering::SeqCst) {
                STOPPED => return Ok(()),
                IDLE => {
                    // Never started: nothing to drain.
                    self.state.store(STOPPED, Ordering::SeqCst);
                    return Ok(());
                }
                RUNNING => {
                    if self
                        .state
                        .compare_exchange(RUNNING, DRAINING, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        self.drain_notify.notify_waiters();
                    }
                    // Either we just flipped it, or a racing caller did; in
                    // both cases loop around to the `DRAINING` arm.
                }
                DRAINING => {
                    let handle = self.loop_handle.lock().await.take();
                    if let Some(handle) = handle {
                        let _ = handle.await;
                    }
                    self.state.store(STOPPED, Ordering::SeqCst);
                    return Ok(());
                }
                other => unreachable!("worker state out of range: {other}"),
            }
        }
    }

    async fn run(self: Arc<Self>) {
        let mut dispatches: JoinSet<()> = JoinSet::new();

        loop {
            while let Some(joined) = dispatches.try_join_next() {
                log_join_error(joined);
            }

            if self.state.load(Ordering::SeqCst) == DRAINING {
                break;
            }

            let capacity = self.semaphore.available_permits().min(self.options.batch_size);
            if capacity == 0 {
                self.wait_a_bit(&mut dispatches).await;
                continue;
            }

            let now = Utc::now();
            match self.store.reserve(capacity, now).await {
                Ok(reserved) if reserved.is_empty() => {
                    self.wait_a_bit(&mut dispatches).await;
                }
                Ok(reserved) => {
                    for task in reserved {
                        let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
                            Ok(permit) => permit,
                            Err(_) => return, // semaphore closed: worker is gone
                        };
                        let store = Arc::clone(&self.store);
                        let codec = Arc::clone(&self.codec);
                        let registry = Arc::clone(&self.registry);
                        dispatches.spawn(async move {
                            dispatch(store, codec, registry, task).await;
                            drop(permit);
                        });
                    }
                    // A partial batch is a sign the queue is thin, not
                    // stalled: loop straight back around rather than sleep,
                    // so the next `reserve()` sees any work enqueued since.
                }
                Err(err) => {
                    tracing::error!("worker failed to reserve tasks: {err}");
                    self.wait_a_bit(&mut dispatches).await;
                }
            }
        }

        // Draining: let everything already dispatched finish before this
        // task (and therefore `stop()`'s await) returns.
        while let Some(joined) = dispatches.join_next().await {
            log_join_error(joined);
        }
    }

    async fn wait_a_bit(&self, dispatches: &mut JoinSet<()>) {
        tokio::select! {
            _ = tokio::time::sleep(self.options.poll_interval) => {}
            _ = self.drain_notify.notified() => {}
            Some(joined) = dispatches.join_next() => log_join_error(joined),
        }
    }
}

fn log_join_error(joined: Result<(), tokio::task::JoinError>) {
    if let Err(err) = joined {
        if err.is_panic() {
            tracing::error!("a dispatch task panicked past its own panic guard: {err}");
        }
    }
}

async fn dispatch(
    store: Arc<dyn Store>,
    codec: Arc<dyn EnvelopeCodec>,
    registry: Arc<HandlerRegistry>,
    task: ReservedTask,
) {
    let envelope = match codec.decode_envelope(&task.payload) {
        Ok(envelope) => envelope,
        Err(err) => {
            fail(&store, &task.id, format!("failed to decode task payload: {err}"), None).await;
            return;
        }
    };

    let Some(kind) = registry.get(&envelope.handler) else {
        fail(
            &store,
            &task.id,
            format!("no handler registered for '{}'", envelope.handler),
            None,
        )
        .await;
        return;
    };

    match execute(kind, envelope.args, envelope.kwargs).await {
        Ok(value) => match codec.encode_value(&value) {
            Ok(bytes) => {
                if let Err(err) = store.mark_success(&task.id, bytes, Utc::now()).await {
                    tracing::error!("worker failed to record success for {}: {err}", task.id);
                }
            }
            Err(err) => {
                fail(
                    &store,
                    &task.id,
                    format!("failed to encode handler result: {err}"),
                    None,
                )
                .await;
            }
        },
        Err(herr) => fail(&store, &task.id, herr.message, herr.traceback).await,
    }
}

async fn fail(store: &Arc<dyn Store>, task_id: &str, error: String, traceback: Option<String>) {
    if let Err(err) = store
        .mark_failure(&task_id.to_string(), error, traceback, Utc::now())
        .await
    {
        tracing::error!("worker failed to record failure for {task_id}: {err}");
    }
}

/// Runs one handler to completion, catching panics across the await point
/// and converting them into a [`HandlerError`] instead of letting them
/// unwind out of the dispatch task.
async fn execute(kind: &HandlerKind, args: Value, kwargs: Value) -> Result<Value, HandlerError> {
    match kind {
        HandlerKind::Async(handler) => {
            let handler: Arc<dyn Handler> = Arc::clone(handler);
            let fut = async move { handler.call(args, kwargs).await };
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(panic_to_handler_error(panic)),
            }
        }
        HandlerKind::Blocking(handler) => {
            let handler = Arc::clone(handler);
            let joined = tokio::task::spawn_blocking(move || {
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    handler.call(args, kwargs)
                }))
            })
            .await;
            match joined {
                Ok(Ok(result)) => result,
                Ok(Err(panic)) => Err(panic_to_handler_error(panic)),
                Err(join_err) => Err(HandlerError::new(format!(
                    "handler task was cancelled or panicked: {join_err}"
                ))),
            }
        }
    }
}

fn panic_to_handler_error(panic: Box<dyn std::any::Any + Send>) -> HandlerError {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked with a non-string payload".to_string());
    HandlerError::with_traceback(message.clone(), format!("panic: {message}"))
}
