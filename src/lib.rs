//! `taskq`: a durable, embedded task queue.
//!
//! A Producer ([`TaskQueue`]) enqueues work against a durable [`Store`],
//! which hands it out to one or more [`Worker`]s under a strict concurrency
//! bound. Producers and workers may live in the same process or different
//! ones; the only thing they need to agree on is the Store and the
//! [`EnvelopeCodec`] used to serialize payloads.
//!
//! ```text
//!      enqueue()                 reserve()
//! Producer --------> [ Store ] <----------- Worker
//!      ^                                        |
//!      |              get_result()              |
//!      +---------------------------- mark_success / mark_failure
//! ```
//!
//! The reference [`SqliteStore`] persists tasks to a single SQLite file (or
//! an in-process `:memory:` database for tests), using an atomic
//! `UPDATE ... RETURNING` to make reservation safe across concurrent
//! pollers. Task payloads are opaque to the core: a [`HandlerRegistry`]
//! resolves a stable handler id to the code that runs it, so the queue never
//! needs to serialize a closure.

pub mod codec;
pub mod error;
pub mod producer;
pub mod result;
pub mod store;
pub mod worker;

pub use codec::{BlockingHandler, Envelope, EnvelopeCodec, Handler, HandlerRegistry, JsonCodec};
pub use error::{CodecError, HandlerError, QueueError, StoreError, ValidationError, WorkerError};
pub use producer::{TaskQueue, TaskQueueOptions};
pub use result::{TaskOutcome, TaskResult};
pub use store::{ReservedTask, SqliteStore, Store, StoreOptions, TaskId, TaskState};
pub use worker::{Worker, WorkerOptions, WorkerState};
