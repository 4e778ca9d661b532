//! The Codec contract and the registered-handler model that replaces
//! "callables as payloads" (spec §9, REDESIGN FLAG).
//!
//! The core never inspects an [`Envelope`]'s fields beyond routing on
//! `handler`; everything else is opaque, same as the source's codec
//! boundary.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{CodecError, HandlerError};

/// Opaque-to-the-core payload: a stable handler id plus its arguments and
/// an optional opaque context blob.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub handler: String,
    pub args: Value,
    pub kwargs: Value,
    pub context: Option<Vec<u8>>,
}

/// Converts handler invocations and return values to and from bytes.
/// Consumed by the core; never inspected beyond round-tripping.
pub trait EnvelopeCodec: Send + Sync {
    fn encode_envelope(
        &self,
        handler: &str,
        args: Value,
        kwargs: Value,
        context: Option<Vec<u8>>,
    ) -> Result<Vec<u8>, CodecError>;

    fn decode_envelope(&self, bytes: &[u8]) -> Result<Envelope, CodecError>;

    fn encode_value(&self, value: &Value) -> Result<Vec<u8>, CodecError>;

    fn decode_value(&self, bytes: &[u8]) -> Result<Value, CodecError>;
}

/// Default codec: JSON envelopes and JSON-encoded values. Round-trips
/// `serde_json::Value::Null` faithfully, satisfying the round-trip
/// invariant for `none` return values.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

#[derive(serde::Serialize, serde::Deserialize)]
struct WireEnvelope {
    handler: String,
    args: Value,
    kwargs: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<Vec<u8>>,
}

impl EnvelopeCodec for JsonCodec {
    fn encode_envelope(
        &self,
        handler: &str,
        args: Value,
        kwargs: Value,
        context: Option<Vec<u8>>,
    ) -> Result<Vec<u8>, CodecError> {
        let wire = WireEnvelope {
            handler: handler.to_owned(),
            args,
            kwargs,
            context,
        };
        serde_json::to_vec(&wire).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode_envelope(&self, bytes: &[u8]) -> Result<Envelope, CodecError> {
        let wire: WireEnvelope =
            serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))?;
        Ok(Envelope {
            handler: wire.handler,
            args: wire.args,
            kwargs: wire.kwargs,
            context: wire.context,
        })
    }

    fn encode_value(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode_value(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// An asynchronous handler, resolved by name from a [`HandlerRegistry`].
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, args: Value, kwargs: Value) -> Result<Value, HandlerError>;
}

/// A synchronous handler that must be offloaded to a dedicated pool so it
/// cannot block the worker's scheduling context (spec §4.3 dispatch
/// contract, point 2).
pub trait BlockingHandler: Send + Sync {
    fn call(&self, args: Value, kwargs: Value) -> Result<Value, HandlerError>;
}

pub(crate) enum HandlerKind {
    Async(Arc<dyn Handler>),
    Blocking(Arc<dyn BlockingHandler>),
}

/// Process-local map from handler id to executable handler, populated at
/// worker-construction time: a small closed lookup table indexed by a
/// stable id, same shape as a proof-system or status-code table.
#[derive(Default)]
pub struct HandlerRegistry {
    pub(crate) handlers: HashMap<String, HandlerKind>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register an async handler under `name`.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn Handler>) -> &mut Self {
        self.handlers
            .insert(name.into(), HandlerKind::Async(handler));
        self
    }

    /// Register a synchronous handler under `name`; dispatch offloads it
    /// via `tokio::task::spawn_blocking`.
    pub fn register_blocking(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn BlockingHandler>,
    ) -> &mut Self {
        self.handlers
            .insert(name.into(), HandlerKind::Blocking(handler));
        self
    }

    pub(crate) fn get(&self, name: &str) -> Option<&HandlerKind> {
        self.handlers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
