//! The handler registry: the sole source of truth for which dotted names
//! exist and what to do with them.
//!
//! Three handler shapes are supported:
//! - **procedure** — request/response, returns one value
//! - **stream** — lazy terminating sequence, produced through a [`StreamSink`]
//! - **event** — fire-and-forget, no reply
//!
//! Writes happen at setup time (or under the hot-reload swap protocol via
//! [`SharedRegistry`]); reads are safe for concurrent use during serving.

use crate::context::Context;
use crate::middleware::{BoxFuture, Interceptor};
use crate::validator::Validator;
use sb_protocol::{ErrorCode, RpcError};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Handler function types
// ---------------------------------------------------------------------------

pub type ProcedureFn =
    Arc<dyn Fn(Value, Context) -> BoxFuture<'static, Result<Value, RpcError>> + Send + Sync>;

pub type StreamFn = Arc<
    dyn Fn(Value, Context, StreamSink) -> BoxFuture<'static, Result<(), RpcError>> + Send + Sync,
>;

pub type EventFn =
    Arc<dyn Fn(Value, Context) -> BoxFuture<'static, Result<(), RpcError>> + Send + Sync>;

#[derive(Clone)]
pub enum HandlerFn {
    Procedure(ProcedureFn),
    Stream(StreamFn),
    Event(EventFn),
}

/// The producer side of a stream invocation.
///
/// Values sent here become `stream:data` frames tagged with the initiating
/// envelope's id.  The channel is bounded, so a slow consumer exerts
/// backpressure on the producer.  `send` fails once the request context is
/// cancelled or the consumer is gone; producers may treat that as a stop
/// signal and return `Ok(())` for a graceful `stream:end`, or propagate the
/// error for a `stream:error`.
#[derive(Clone)]
pub struct StreamSink {
    tx: mpsc::Sender<sb_protocol::Envelope>,
    origin_id: String,
    cancel: crate::context::CancelToken,
}

impl StreamSink {
    pub(crate) fn new(
        tx: mpsc::Sender<sb_protocol::Envelope>,
        origin_id: String,
        cancel: crate::context::CancelToken,
    ) -> Self {
        StreamSink {
            tx,
            origin_id,
            cancel,
        }
    }

    pub async fn send(&self, value: Value) -> Result<(), RpcError> {
        if self.cancel.is_cancelled() {
            return Err(RpcError::cancelled());
        }
        let frame = sb_protocol::Envelope::stream_data(&self.origin_id, value);
        tokio::select! {
            _ = self.cancel.cancelled() => Err(RpcError::cancelled()),
            sent = self.tx.send(frame) => {
                sent.map_err(|_| RpcError::cancelled())
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }
}

// ---------------------------------------------------------------------------
// Kinds and per-kind metadata
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Procedure,
    Stream,
    Event,
}

impl HandlerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            HandlerKind::Procedure => "procedure",
            HandlerKind::Stream => "stream",
            HandlerKind::Event => "event",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamDirection {
    #[default]
    ServerToClient,
    ClientToServer,
    Bidirectional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryGuarantee {
    #[default]
    BestEffort,
    AtMostOnce,
    AtLeastOnce,
}

/// Retry policy for `at-least-once` event handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for EventRetryPolicy {
    fn default() -> Self {
        EventRetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

/// Explicit HTTP route binding; without one, the HTTP adapter serves the
/// handler at `POST /<dotted.name>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpBinding {
    pub method: String,
    pub path: String,
}

// ---------------------------------------------------------------------------
// Registration options
// ---------------------------------------------------------------------------

#[derive(Default, Clone)]
pub struct ProcedureOptions {
    pub description: Option<String>,
    pub input_schema: Option<Value>,
    pub output_schema: Option<Value>,
    pub middleware: Vec<Arc<dyn Interceptor>>,
    pub http: Option<HttpBinding>,
}

impl ProcedureOptions {
    pub fn input_schema(mut self, schema: Value) -> Self {
        self.input_schema = Some(schema);
        self
    }

    pub fn output_schema(mut self, schema: Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.description = Some(text.into());
        self
    }

    pub fn middleware(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.middleware.push(interceptor);
        self
    }

    pub fn http(mut self, method: impl Into<String>, path: impl Into<String>) -> Self {
        self.http = Some(HttpBinding {
            method: method.into().to_ascii_uppercase(),
            path: path.into(),
        });
        self
    }
}

#[derive(Default, Clone)]
pub struct StreamOptions {
    pub description: Option<String>,
    pub input_schema: Option<Value>,
    pub middleware: Vec<Arc<dyn Interceptor>>,
    pub direction: StreamDirection,
}

impl StreamOptions {
    pub fn input_schema(mut self, schema: Value) -> Self {
        self.input_schema = Some(schema);
        self
    }

    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.description = Some(text.into());
        self
    }

    pub fn middleware(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.middleware.push(interceptor);
        self
    }

    pub fn direction(mut self, direction: StreamDirection) -> Self {
        self.direction = direction;
        self
    }
}

#[derive(Clone)]
pub struct EventOptions {
    pub description: Option<String>,
    pub input_schema: Option<Value>,
    pub middleware: Vec<Arc<dyn Interceptor>>,
    pub delivery: DeliveryGuarantee,
    pub retry: EventRetryPolicy,
    /// Window during which a re-delivered envelope id is ignored.
    pub dedup_window: Duration,
}

impl Default for EventOptions {
    fn default() -> Self {
        EventOptions {
            description: None,
            input_schema: None,
            middleware: Vec::new(),
            delivery: DeliveryGuarantee::default(),
            retry: EventRetryPolicy::default(),
            dedup_window: Duration::from_secs(60),
        }
    }
}

impl EventOptions {
    pub fn delivery(mut self, delivery: DeliveryGuarantee) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn retry(mut self, retry: EventRetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window;
        self
    }

    pub fn input_schema(mut self, schema: Value) -> Self {
        self.input_schema = Some(schema);
        self
    }

    pub fn middleware(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.middleware.push(interceptor);
        self
    }
}

// ---------------------------------------------------------------------------
// Registry entry
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct HandlerEntry {
    pub name: String,
    pub kind: HandlerKind,
    pub handler: HandlerFn,
    pub description: Option<String>,
    pub input_schema: Option<Value>,
    pub output_schema: Option<Value>,
    pub middleware: Vec<Arc<dyn Interceptor>>,
    pub http: Option<HttpBinding>,
    pub stream_direction: Option<StreamDirection>,
    pub delivery: Option<DeliveryGuarantee>,
    pub event_retry: Option<EventRetryPolicy>,
    pub dedup_window: Option<Duration>,
}

impl std::fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("name", &self.name)
            .field("kind", &self.kind.as_str())
            .field("middleware", &self.middleware.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("handler '{0}' already registered")]
    Duplicate(String),
}

impl From<RegistryError> for RpcError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::Duplicate(name) => RpcError::new(
                ErrorCode::AlreadyExists,
                format!("handler '{name}' already registered"),
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct Registry {
    entries: HashMap<String, Arc<HandlerEntry>>,
    validator: Option<Arc<dyn Validator>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            entries: HashMap::new(),
            validator: None,
        }
    }

    /// Constructor injection of the validation backend; schemas stay opaque
    /// to the registry itself.
    pub fn with_validator(validator: Arc<dyn Validator>) -> Self {
        Registry {
            entries: HashMap::new(),
            validator: Some(validator),
        }
    }

    pub fn validator(&self) -> Option<Arc<dyn Validator>> {
        self.validator.clone()
    }

    pub fn register_procedure<F, Fut>(
        &mut self,
        name: impl Into<String>,
        handler: F,
        options: ProcedureOptions,
    ) -> Result<(), RegistryError>
    where
        F: Fn(Value, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        let name = name.into();
        let boxed: ProcedureFn = Arc::new(move |payload, ctx| Box::pin(handler(payload, ctx)));
        self.insert(HandlerEntry {
            name: name.clone(),
            kind: HandlerKind::Procedure,
            handler: HandlerFn::Procedure(boxed),
            description: options.description,
            input_schema: options.input_schema,
            output_schema: options.output_schema,
            middleware: options.middleware,
            http: options.http,
            stream_direction: None,
            delivery: None,
            event_retry: None,
            dedup_window: None,
        })
    }

    pub fn register_stream<F, Fut>(
        &mut self,
        name: impl Into<String>,
        handler: F,
        options: StreamOptions,
    ) -> Result<(), RegistryError>
    where
        F: Fn(Value, Context, StreamSink) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), RpcError>> + Send + 'static,
    {
        let name = name.into();
        let boxed: StreamFn =
            Arc::new(move |payload, ctx, sink| Box::pin(handler(payload, ctx, sink)));
        self.insert(HandlerEntry {
            name: name.clone(),
            kind: HandlerKind::Stream,
            handler: HandlerFn::Stream(boxed),
            description: options.description,
            input_schema: options.input_schema,
            output_schema: None,
            middleware: options.middleware,
            http: None,
            stream_direction: Some(options.direction),
            delivery: None,
            event_retry: None,
            dedup_window: None,
        })
    }

    pub fn register_event<F, Fut>(
        &mut self,
        name: impl Into<String>,
        handler: F,
        options: EventOptions,
    ) -> Result<(), RegistryError>
    where
        F: Fn(Value, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), RpcError>> + Send + 'static,
    {
        let name = name.into();
        let boxed: EventFn = Arc::new(move |payload, ctx| Box::pin(handler(payload, ctx)));
        self.insert(HandlerEntry {
            name: name.clone(),
            kind: HandlerKind::Event,
            handler: HandlerFn::Event(boxed),
            description: options.description,
            input_schema: options.input_schema,
            output_schema: None,
            middleware: options.middleware,
            http: None,
            stream_direction: None,
            delivery: Some(options.delivery),
            event_retry: Some(options.retry),
            dedup_window: Some(options.dedup_window),
        })
    }

    fn insert(&mut self, entry: HandlerEntry) -> Result<(), RegistryError> {
        if self.entries.contains_key(&entry.name) {
            return Err(RegistryError::Duplicate(entry.name));
        }
        self.entries.insert(entry.name.clone(), Arc::new(entry));
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<HandlerEntry>> {
        self.entries.get(name).cloned()
    }

    /// All entries, sorted by name for stable iteration.
    pub fn list(&self) -> Vec<Arc<HandlerEntry>> {
        let mut entries: Vec<_> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Hot-reload shared handle
// ---------------------------------------------------------------------------

/// Atomic-swap wrapper for serving: readers take an `Arc` snapshot, so
/// in-flight requests complete against the registry they started with while
/// a hot reload replaces the whole thing at once — never a mixture.
pub struct SharedRegistry {
    inner: RwLock<Arc<Registry>>,
}

impl SharedRegistry {
    pub fn new(registry: Registry) -> Self {
        SharedRegistry {
            inner: RwLock::new(Arc::new(registry)),
        }
    }

    pub fn load(&self) -> Arc<Registry> {
        self.inner.read().expect("registry lock poisoned").clone()
    }

    /// Replace the registry wholesale; returns the previous snapshot.
    pub fn swap(&self, registry: Registry) -> Arc<Registry> {
        let mut guard = self.inner.write().expect("registry lock poisoned");
        std::mem::replace(&mut guard, Arc::new(registry))
    }
}
