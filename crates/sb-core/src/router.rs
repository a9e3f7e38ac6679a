//! The router: resolves envelopes to handlers, runs the composed middleware
//! chain, and enforces request/stream/event reply semantics.
//!
//! Execution-time middleware order is global → per-handler → validation →
//! terminal dispatch; responses unwind in reverse.  The router never lets an
//! error escape: every failure becomes an error envelope (or, for streams
//! already in flight, a `stream:error` terminal frame).
//!
//! Stream state machine:
//!
//! ```text
//!         start ──► streaming ──► ended        (normal)
//!                      │
//!                      └──► errored            (handler error)
//!                      │
//!                      └──► cancelled          (context cancelled)
//! ```
//!
//! From `ended`, `errored`, or `cancelled`, no further frames are emitted;
//! the terminal frame is sent exactly once, by the driver task.

use crate::context::Context;
use crate::middleware::{Interceptor, Next, Terminal};
use crate::registry::{
    DeliveryGuarantee, EventRetryPolicy, HandlerEntry, HandlerFn, HandlerKind, SharedRegistry,
    StreamSink,
};
use crate::store::{MemoryStore, Store};
use crate::validator::Validator;
use async_trait::async_trait;
use sb_protocol::{Envelope, ErrorCode, FrameKind, RpcError};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Default capacity of the bounded channel between a stream producer and the
/// consuming adapter.
const DEFAULT_STREAM_BUFFER: usize = 32;

// ---------------------------------------------------------------------------
// Reply
// ---------------------------------------------------------------------------

/// The outcome of routing one envelope: exactly one of a single response
/// envelope, a lazy terminated frame sequence, or nothing (events).
pub enum Reply {
    Response(Envelope),
    Stream(mpsc::Receiver<Envelope>),
    None,
}

impl Reply {
    /// The single response envelope, if this reply is one.  Test helper.
    pub fn into_response(self) -> Option<Envelope> {
        match self {
            Reply::Response(env) => Some(env),
            _ => None,
        }
    }

    /// Drain a stream reply into a vector of frames.  Test helper.
    pub async fn collect_frames(self) -> Vec<Envelope> {
        match self {
            Reply::Stream(mut rx) => {
                let mut frames = Vec::new();
                while let Some(frame) = rx.recv().await {
                    frames.push(frame);
                }
                frames
            }
            _ => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct RouterBuilder {
    registry: Arc<SharedRegistry>,
    global: Vec<Arc<dyn Interceptor>>,
    stream_buffer: usize,
    dedup_store: Option<Arc<dyn Store>>,
}

impl RouterBuilder {
    /// Add a global interceptor; global interceptors run outermost, in the
    /// order they were added.
    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.global.push(interceptor);
        self
    }

    /// Capacity of the producer→adapter frame channel (backpressure bound).
    pub fn stream_buffer(mut self, capacity: usize) -> Self {
        self.stream_buffer = capacity.max(1);
        self
    }

    /// Backend for the event deduplication table.  Defaults to an in-memory
    /// store; inject a durable one for dedup that survives the process.
    pub fn event_dedup_store(mut self, store: Arc<dyn Store>) -> Self {
        self.dedup_store = Some(store);
        self
    }

    pub fn build(self) -> Router {
        Router {
            registry: self.registry,
            global: self.global,
            stream_buffer: self.stream_buffer,
            dedup_store: self
                .dedup_store
                .unwrap_or_else(|| Arc::new(MemoryStore::default())),
        }
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub struct Router {
    registry: Arc<SharedRegistry>,
    global: Vec<Arc<dyn Interceptor>>,
    stream_buffer: usize,
    /// Event dedup table, keyed by envelope id with the handler's window as
    /// TTL.  Store-port-backed so callers can share or persist it the same
    /// way they do for cache and rate-limit state.
    dedup_store: Arc<dyn Store>,
}

impl Router {
    pub fn builder(registry: Arc<SharedRegistry>) -> RouterBuilder {
        RouterBuilder {
            registry,
            global: Vec::new(),
            stream_buffer: DEFAULT_STREAM_BUFFER,
            dedup_store: None,
        }
    }

    pub fn new(registry: Arc<SharedRegistry>) -> Router {
        Self::builder(registry).build()
    }

    pub fn registry(&self) -> Arc<SharedRegistry> {
        self.registry.clone()
    }

    /// Route one envelope.  `ctx` is the adapter-created context; the chain
    /// runs against a fresh child so per-request cancellation never leaks
    /// back into the adapter's connection-level token.
    pub async fn handle(&self, envelope: Envelope, ctx: &Context) -> Reply {
        if ctx.cancellation.is_cancelled() {
            return self.reply_error(&envelope, RpcError::cancelled(), ctx);
        }

        let snapshot = self.registry.load();
        let Some(entry) = snapshot.lookup(&envelope.procedure) else {
            return self.reply_error(&envelope, RpcError::not_found(&envelope.procedure), ctx);
        };

        let compatible = matches!(
            (envelope.kind, entry.kind),
            (FrameKind::Request, HandlerKind::Procedure)
                | (FrameKind::StreamStart, HandlerKind::Stream)
                | (FrameKind::Event, HandlerKind::Event)
        );
        if !compatible {
            let err = RpcError::invalid_envelope(format!(
                "envelope kind '{}' is not accepted by {} handler '{}'",
                envelope.kind.as_str(),
                entry.kind.as_str(),
                entry.name,
            ));
            return self.reply_error(&envelope, err, ctx);
        }

        match entry.kind {
            HandlerKind::Procedure => self.handle_procedure(envelope, ctx, &snapshot, entry).await,
            HandlerKind::Stream => self.handle_stream(envelope, ctx, &snapshot, entry).await,
            HandlerKind::Event => self.handle_event(envelope, ctx, &snapshot, entry).await,
        }
    }

    // -----------------------------------------------------------------------
    // Procedure dispatch
    // -----------------------------------------------------------------------

    async fn handle_procedure(
        &self,
        envelope: Envelope,
        ctx: &Context,
        snapshot: &crate::registry::Registry,
        entry: Arc<HandlerEntry>,
    ) -> Reply {
        let HandlerFn::Procedure(handler) = entry.handler.clone() else {
            return self.reply_error(&envelope, RpcError::internal("handler shape mismatch"), ctx);
        };
        let terminal: Terminal = Arc::new(move |env: Envelope, cctx: Context| {
            handler(env.payload, cctx)
        });

        let chain = self.build_chain(snapshot, &entry);
        let child = ctx.child();
        match Next::new(chain.into(), terminal)
            .run(envelope.clone(), child)
            .await
        {
            Ok(value) => {
                let mut reply = Envelope::response_to(&envelope, value);
                reply
                    .metadata
                    .insert("x-request-id".to_owned(), effective_request_id(&envelope, ctx));
                Reply::Response(reply)
            }
            Err(err) => self.reply_error(&envelope, err, ctx),
        }
    }

    // -----------------------------------------------------------------------
    // Stream dispatch
    // -----------------------------------------------------------------------

    async fn handle_stream(
        &self,
        envelope: Envelope,
        ctx: &Context,
        snapshot: &crate::registry::Registry,
        entry: Arc<HandlerEntry>,
    ) -> Reply {
        let HandlerFn::Stream(handler) = entry.handler.clone() else {
            return self.reply_error(&envelope, RpcError::internal("handler shape mismatch"), ctx);
        };

        let (frame_tx, frame_rx) = mpsc::channel::<Envelope>(self.stream_buffer);
        let started = Arc::new(AtomicBool::new(false));
        let origin_id = envelope.id.clone();

        // The terminal starts the stream: it emits `stream:start`, spawns the
        // producer driver, and returns immediately.  Frames flow through the
        // bounded channel; the driver owns the single terminal frame.
        let terminal: Terminal = {
            let started = started.clone();
            Arc::new(move |env: Envelope, cctx: Context| {
                let handler = handler.clone();
                let frame_tx = frame_tx.clone();
                let started = started.clone();
                let origin_id = env.id.clone();
                Box::pin(async move {
                    started.store(true, Ordering::SeqCst);
                    frame_tx
                        .send(Envelope::stream_start(&origin_id))
                        .await
                        .map_err(|_| RpcError::cancelled())?;

                    let sink =
                        StreamSink::new(frame_tx.clone(), origin_id.clone(), cctx.cancellation.clone());
                    let cancel = cctx.cancellation.clone();
                    tokio::spawn(async move {
                        let producer = handler(env.payload, cctx, sink);
                        tokio::pin!(producer);
                        let outcome = tokio::select! {
                            biased;
                            res = &mut producer => res,
                            _ = cancel.cancelled() => Err(RpcError::cancelled()),
                        };
                        let terminal_frame = match outcome {
                            Ok(()) => Envelope::stream_end(&origin_id),
                            Err(err) => {
                                if !err.is_cancellation() {
                                    debug!(id = %origin_id, code = %err.code, "stream errored");
                                }
                                Envelope::stream_error(&origin_id, &err)
                            }
                        };
                        let _ = frame_tx.send(terminal_frame).await;
                    });
                    Ok(Value::Null)
                })
            })
        };

        let chain = self.build_chain(snapshot, &entry);
        let child = ctx.child();
        match Next::new(chain.into(), terminal)
            .run(envelope.clone(), child)
            .await
        {
            Ok(_) => Reply::Stream(frame_rx),
            Err(err) => {
                if started.load(Ordering::SeqCst) {
                    // The stream is already flowing; the driver will emit the
                    // terminal frame.  A post-dispatch middleware failure must
                    // not produce a second reply.
                    warn!(id = %origin_id, code = %err.code, "middleware error after stream start");
                    Reply::Stream(frame_rx)
                } else {
                    self.reply_error(&envelope, err, ctx)
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Event dispatch
    // -----------------------------------------------------------------------

    async fn handle_event(
        &self,
        envelope: Envelope,
        ctx: &Context,
        snapshot: &crate::registry::Registry,
        entry: Arc<HandlerEntry>,
    ) -> Reply {
        let delivery = entry.delivery.unwrap_or_default();
        if delivery != DeliveryGuarantee::BestEffort {
            let window = entry.dedup_window.unwrap_or(Duration::from_secs(60));
            if self.dedup_seen(&envelope.id, window).await {
                debug!(id = %envelope.id, event = %entry.name, "duplicate event suppressed");
                return Reply::None;
            }
        }

        let HandlerFn::Event(handler) = entry.handler.clone() else {
            return Reply::None;
        };
        let terminal: Terminal = Arc::new(move |env: Envelope, cctx: Context| {
            let handler = handler.clone();
            Box::pin(async move { handler(env.payload, cctx).await.map(|()| Value::Null) })
        });

        let chain: Arc<[Arc<dyn Interceptor>]> = self.build_chain(snapshot, &entry).into();
        let retry = match delivery {
            DeliveryGuarantee::AtLeastOnce => entry
                .event_retry
                .clone()
                .unwrap_or_default(),
            _ => EventRetryPolicy {
                max_attempts: 1,
                backoff: Duration::ZERO,
            },
        };
        let child = ctx.child();
        let name = entry.name.clone();

        tokio::spawn(async move {
            let mut attempt = 0u32;
            loop {
                attempt += 1;
                let result = Next::new(chain.clone(), terminal.clone())
                    .run(envelope.clone(), child.clone())
                    .await;
                match result {
                    Ok(_) => return,
                    Err(err) if err.is_cancellation() => {
                        debug!(event = %name, "event cancelled");
                        return;
                    }
                    Err(err) => {
                        warn!(event = %name, attempt, code = %err.code, error = %err, "event handler failed");
                        if attempt >= retry.max_attempts.max(1) {
                            return;
                        }
                        tokio::select! {
                            _ = child.cancellation.cancelled() => return,
                            () = tokio::time::sleep(retry.backoff) => {}
                        }
                    }
                }
            }
        });

        Reply::None
    }

    /// Record `id` in the dedup store under the handler's window; true if it
    /// was already present and unexpired (the event must be suppressed).
    async fn dedup_seen(&self, id: &str, window: Duration) -> bool {
        let key = format!("dedup:{id}");
        if self.dedup_store.get(&key).await.is_some() {
            return true;
        }
        self.dedup_store
            .set(&key, Value::Bool(true), Some(window))
            .await;
        false
    }

    // -----------------------------------------------------------------------
    // Chain assembly and error replies
    // -----------------------------------------------------------------------

    fn build_chain(
        &self,
        snapshot: &crate::registry::Registry,
        entry: &HandlerEntry,
    ) -> Vec<Arc<dyn Interceptor>> {
        let mut chain = Vec::with_capacity(self.global.len() + entry.middleware.len() + 1);
        chain.extend(self.global.iter().cloned());
        chain.extend(entry.middleware.iter().cloned());
        if let Some(validator) = snapshot.validator() {
            if entry.input_schema.is_some() || entry.output_schema.is_some() {
                chain.push(Arc::new(ValidationInterceptor {
                    validator,
                    input: entry.input_schema.clone(),
                    output: entry.output_schema.clone(),
                    validate_output: entry.kind == HandlerKind::Procedure,
                }) as Arc<dyn Interceptor>);
            }
        }
        chain
    }

    /// Pre-dispatch failures (lookup, kind check, validation, middleware)
    /// always produce an error envelope; the event no-reply rule applies to
    /// handler outcomes only.
    fn reply_error(&self, envelope: &Envelope, err: RpcError, ctx: &Context) -> Reply {
        let mut reply = Envelope::error_to(envelope, &err);
        reply
            .metadata
            .insert("x-request-id".to_owned(), effective_request_id(envelope, ctx));
        Reply::Response(reply)
    }
}

/// The id stamped onto reply metadata: what the request-id middleware
/// established (shared via extensions), else the inbound header, else the
/// adapter context's id.
fn effective_request_id(envelope: &Envelope, ctx: &Context) -> String {
    if let Some(tag) = ctx.extensions.get::<crate::context::RequestIdTag>() {
        return tag.0.clone();
    }
    envelope
        .metadata
        .get("x-request-id")
        .cloned()
        .unwrap_or_else(|| ctx.request_id.clone())
}

// ---------------------------------------------------------------------------
// Validation interceptor
// ---------------------------------------------------------------------------

struct ValidationInterceptor {
    validator: Arc<dyn Validator>,
    input: Option<Value>,
    output: Option<Value>,
    validate_output: bool,
}

#[async_trait]
impl Interceptor for ValidationInterceptor {
    async fn handle(
        &self,
        mut envelope: Envelope,
        ctx: Context,
        next: Next,
    ) -> Result<Value, RpcError> {
        if let Some(schema) = &self.input {
            match self.validator.validate(schema, &envelope.payload) {
                Ok(coerced) => envelope.payload = coerced,
                Err(errors) => return Err(RpcError::validation(errors)),
            }
        }
        let result = next.run(envelope, ctx).await?;
        if self.validate_output {
            if let Some(schema) = &self.output {
                return match self.validator.validate(schema, &result) {
                    Ok(coerced) => Ok(coerced),
                    Err(errors) => Err(RpcError::validation(errors)),
                };
            }
        }
        Ok(result)
    }
}
