//! HTTP adapter.
//!
//! One procedure call = one request.  Routing:
//! - explicit `http(method, path)` bindings become real routes (path
//!   parameters use `{name}` templates and merge into the payload)
//! - everything else is served by catch-all routes: `POST /<dotted.name>`
//!   for procedures, `GET /<dotted.name>` for streams (Server-Sent Events),
//!   `POST /events/<name>` for events (202 on enqueue)
//!
//! Payload assembly: JSON body for POST/PUT/PATCH, query parameters for
//! GET/DELETE, path parameters merged on top.  Responses carry
//! `X-Request-Id`; 429s add `X-RateLimit-{Limit,Remaining,Reset}` and
//! `Retry-After`.  Status codes derive from the error taxonomy.
//!
//! The catch-all routes resolve handlers per request, so a hot-swapped
//! registry is picked up without rebuilding the axum router.

use crate::shutdown::Shutdown;
use axum::Router as AxumRouter;
use axum::extract::{Path, Query};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{MethodFilter, on, post};
use bytes::Bytes;
use sb_core::{Context, HandlerKind, Reply, Router};
use sb_protocol::{Envelope, ErrorCode, FrameKind, RpcError};
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct CorsConfig {
    /// Empty list = allow any origin.
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct HttpConfig {
    pub cors: Option<CorsConfig>,
}

/// Build the axum router serving a dispatch [`Router`].  The caller mounts
/// this (optionally nested under a base path) on its listener; the WebSocket
/// and JSON-RPC routes are merged in by the server orchestrator.
pub fn build_router(
    dispatch: Arc<Router>,
    shutdown: Arc<Shutdown>,
    config: &HttpConfig,
) -> AxumRouter {
    let mut app = AxumRouter::new();

    // Explicit bindings from the current snapshot.
    for entry in dispatch.registry().load().list() {
        let Some(binding) = entry.http.clone() else {
            continue;
        };
        let Some(filter) = method_filter(&binding.method) else {
            debug!(method = %binding.method, "skipping binding with unsupported method");
            continue;
        };
        let name = entry.name.clone();
        let method = binding.method.clone();
        let dispatch = dispatch.clone();
        let shutdown = shutdown.clone();
        let handler = move |Path(params): Path<HashMap<String, String>>,
                            Query(query): Query<HashMap<String, String>>,
                            headers: HeaderMap,
                            body: Bytes| {
            let dispatch = dispatch.clone();
            let shutdown = shutdown.clone();
            let name = name.clone();
            let method = method.clone();
            async move {
                call_procedure(
                    dispatch, shutdown, name, &method, params, query, headers, body,
                )
                .await
            }
        };
        app = app.route(&binding.path, on(filter, handler));
    }

    // Catch-all: default procedure / stream / event routes.
    {
        let proc_dispatch = dispatch.clone();
        let proc_shutdown = shutdown.clone();
        let handler = move |Path(name): Path<String>,
                            Query(query): Query<HashMap<String, String>>,
                            headers: HeaderMap,
                            body: Bytes| {
            let dispatch = proc_dispatch.clone();
            let shutdown = proc_shutdown.clone();
            async move {
                call_procedure(
                    dispatch,
                    shutdown,
                    name,
                    "POST",
                    HashMap::new(),
                    query,
                    headers,
                    body,
                )
                .await
            }
        };
        let dispatch_sse = dispatch.clone();
        let shutdown_sse = shutdown.clone();
        let sse_handler = move |Path(name): Path<String>,
                                Query(query): Query<HashMap<String, String>>,
                                headers: HeaderMap| {
            let dispatch = dispatch_sse.clone();
            let shutdown = shutdown_sse.clone();
            async move { call_stream(dispatch, shutdown, name, query, headers).await }
        };
        app = app.route("/{*name}", post(handler).get(sse_handler));
    }
    {
        let event_dispatch = dispatch.clone();
        let event_shutdown = shutdown.clone();
        let handler = move |Path(name): Path<String>, headers: HeaderMap, body: Bytes| {
            let dispatch = event_dispatch.clone();
            let shutdown = event_shutdown.clone();
            async move { call_event(dispatch, shutdown, name, headers, body).await }
        };
        app = app.route("/events/{name}", post(handler));
    }

    if let Some(cors) = &config.cors {
        app = app.layer(cors_layer(cors));
    }
    app
}

fn cors_layer(config: &CorsConfig) -> CorsLayer {
    if config.allowed_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = config
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

fn method_filter(method: &str) -> Option<MethodFilter> {
    match method {
        "GET" => Some(MethodFilter::GET),
        "POST" => Some(MethodFilter::POST),
        "PUT" => Some(MethodFilter::PUT),
        "PATCH" => Some(MethodFilter::PATCH),
        "DELETE" => Some(MethodFilter::DELETE),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Request → envelope assembly
// ---------------------------------------------------------------------------

fn metadata_from_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_owned()))
        })
        .collect()
}

/// Body for POST/PUT/PATCH, query for GET/DELETE, path params merged on top.
fn assemble_payload(
    method: &str,
    path_params: HashMap<String, String>,
    query: HashMap<String, String>,
    body: &Bytes,
) -> Result<Value, RpcError> {
    let mut base = match method {
        "GET" | "DELETE" => {
            let map: Map<String, Value> = query
                .into_iter()
                .map(|(k, v)| (k, Value::String(v)))
                .collect();
            Value::Object(map)
        }
        _ if body.is_empty() => Value::Object(Map::new()),
        _ => serde_json::from_slice(body)
            .map_err(|e| RpcError::new(ErrorCode::ParseError, format!("request body: {e}")))?,
    };

    if !path_params.is_empty() {
        if !base.is_object() {
            base = Value::Object(Map::new());
        }
        if let Some(obj) = base.as_object_mut() {
            for (k, v) in path_params {
                obj.insert(k, Value::String(v));
            }
        }
    }
    Ok(base)
}

fn request_context(shutdown: &Shutdown) -> Context {
    Context::new().with_cancellation(shutdown.root_token().child())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
async fn call_procedure(
    dispatch: Arc<Router>,
    shutdown: Arc<Shutdown>,
    name: String,
    method: &str,
    path_params: HashMap<String, String>,
    query: HashMap<String, String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let _guard = shutdown.tracker().guard();
    let payload = match assemble_payload(method, path_params, query, &body) {
        Ok(payload) => payload,
        Err(err) => return error_response(&err, None),
    };
    let mut envelope = Envelope::request(&name, payload);
    envelope.metadata = metadata_from_headers(&headers);

    let ctx = request_context(&shutdown);
    match dispatch.handle(envelope, &ctx).await {
        Reply::Response(reply) => envelope_response(reply),
        // A procedure route never yields a stream; treat as internal.
        Reply::Stream(_) => error_response(
            &RpcError::internal("unexpected stream reply on procedure route"),
            None,
        ),
        Reply::None => StatusCode::ACCEPTED.into_response(),
    }
}

async fn call_event(
    dispatch: Arc<Router>,
    shutdown: Arc<Shutdown>,
    name: String,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let _guard = shutdown.tracker().guard();
    let payload = if body.is_empty() {
        Value::Object(Map::new())
    } else {
        match serde_json::from_slice(&body) {
            Ok(payload) => payload,
            Err(e) => {
                return error_response(
                    &RpcError::new(ErrorCode::ParseError, format!("request body: {e}")),
                    None,
                );
            }
        }
    };
    let mut envelope = Envelope::event(&name, payload);
    envelope.metadata = metadata_from_headers(&headers);

    let ctx = request_context(&shutdown);
    match dispatch.handle(envelope, &ctx).await {
        Reply::None => (StatusCode::ACCEPTED, axum::Json(json!({"accepted": true}))).into_response(),
        Reply::Response(reply) => envelope_response(reply),
        Reply::Stream(_) => error_response(
            &RpcError::internal("unexpected stream reply on event route"),
            None,
        ),
    }
}

async fn call_stream(
    dispatch: Arc<Router>,
    shutdown: Arc<Shutdown>,
    name: String,
    query: HashMap<String, String>,
    headers: HeaderMap,
) -> Response {
    let _guard = shutdown.tracker().guard();
    let payload = match assemble_payload("GET", HashMap::new(), query, &Bytes::new()) {
        Ok(payload) => payload,
        Err(err) => return error_response(&err, None),
    };

    // Reject non-stream names here so plain procedures are not exposed on GET.
    match dispatch.registry().load().lookup(&name) {
        Some(entry) if entry.kind == HandlerKind::Stream => {}
        Some(_) => {
            return error_response(
                &RpcError::new(
                    ErrorCode::InvalidEnvelope,
                    format!("'{name}' is not a stream"),
                ),
                None,
            );
        }
        None => return error_response(&RpcError::not_found(&name), None),
    }

    let mut envelope = Envelope::stream_request(&name, payload);
    envelope.metadata = metadata_from_headers(&headers);

    let ctx = request_context(&shutdown);
    match dispatch.handle(envelope, &ctx).await {
        Reply::Stream(mut rx) => {
            let stream = async_stream::stream! {
                while let Some(frame) = rx.recv().await {
                    match frame.kind {
                        FrameKind::StreamStart => {}
                        FrameKind::StreamData => {
                            yield Ok::<Event, std::convert::Infallible>(
                                Event::default().data(frame.payload.to_string()),
                            );
                        }
                        FrameKind::StreamError => {
                            yield Ok(Event::default()
                                .event("error")
                                .data(frame.payload.to_string()));
                            break;
                        }
                        _ => break,
                    }
                }
            };
            Sse::new(stream)
                .keep_alive(
                    KeepAlive::new()
                        .interval(Duration::from_secs(15))
                        .text("keepalive"),
                )
                .into_response()
        }
        Reply::Response(reply) => envelope_response(reply),
        Reply::None => StatusCode::ACCEPTED.into_response(),
    }
}

// ---------------------------------------------------------------------------
// Envelope → HTTP response
// ---------------------------------------------------------------------------

fn envelope_response(reply: Envelope) -> Response {
    let request_id = reply.metadata.get("x-request-id").cloned();
    if reply.kind == FrameKind::Error {
        let err = reply
            .as_error()
            .unwrap_or_else(|| RpcError::internal("malformed error envelope"));
        return error_response(&err, request_id);
    }
    let mut response = (StatusCode::OK, axum::Json(reply.payload)).into_response();
    if let Some(id) = request_id {
        if let Ok(value) = HeaderValue::from_str(&id) {
            response.headers_mut().insert("x-request-id", value);
        }
    }
    response
}

fn error_response(err: &RpcError, request_id: Option<String>) -> Response {
    let status = StatusCode::from_u16(err.code.http_status())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, axum::Json(serde_json::to_value(err).unwrap_or(Value::Null)))
        .into_response();
    let headers = response.headers_mut();
    if let Some(id) = request_id {
        if let Ok(value) = HeaderValue::from_str(&id) {
            headers.insert("x-request-id", value);
        }
    }
    if err.code == ErrorCode::ResourceExhausted {
        if let Some(details) = &err.details {
            insert_numeric_header(headers, "x-ratelimit-limit", details.get("limit"));
            insert_numeric_header(headers, "x-ratelimit-remaining", details.get("remaining"));
            insert_numeric_header(headers, "x-ratelimit-reset", details.get("resetAt"));
            if let Some(ms) = details.get("retryAfter").and_then(Value::as_u64) {
                let secs = ms.div_ceil(1000).max(1);
                if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                    headers.insert("retry-after", value);
                }
            }
        }
    }
    response
}

fn insert_numeric_header(headers: &mut HeaderMap, name: &'static str, value: Option<&Value>) {
    if let Some(n) = value.and_then(Value::as_i64) {
        if let Ok(value) = HeaderValue::from_str(&n.to_string()) {
            headers.insert(name, value);
        }
    }
}
