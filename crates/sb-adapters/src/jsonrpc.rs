//! JSON-RPC 2.0 adapter.
//!
//! Strict 2.0 over a single HTTP POST path (default `/rpc`).  The body is
//! either one request object or a batch array; batch responses preserve
//! element order and omit notifications.  Requests run concurrently.
//!
//! Taxonomy errors map onto the JSON-RPC code space: `-32700` parse,
//! `-32600` invalid request, `-32601` method not found, `-32602` invalid
//! params, `-32603` internal, plus app-range codes for the rest.

use crate::shutdown::Shutdown;
use axum::Router as AxumRouter;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use bytes::Bytes;
use futures_util::future::join_all;
use sb_core::{Context, Reply, Router};
use sb_protocol::{
    Envelope, ErrorCode, JsonRpcPayload, JsonRpcRequest, JsonRpcResponse, RpcError,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

pub const DEFAULT_RPC_PATH: &str = "/rpc";

#[derive(Debug, Clone)]
pub struct JsonRpcConfig {
    pub path: String,
}

impl Default for JsonRpcConfig {
    fn default() -> Self {
        JsonRpcConfig {
            path: DEFAULT_RPC_PATH.to_owned(),
        }
    }
}

pub fn build_router(
    dispatch: Arc<Router>,
    shutdown: Arc<Shutdown>,
    config: &JsonRpcConfig,
) -> AxumRouter {
    let handler = move |body: Bytes| {
        let dispatch = dispatch.clone();
        let shutdown = shutdown.clone();
        async move { handle_body(dispatch, shutdown, &body).await }
    };
    AxumRouter::new().route(&config.path, post(handler))
}

async fn handle_body(dispatch: Arc<Router>, shutdown: Arc<Shutdown>, body: &Bytes) -> Response {
    let _guard = shutdown.tracker().guard();

    let payload: JsonRpcPayload = match serde_json::from_slice(body) {
        Ok(payload) => payload,
        Err(e) => {
            debug!(error = %e, "json-rpc parse failure");
            let err = RpcError::new(ErrorCode::ParseError, format!("malformed JSON-RPC: {e}"));
            return json_response(serde_json::to_value(JsonRpcResponse::failure(
                Value::Null,
                &err,
            )));
        }
    };

    match payload {
        JsonRpcPayload::Single(request) => {
            match handle_request(&dispatch, &shutdown, request).await {
                Some(response) => json_response(serde_json::to_value(response)),
                None => StatusCode::NO_CONTENT.into_response(),
            }
        }
        JsonRpcPayload::Batch(requests) => {
            if requests.is_empty() {
                let err = RpcError::new(ErrorCode::InvalidEnvelope, "empty batch");
                return json_response(serde_json::to_value(JsonRpcResponse::failure(
                    Value::Null,
                    &err,
                )));
            }
            let futures = requests
                .into_iter()
                .map(|request| handle_request(&dispatch, &shutdown, request));
            let responses: Vec<JsonRpcResponse> =
                join_all(futures).await.into_iter().flatten().collect();
            if responses.is_empty() {
                // Batch of notifications only.
                return StatusCode::NO_CONTENT.into_response();
            }
            json_response(serde_json::to_value(responses))
        }
    }
}

/// Run one request; `None` for notifications (no response entry).
async fn handle_request(
    dispatch: &Arc<Router>,
    shutdown: &Arc<Shutdown>,
    request: JsonRpcRequest,
) -> Option<JsonRpcResponse> {
    let is_notification = request.is_notification();
    let response_id = request.id.clone().unwrap_or(Value::Null);

    if !request.is_valid_version() {
        if is_notification {
            return None;
        }
        let err = RpcError::new(
            ErrorCode::InvalidEnvelope,
            format!("unsupported jsonrpc version '{}'", request.jsonrpc),
        );
        return Some(JsonRpcResponse::failure(response_id, &err));
    }

    let envelope_id = match &request.id {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => uuid::Uuid::new_v4().to_string(),
    };
    // Dispatch with the envelope kind the registered handler expects, so
    // event methods keep fire-and-forget semantics over JSON-RPC.
    let is_event = dispatch
        .registry()
        .load()
        .lookup(&request.method)
        .is_some_and(|entry| entry.kind == sb_core::HandlerKind::Event);
    let mut envelope = Envelope::request_with_id(envelope_id, &request.method, request.params);
    if is_event {
        envelope.kind = sb_protocol::FrameKind::Event;
    }
    let ctx = Context::new().with_cancellation(shutdown.root_token().child());

    if is_notification {
        // Fire and forget; the reply (if any) is discarded.
        let dispatch = dispatch.clone();
        tokio::spawn(async move {
            let _ = dispatch.handle(envelope, &ctx).await;
        });
        return None;
    }

    match dispatch.handle(envelope, &ctx).await {
        Reply::Response(reply) => match reply.as_error() {
            Some(err) => Some(JsonRpcResponse::failure(response_id, &err)),
            None => Some(JsonRpcResponse::success(response_id, reply.payload)),
        },
        Reply::Stream(_) => {
            let err = RpcError::new(
                ErrorCode::InvalidEnvelope,
                "streams are not servable over JSON-RPC",
            );
            Some(JsonRpcResponse::failure(response_id, &err))
        }
        Reply::None => Some(JsonRpcResponse::success(response_id, Value::Null)),
    }
}

fn json_response(value: Result<Value, serde_json::Error>) -> Response {
    match value {
        Ok(value) => (StatusCode::OK, axum::Json(value)).into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}
