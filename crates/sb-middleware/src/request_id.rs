//! Request-id propagation.
//!
//! If the inbound envelope carries `x-request-id` metadata, that id becomes
//! the context's request id; otherwise a fresh one is minted and stamped
//! onto the envelope so downstream middleware and logs see it.  The router
//! copies the context's request id onto reply metadata.

use async_trait::async_trait;
use sb_core::{Context, Interceptor, Next, RequestIdTag};
use sb_protocol::{Envelope, RpcError};
use serde_json::Value;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Default)]
pub struct RequestId;

#[async_trait]
impl Interceptor for RequestId {
    async fn handle(
        &self,
        mut envelope: Envelope,
        mut ctx: Context,
        next: Next,
    ) -> Result<Value, RpcError> {
        let id = match envelope.metadata.get(REQUEST_ID_HEADER).cloned() {
            Some(id) if !id.is_empty() => id,
            _ => {
                let minted = Uuid::new_v4().to_string();
                envelope
                    .metadata
                    .insert(REQUEST_ID_HEADER.to_owned(), minted.clone());
                minted
            }
        };
        ctx.request_id = id.clone();
        // Shared with the router through extensions so the reply metadata
        // carries the same id.
        ctx.extensions.insert(RequestIdTag(id));
        next.run(envelope, ctx).await
    }
}
