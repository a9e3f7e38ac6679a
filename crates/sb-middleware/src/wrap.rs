//! Canonical response envelope wrapping.
//!
//! Transforms the terminal result into
//! `{success, data|error, meta: {timestamp?, requestId?, durationMs?}}`.
//! Taxonomy errors become `success: false` payloads; cancellation is never
//! swallowed and keeps propagating as an error.

use async_trait::async_trait;
use sb_core::{Context, Interceptor, Next};
use sb_protocol::{Envelope, RpcError};
use serde_json::{Value, json};
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct EnvelopeWrap {
    pub include_timestamp: bool,
    pub include_request_id: bool,
    pub include_duration: bool,
}

impl Default for EnvelopeWrap {
    fn default() -> Self {
        EnvelopeWrap {
            include_timestamp: true,
            include_request_id: true,
            include_duration: true,
        }
    }
}

impl EnvelopeWrap {
    fn meta(&self, ctx: &Context, started: Instant) -> Value {
        let mut meta = serde_json::Map::new();
        if self.include_timestamp {
            meta.insert(
                "timestamp".to_owned(),
                json!(chrono::Utc::now().to_rfc3339()),
            );
        }
        if self.include_request_id {
            meta.insert("requestId".to_owned(), json!(ctx.request_id));
        }
        if self.include_duration {
            let ms = started.elapsed().as_nanos() as f64 / 1_000_000.0;
            meta.insert("durationMs".to_owned(), json!(ms));
        }
        Value::Object(meta)
    }
}

#[async_trait]
impl Interceptor for EnvelopeWrap {
    async fn handle(
        &self,
        envelope: Envelope,
        ctx: Context,
        next: Next,
    ) -> Result<Value, RpcError> {
        let started = Instant::now();
        let meta_ctx = ctx.clone();
        match next.run(envelope, ctx).await {
            Ok(data) => Ok(json!({
                "success": true,
                "data": data,
                "meta": self.meta(&meta_ctx, started),
            })),
            Err(err) if err.is_cancellation() => Err(err),
            Err(err) => Ok(json!({
                "success": false,
                "error": err,
                "meta": self.meta(&meta_ctx, started),
            })),
        }
    }
}
