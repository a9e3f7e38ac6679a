//! Request logging.
//!
//! Emits a `tracing` entry at request end (and optionally at start) with the
//! duration measured on the monotonic clock and reported in milliseconds.
//! Metadata inclusion redacts the closed sensitive-header list.

use async_trait::async_trait;
use sb_core::{Context, Interceptor, Next};
use sb_protocol::{Envelope, RpcError};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{error, info};

/// Headers whose values never reach a log line.
pub const REDACTED_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "set-cookie",
    "x-api-key",
    "x-auth-token",
    "x-access-token",
    "x-refresh-token",
    "x-csrf-token",
    "x-xsrf-token",
    "proxy-authorization",
    "www-authenticate",
];

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub log_start: bool,
    pub include_payload: bool,
    pub include_response: bool,
    pub include_metadata: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            log_start: false,
            include_payload: false,
            include_response: false,
            include_metadata: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct RequestLogging {
    config: LoggingConfig,
}

impl RequestLogging {
    pub fn new(config: LoggingConfig) -> Self {
        RequestLogging { config }
    }
}

fn redact(metadata: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    metadata
        .iter()
        .map(|(k, v)| {
            if REDACTED_HEADERS.contains(&k.to_ascii_lowercase().as_str()) {
                (k.clone(), "[REDACTED]".to_owned())
            } else {
                (k.clone(), v.clone())
            }
        })
        .collect()
}

#[async_trait]
impl Interceptor for RequestLogging {
    async fn handle(
        &self,
        envelope: Envelope,
        ctx: Context,
        next: Next,
    ) -> Result<Value, RpcError> {
        let procedure = envelope.procedure.clone();
        let request_id = ctx.request_id.clone();

        if self.config.log_start {
            if self.config.include_payload {
                info!(procedure = %procedure, request_id = %request_id, payload = %envelope.payload, "request start");
            } else {
                info!(procedure = %procedure, request_id = %request_id, "request start");
            }
            if self.config.include_metadata {
                let redacted = redact(&envelope.metadata);
                info!(procedure = %procedure, request_id = %request_id, metadata = ?redacted, "request metadata");
            }
        }

        let started = Instant::now();
        let result = next.run(envelope, ctx).await;
        let duration_ms = started.elapsed().as_nanos() as f64 / 1_000_000.0;

        match &result {
            Ok(value) => {
                if self.config.include_response {
                    info!(procedure = %procedure, request_id = %request_id, duration_ms, response = %value, "request end");
                } else {
                    info!(procedure = %procedure, request_id = %request_id, duration_ms, "request end");
                }
            }
            Err(err) => {
                error!(procedure = %procedure, request_id = %request_id, duration_ms, code = %err.code, error = %err.message, "request failed");
            }
        }
        result
    }
}
