//! Response caching over the [`Store`] port.
//!
//! Keys on procedure name + a canonical fingerprint of the payload.  A hit
//! within the TTL short-circuits the chain.  With stale-while-revalidate
//! enabled, an expired entry is served immediately while a background
//! refresh re-runs the downstream chain and repopulates the store.
//!
//! Cancellation is never masked: a `CANCELLED` downstream error propagates
//! untouched and is never written to the cache.

use async_trait::async_trait;
use sb_core::{CancelToken, Context, Interceptor, Next, Store};
use sb_protocol::{Envelope, RpcError};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub stale_while_revalidate: bool,
    /// How long a stale entry stays servable beyond its TTL (SWR mode only).
    pub stale_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            ttl: Duration::from_secs(30),
            stale_while_revalidate: false,
            stale_ttl: Duration::from_secs(300),
        }
    }
}

pub struct Cache {
    store: Arc<dyn Store>,
    config: CacheConfig,
}

impl Cache {
    pub fn new(store: Arc<dyn Store>, config: CacheConfig) -> Self {
        Cache { store, config }
    }

    fn key(envelope: &Envelope) -> String {
        format!(
            "cache:{}:{}",
            envelope.procedure,
            canonical_fingerprint(&envelope.payload)
        )
    }

    fn store_ttl(&self) -> Duration {
        if self.config.stale_while_revalidate {
            self.config.ttl + self.config.stale_ttl
        } else {
            self.config.ttl
        }
    }

    async fn write_entry(&self, key: &str, value: &Value) {
        let entry = json!({
            "value": value,
            "freshUntil": chrono::Utc::now().timestamp_millis() + self.config.ttl.as_millis() as i64,
        });
        self.store.set(key, entry, Some(self.store_ttl())).await;
    }
}

/// Serialize with object keys sorted recursively so logically-equal payloads
/// fingerprint identically regardless of field order.
fn canonical_fingerprint(value: &Value) -> String {
    fn sort(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut sorted: Vec<(&String, &Value)> = map.iter().collect();
                sorted.sort_by_key(|(k, _)| k.as_str());
                let mut out = Map::new();
                for (k, v) in sorted {
                    out.insert(k.clone(), sort(v));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(sort).collect()),
            other => other.clone(),
        }
    }
    sort(value).to_string()
}

#[async_trait]
impl Interceptor for Cache {
    async fn handle(
        &self,
        envelope: Envelope,
        ctx: Context,
        next: Next,
    ) -> Result<Value, RpcError> {
        let key = Self::key(&envelope);

        if let Some(entry) = self.store.get(&key).await {
            let fresh_until = entry["freshUntil"].as_i64().unwrap_or(0);
            let value = entry["value"].clone();
            let now = chrono::Utc::now().timestamp_millis();
            if now < fresh_until {
                debug!(procedure = %envelope.procedure, "cache hit");
                return Ok(value);
            }
            if self.config.stale_while_revalidate {
                debug!(procedure = %envelope.procedure, "serving stale, revalidating");
                // Refresh on a detached context: the original request must not
                // drag the background revalidation down with its cancellation.
                let mut refresh_ctx = ctx.clone();
                refresh_ctx.cancellation = CancelToken::new();
                let cache_store = self.store.clone();
                let ttl = self.config.ttl;
                let store_ttl = self.store_ttl();
                let refresh_key = key.clone();
                let refresh_next = next.clone();
                tokio::spawn(async move {
                    match refresh_next.run(envelope, refresh_ctx).await {
                        Ok(fresh) => {
                            let entry = json!({
                                "value": fresh,
                                "freshUntil": chrono::Utc::now().timestamp_millis()
                                    + ttl.as_millis() as i64,
                            });
                            cache_store.set(&refresh_key, entry, Some(store_ttl)).await;
                        }
                        Err(err) => {
                            warn!(code = %err.code, "background revalidation failed");
                        }
                    }
                });
                return Ok(value);
            }
        }

        let result = next.run(envelope, ctx).await?;
        self.write_entry(&key, &result).await;
        Ok(result)
    }
}
