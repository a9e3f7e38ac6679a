//! Keyed rate limiting.
//!
//! Token-bucket or fixed-window accounting per extracted key (ip, principal,
//! api-key, metadata header, or custom).  The key map is bounded by
//! `max_unique_keys`; when full, the least-recently-seen key is evicted.
//! Pattern-scoped rules override the global rule for matching procedures.
//!
//! Exceeding a limit raises `RESOURCE_EXHAUSTED` with
//! `{limit, remaining, resetAt, retryAfter}` details; the HTTP adapter turns
//! those into `X-RateLimit-*` and `Retry-After` headers.

use async_trait::async_trait;
use sb_core::{Context, Interceptor, Next, Pattern};
use sb_protocol::{Envelope, ErrorCode, RpcError};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RateLimitAlgorithm {
    #[default]
    TokenBucket,
    FixedWindow,
}

#[derive(Debug, Clone)]
pub struct RateLimitRule {
    pub max_requests: u32,
    pub window: Duration,
    pub algorithm: RateLimitAlgorithm,
}

impl RateLimitRule {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        RateLimitRule {
            max_requests,
            window,
            algorithm: RateLimitAlgorithm::default(),
        }
    }

    pub fn fixed_window(mut self) -> Self {
        self.algorithm = RateLimitAlgorithm::FixedWindow;
        self
    }
}

/// How the accounting key is derived from the request.
#[derive(Clone)]
pub enum KeySelector {
    /// `x-forwarded-for` metadata, falling back to `remote-addr`.
    Ip,
    /// The authenticated principal; unauthenticated requests share one key.
    Principal,
    /// `x-api-key` metadata.
    ApiKey,
    /// An arbitrary metadata header.
    Metadata(String),
    Custom(Arc<dyn Fn(&Envelope, &Context) -> Option<String> + Send + Sync>),
}

impl KeySelector {
    fn extract(&self, envelope: &Envelope, ctx: &Context) -> String {
        let key = match self {
            KeySelector::Ip => envelope
                .metadata
                .get("x-forwarded-for")
                .or_else(|| envelope.metadata.get("remote-addr"))
                .cloned(),
            KeySelector::Principal => ctx.auth.as_ref().map(|a| a.principal.clone()),
            KeySelector::ApiKey => envelope.metadata.get("x-api-key").cloned(),
            KeySelector::Metadata(header) => envelope.metadata.get(header).cloned(),
            KeySelector::Custom(f) => f(envelope, ctx),
        };
        key.unwrap_or_else(|| "anonymous".to_owned())
    }
}

#[derive(Debug)]
struct KeyState {
    /// Token-bucket fill level.
    tokens: f64,
    last_refill: Instant,
    /// Fixed-window bookkeeping.
    window_start: Instant,
    count: u32,
    last_seen: Instant,
}

pub struct RateLimit {
    global: RateLimitRule,
    overrides: Vec<(Pattern, RateLimitRule)>,
    selector: KeySelector,
    max_unique_keys: usize,
    states: Mutex<HashMap<String, KeyState>>,
}

impl RateLimit {
    pub fn new(rule: RateLimitRule, selector: KeySelector) -> Self {
        RateLimit {
            global: rule,
            overrides: Vec::new(),
            selector,
            max_unique_keys: 10_000,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Scope a different rule to procedures matching `pattern`.
    pub fn override_for(mut self, pattern: &str, rule: RateLimitRule) -> Self {
        self.overrides.push((Pattern::parse(pattern), rule));
        self
    }

    /// Bound the number of tracked keys (memory cap).
    pub fn max_unique_keys(mut self, max: usize) -> Self {
        self.max_unique_keys = max.max(1);
        self
    }

    fn rule_for(&self, procedure: &str) -> &RateLimitRule {
        self.overrides
            .iter()
            .find(|(pattern, _)| pattern.matches(procedure))
            .map_or(&self.global, |(_, rule)| rule)
    }

    /// Try to take one unit for `key` under `rule`.  Returns the remaining
    /// allowance, or the time until the next unit becomes available.
    fn acquire(&self, key: &str, rule: &RateLimitRule) -> Result<u32, Duration> {
        let now = Instant::now();
        let mut states = self.states.lock().expect("rate limit lock poisoned");

        if !states.contains_key(key) && states.len() >= self.max_unique_keys {
            if let Some(oldest) = states
                .iter()
                .min_by_key(|(_, s)| s.last_seen)
                .map(|(k, _)| k.clone())
            {
                states.remove(&oldest);
            }
        }

        let state = states.entry(key.to_owned()).or_insert_with(|| KeyState {
            tokens: rule.max_requests as f64,
            last_refill: now,
            window_start: now,
            count: 0,
            last_seen: now,
        });
        state.last_seen = now;

        match rule.algorithm {
            RateLimitAlgorithm::TokenBucket => {
                let rate = rule.max_requests as f64 / rule.window.as_secs_f64();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * rate).min(rule.max_requests as f64);
                state.last_refill = now;
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    Ok(state.tokens as u32)
                } else {
                    let needed = 1.0 - state.tokens;
                    Err(Duration::from_secs_f64(needed / rate))
                }
            }
            RateLimitAlgorithm::FixedWindow => {
                if now.duration_since(state.window_start) >= rule.window {
                    state.window_start = now;
                    state.count = 0;
                }
                if state.count < rule.max_requests {
                    state.count += 1;
                    Ok(rule.max_requests - state.count)
                } else {
                    Err(rule.window - now.duration_since(state.window_start))
                }
            }
        }
    }
}

#[async_trait]
impl Interceptor for RateLimit {
    async fn handle(
        &self,
        envelope: Envelope,
        ctx: Context,
        next: Next,
    ) -> Result<Value, RpcError> {
        let key = self.selector.extract(&envelope, &ctx);
        let rule = self.rule_for(&envelope.procedure);

        match self.acquire(&key, rule) {
            Ok(_remaining) => next.run(envelope, ctx).await,
            Err(retry_after) => {
                debug!(procedure = %envelope.procedure, key = %key, "rate limited");
                let retry_after_ms = retry_after.as_millis() as u64;
                let reset_at = chrono::Utc::now().timestamp_millis() + retry_after_ms as i64;
                Err(RpcError::new(
                    ErrorCode::ResourceExhausted,
                    format!("rate limit exceeded for '{}'", envelope.procedure),
                )
                .with_details(json!({
                    "limit": rule.max_requests,
                    "remaining": 0,
                    "resetAt": reset_at,
                    "retryAfter": retry_after_ms,
                })))
            }
        }
    }
}
