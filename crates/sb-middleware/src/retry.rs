//! Retry with backoff.
//!
//! Re-invokes the downstream chain on errors whose code is in the
//! configured retryable set, up to `max_attempts` total attempts.  A
//! `retryAfter` hint on the error overrides the computed backoff.  Never
//! retries after cancellation.

use async_trait::async_trait;
use rand::Rng;
use sb_core::{Context, Interceptor, Next};
use sb_protocol::{Envelope, ErrorCode, RpcError};
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub enum Backoff {
    /// `base * attempt`
    Linear { base: Duration },
    /// `base * factor^(attempt-1)`
    Exponential { base: Duration, factor: f64 },
    /// `random(base, prev * 3)`, capped.
    DecorrelatedJitter { base: Duration, cap: Duration },
}

impl Backoff {
    /// Delay before the next attempt.  `attempt` is 1-based (the attempt
    /// that just failed); `prev` is the previous delay, for decorrelated
    /// jitter.
    fn delay(&self, attempt: u32, prev: Duration) -> Duration {
        match self {
            Backoff::Linear { base } => base.saturating_mul(attempt),
            Backoff::Exponential { base, factor } => {
                let scaled = base.as_millis() as f64 * factor.powi(attempt.saturating_sub(1) as i32);
                Duration::from_millis(scaled as u64)
            }
            Backoff::DecorrelatedJitter { base, cap } => {
                let low = base.as_millis() as u64;
                let high = (prev.as_millis() as u64).saturating_mul(3).max(low + 1);
                let next = rand::thread_rng().gen_range(low..high);
                Duration::from_millis(next).min(*cap)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Apply ±25% jitter to every computed delay.
    pub jitter: bool,
    pub retryable: HashSet<ErrorCode>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            backoff: Backoff::Exponential {
                base: Duration::from_millis(100),
                factor: 2.0,
            },
            jitter: false,
            retryable: [
                ErrorCode::Unavailable,
                ErrorCode::DeadlineExceeded,
                ErrorCode::ResourceExhausted,
                ErrorCode::Aborted,
            ]
            .into_iter()
            .collect(),
        }
    }
}

pub struct Retry {
    policy: RetryPolicy,
}

impl Retry {
    pub fn new(policy: RetryPolicy) -> Self {
        Retry { policy }
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        if !self.policy.jitter || delay.is_zero() {
            return delay;
        }
        let ms = delay.as_millis() as f64;
        let factor = rand::thread_rng().gen_range(0.75..=1.25);
        Duration::from_millis((ms * factor) as u64)
    }
}

impl Default for Retry {
    fn default() -> Self {
        Retry::new(RetryPolicy::default())
    }
}

#[async_trait]
impl Interceptor for Retry {
    async fn handle(
        &self,
        envelope: Envelope,
        ctx: Context,
        next: Next,
    ) -> Result<Value, RpcError> {
        let max = self.policy.max_attempts.max(1);
        let mut prev_delay = Duration::ZERO;

        for attempt in 1..=max {
            let result = next
                .clone()
                .run(envelope.clone(), ctx.clone())
                .await;
            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if err.is_cancellation() || ctx.cancellation.is_cancelled() {
                return Err(err);
            }
            if attempt >= max || !self.policy.retryable.contains(&err.code) {
                return Err(err);
            }

            let delay = match err.retry_after_ms() {
                Some(ms) => Duration::from_millis(ms),
                None => self.apply_jitter(self.policy.backoff.delay(attempt, prev_delay)),
            };
            prev_delay = delay;
            debug!(
                procedure = %envelope.procedure,
                attempt,
                delay_ms = delay.as_millis() as u64,
                code = %err.code,
                "retrying after failure"
            );
            tokio::select! {
                _ = ctx.cancellation.cancelled() => return Err(RpcError::cancelled()),
                () = tokio::time::sleep(delay) => {}
            }
        }
        unreachable!("retry loop returns from its final attempt")
    }
}
