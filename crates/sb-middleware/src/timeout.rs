//! Deadline enforcement.
//!
//! Derives a child context whose cancellation trips when the deadline
//! expires, then raises `DEADLINE_EXCEEDED`.  Per-procedure overrides match
//! by exact name or glob pattern; the first matching override wins.

use async_trait::async_trait;
use sb_core::{Context, Interceptor, Next, Pattern};
use sb_protocol::{Envelope, RpcError};
use serde_json::Value;
use std::time::Duration;

pub struct Timeout {
    default: Duration,
    overrides: Vec<(Pattern, Duration)>,
}

impl Timeout {
    pub fn new(default: Duration) -> Self {
        Timeout {
            default,
            overrides: Vec::new(),
        }
    }

    /// Add an override for procedures matching `pattern` (exact or glob).
    pub fn override_for(mut self, pattern: &str, deadline: Duration) -> Self {
        self.overrides.push((Pattern::parse(pattern), deadline));
        self
    }

    fn deadline_for(&self, procedure: &str) -> Duration {
        self.overrides
            .iter()
            .find(|(pattern, _)| pattern.matches(procedure))
            .map_or(self.default, |(_, d)| *d)
    }
}

#[async_trait]
impl Interceptor for Timeout {
    async fn handle(
        &self,
        envelope: Envelope,
        ctx: Context,
        next: Next,
    ) -> Result<Value, RpcError> {
        let deadline = self.deadline_for(&envelope.procedure);
        let child = ctx.child();
        let cancel = child.cancellation.clone();

        tokio::select! {
            result = next.run(envelope, child) => result,
            () = tokio::time::sleep(deadline) => {
                cancel.cancel();
                Err(RpcError::deadline_exceeded(deadline.as_millis() as u64))
            }
        }
    }
}
