//! Per-procedure circuit breaker.
//!
//! State machine per procedure name:
//!
//! ```text
//! closed ──(failure_threshold failures within window)──► open
//! open ──(reset_timeout elapsed, next call probes)──► half-open
//! half-open ──(success_threshold consecutive successes)──► closed
//! half-open ──(any counted failure)──► open
//! ```
//!
//! Open circuits fail fast with `UNAVAILABLE` carrying a projected
//! `resetAfterMs`.  Only configured failure codes count toward tripping.

use async_trait::async_trait;
use sb_core::{Context, Interceptor, Next};
use sb_protocol::{Envelope, ErrorCode, RpcError};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub window: Duration,
    pub reset_timeout: Duration,
    pub success_threshold: u32,
    pub failure_codes: HashSet<ErrorCode>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            failure_threshold: 5,
            window: Duration::from_secs(10),
            reset_timeout: Duration::from_secs(30),
            success_threshold: 2,
            failure_codes: [
                ErrorCode::Unavailable,
                ErrorCode::DeadlineExceeded,
                ErrorCode::Internal,
                ErrorCode::Unknown,
            ]
            .into_iter()
            .collect(),
        }
    }
}

#[derive(Debug)]
enum CircuitState {
    Closed { failures: VecDeque<Instant> },
    Open { since: Instant },
    HalfOpen { successes: u32 },
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    states: Mutex<HashMap<String, CircuitState>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        CircuitBreaker {
            config,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Decide whether the call may proceed; transitions open→half-open when
    /// the reset timeout has elapsed.
    fn check(&self, procedure: &str) -> Result<(), RpcError> {
        let mut states = self.states.lock().expect("circuit lock poisoned");
        let state = states
            .entry(procedure.to_owned())
            .or_insert_with(|| CircuitState::Closed {
                failures: VecDeque::new(),
            });
        if let CircuitState::Open { since } = state {
            let elapsed = since.elapsed();
            if elapsed >= self.config.reset_timeout {
                info!(procedure, "circuit half-open, probing");
                *state = CircuitState::HalfOpen { successes: 0 };
                return Ok(());
            }
            let reset_after = self.config.reset_timeout - elapsed;
            return Err(RpcError::new(
                ErrorCode::Unavailable,
                format!("circuit open for '{procedure}'"),
            )
            .with_details(json!({
                "circuitOpen": true,
                "resetAfterMs": reset_after.as_millis() as u64,
            })));
        }
        Ok(())
    }

    fn record_success(&self, procedure: &str) {
        let mut states = self.states.lock().expect("circuit lock poisoned");
        if let Some(state) = states.get_mut(procedure) {
            match state {
                CircuitState::Closed { failures } => failures.clear(),
                CircuitState::HalfOpen { successes } => {
                    *successes += 1;
                    if *successes >= self.config.success_threshold {
                        info!(procedure, "circuit closed");
                        *state = CircuitState::Closed {
                            failures: VecDeque::new(),
                        };
                    }
                }
                CircuitState::Open { .. } => {}
            }
        }
    }

    fn record_failure(&self, procedure: &str) {
        let now = Instant::now();
        let mut states = self.states.lock().expect("circuit lock poisoned");
        let state = states
            .entry(procedure.to_owned())
            .or_insert_with(|| CircuitState::Closed {
                failures: VecDeque::new(),
            });
        match state {
            CircuitState::Closed { failures } => {
                failures.push_back(now);
                while failures
                    .front()
                    .is_some_and(|t| now.duration_since(*t) > self.config.window)
                {
                    failures.pop_front();
                }
                if failures.len() as u32 >= self.config.failure_threshold {
                    warn!(procedure, failures = failures.len(), "circuit opened");
                    *state = CircuitState::Open { since: now };
                }
            }
            CircuitState::HalfOpen { .. } => {
                warn!(procedure, "probe failed, circuit re-opened");
                *state = CircuitState::Open { since: now };
            }
            CircuitState::Open { .. } => {}
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        CircuitBreaker::new(CircuitBreakerConfig::default())
    }
}

#[async_trait]
impl Interceptor for CircuitBreaker {
    async fn handle(
        &self,
        envelope: Envelope,
        ctx: Context,
        next: Next,
    ) -> Result<Value, RpcError> {
        let procedure = envelope.procedure.clone();
        self.check(&procedure)?;

        match next.run(envelope, ctx).await {
            Ok(value) => {
                self.record_success(&procedure);
                Ok(value)
            }
            Err(err) => {
                if self.config.failure_codes.contains(&err.code) {
                    self.record_failure(&procedure);
                }
                Err(err)
            }
        }
    }
}
