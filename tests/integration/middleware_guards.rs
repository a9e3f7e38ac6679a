//! Guard middleware working through the full dispatch path: circuit
//! breaker trip/recovery, rate-limit windows, retry, timeout, cache, and
//! envelope wrap.

use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use switchboard::middleware::{
    Backoff, Cache, CacheConfig, CircuitBreaker, CircuitBreakerConfig, EnvelopeWrap, KeySelector,
    MemoryStore, RateLimit, RateLimitRule, RequestId, Retry, RetryPolicy, Timeout,
};
use switchboard::{
    Context, Envelope, ErrorCode, FrameKind, Interceptor, ProcedureOptions, Registry, Reply,
    Router, RpcError, SharedRegistry,
};

fn single_proc_registry<F, Fut>(name: &str, handler: F) -> Registry
where
    F: Fn(Value, Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
{
    let mut registry = Registry::new();
    registry
        .register_procedure(name, handler, ProcedureOptions::default())
        .unwrap();
    registry
}

fn router(registry: Registry, interceptors: Vec<Arc<dyn Interceptor>>) -> Router {
    let mut builder = Router::builder(Arc::new(SharedRegistry::new(registry)));
    for i in interceptors {
        builder = builder.interceptor(i);
    }
    builder.build()
}

async fn call(router: &Router, name: &str, payload: Value) -> Envelope {
    let Reply::Response(response) = router
        .handle(Envelope::request(name, payload), &Context::new())
        .await
    else {
        panic!("expected a response envelope");
    };
    response
}

// ---------------------------------------------------------------------------
// Circuit breaker (scenario: threshold 3, reset 100ms)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn circuit_trips_recovers_half_open_and_closes() {
    let calls = Arc::new(AtomicU32::new(0));
    let failing = Arc::new(std::sync::atomic::AtomicBool::new(true));
    let registry = {
        let calls = calls.clone();
        let failing = failing.clone();
        single_proc_registry("backend.call", move |_p, _ctx| {
            let calls = calls.clone();
            let failing = failing.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if failing.load(Ordering::SeqCst) {
                    Err(RpcError::new(ErrorCode::Unavailable, "backend down"))
                } else {
                    Ok(json!("ok"))
                }
            }
        })
    };
    let breaker = CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold: 3,
        window: Duration::from_secs(10),
        reset_timeout: Duration::from_millis(100),
        success_threshold: 1,
        ..CircuitBreakerConfig::default()
    });
    let router = router(registry, vec![Arc::new(breaker)]);

    for _ in 0..3 {
        let response = call(&router, "backend.call", json!({})).await;
        assert_eq!(response.as_error().unwrap().code, ErrorCode::Unavailable);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    // Open: fourth call fails fast without reaching the handler.
    let response = call(&router, "backend.call", json!({})).await;
    let err = response.as_error().unwrap();
    assert_eq!(err.code, ErrorCode::Unavailable);
    assert_eq!(err.details.as_ref().unwrap()["circuitOpen"], true);
    assert!(err.details.as_ref().unwrap()["resetAfterMs"].is_number());
    assert_eq!(calls.load(Ordering::SeqCst), 3, "handler not invoked");

    // After the reset timeout the next call probes (half-open) and, on
    // success, the circuit closes again.
    tokio::time::sleep(Duration::from_millis(120)).await;
    failing.store(false, Ordering::SeqCst);
    let response = call(&router, "backend.call", json!({})).await;
    assert_eq!(response.kind, FrameKind::Response);
    let response = call(&router, "backend.call", json!({})).await;
    assert_eq!(response.kind, FrameKind::Response);
    assert_eq!(calls.load(Ordering::SeqCst), 5);
}

// ---------------------------------------------------------------------------
// Rate limiting (property: no key exceeds max in a window)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn no_key_sees_more_than_max_successes_per_window() {
    let registry = single_proc_registry("pinged", |_p, _ctx| async move { Ok(json!("pong")) });
    let limiter = RateLimit::new(
        RateLimitRule::new(5, Duration::from_secs(60)).fixed_window(),
        KeySelector::Ip,
    );
    let router = router(registry, vec![Arc::new(limiter)]);

    let mut successes = 0;
    let mut limited = 0;
    for _ in 0..20 {
        let Reply::Response(response) = router
            .handle(
                Envelope::request("pinged", json!({})).with_metadata("x-forwarded-for", "9.9.9.9"),
                &Context::new(),
            )
            .await
        else {
            panic!("expected response");
        };
        match response.as_error() {
            None => successes += 1,
            Some(err) => {
                assert_eq!(err.code, ErrorCode::ResourceExhausted);
                let details = err.details.unwrap();
                assert_eq!(details["limit"], 5);
                assert!(details["retryAfter"].is_number());
                limited += 1;
            }
        }
    }
    assert_eq!(successes, 5);
    assert_eq!(limited, 15);
}

// ---------------------------------------------------------------------------
// Retry + timeout interplay
// ---------------------------------------------------------------------------

#[tokio::test]
async fn retry_recovers_transient_failures_behind_the_router() {
    let calls = Arc::new(AtomicU32::new(0));
    let registry = {
        let calls = calls.clone();
        single_proc_registry("flaky.fetch", move |_p, _ctx| {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(RpcError::new(ErrorCode::Unavailable, "transient"))
                } else {
                    Ok(json!("finally"))
                }
            }
        })
    };
    let retry = Retry::new(RetryPolicy {
        max_attempts: 5,
        backoff: Backoff::Linear {
            base: Duration::from_millis(1),
        },
        ..RetryPolicy::default()
    });
    let router = router(registry, vec![Arc::new(retry)]);

    let response = call(&router, "flaky.fetch", json!({})).await;
    assert_eq!(response.payload, json!("finally"));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn timeout_cancels_slow_handlers_with_deadline_exceeded() {
    let registry = single_proc_registry("slow.report", |_p, _ctx| async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(json!("too late"))
    });
    let router = router(
        registry,
        vec![Arc::new(Timeout::new(Duration::from_millis(30)))],
    );

    let started = std::time::Instant::now();
    let response = call(&router, "slow.report", json!({})).await;
    assert_eq!(
        response.as_error().unwrap().code,
        ErrorCode::DeadlineExceeded
    );
    assert!(started.elapsed() < Duration::from_secs(5));
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cache_short_circuits_repeat_calls() {
    let calls = Arc::new(AtomicU32::new(0));
    let registry = {
        let calls = calls.clone();
        single_proc_registry("quote.get", move |payload: Value, _ctx| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"symbol": payload["symbol"], "px": 101}))
            }
        })
    };
    let cache = Cache::new(
        Arc::new(MemoryStore::new(128)),
        CacheConfig {
            ttl: Duration::from_secs(60),
            ..CacheConfig::default()
        },
    );
    let router = router(registry, vec![Arc::new(cache)]);

    let first = call(&router, "quote.get", json!({"symbol": "ABC"})).await;
    let second = call(&router, "quote.get", json!({"symbol": "ABC"})).await;
    assert_eq!(first.payload, second.payload);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    call(&router, "quote.get", json!({"symbol": "XYZ"})).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

// ---------------------------------------------------------------------------
// Envelope wrap + request id
// ---------------------------------------------------------------------------

#[tokio::test]
async fn wrap_produces_canonical_shape_with_request_id_meta() {
    let registry = single_proc_registry("shaped.call", |_p, _ctx| async move { Ok(json!(7)) });
    let router = router(
        registry,
        vec![Arc::new(RequestId), Arc::new(EnvelopeWrap::default())],
    );

    let Reply::Response(response) = router
        .handle(
            Envelope::request("shaped.call", json!({})).with_metadata("x-request-id", "req-42"),
            &Context::new(),
        )
        .await
    else {
        panic!("expected response");
    };
    assert_eq!(response.payload["success"], true);
    assert_eq!(response.payload["data"], 7);
    assert_eq!(response.payload["meta"]["requestId"], "req-42");
    assert!(response.payload["meta"]["durationMs"].is_number());
    // The router stamps the propagated request id onto reply metadata too.
    assert_eq!(
        response.metadata.get("x-request-id").map(String::as_str),
        Some("req-42")
    );
}

#[tokio::test]
async fn wrap_converts_handler_errors_to_success_false() {
    let registry = single_proc_registry("shaped.fail", |_p, _ctx| async move {
        Err::<Value, _>(RpcError::new(ErrorCode::FailedPrecondition, "not ready"))
    });
    let router = router(registry, vec![Arc::new(EnvelopeWrap::default())]);

    let response = call(&router, "shaped.fail", json!({})).await;
    assert_eq!(response.kind, FrameKind::Response);
    assert_eq!(response.payload["success"], false);
    assert_eq!(response.payload["error"]["code"], "FAILED_PRECONDITION");
}
