//! HTTP and JSON-RPC adapters end-to-end against an in-process server:
//! default routes, explicit bindings with path params, SSE streams, events,
//! status mapping, rate-limit headers, and batch semantics.

use sb_test_utils::TypeValidator;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use switchboard::middleware::{KeySelector, RateLimit, RateLimitRule};
use switchboard::{
    Context, EventOptions, ProcedureOptions, Registry, Server, ServerConfig, StreamOptions,
    StreamSink,
};

fn test_registry(event_hits: Arc<AtomicU32>) -> Registry {
    let mut registry = Registry::with_validator(Arc::new(TypeValidator));
    registry
        .register_procedure(
            "math.add",
            |payload: Value, _ctx| async move {
                let a = payload["a"].as_i64().unwrap_or(0);
                let b = payload["b"].as_i64().unwrap_or(0);
                Ok(json!({"sum": a + b}))
            },
            ProcedureOptions::default().input_schema(json!({
                "type": "object",
                "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
                "required": ["a", "b"],
            })),
        )
        .unwrap();
    registry
        .register_procedure(
            "users.get",
            |payload: Value, _ctx| async move {
                Ok(json!({"id": payload["id"], "page": payload["page"]}))
            },
            ProcedureOptions::default().http("GET", "/users/{id}"),
        )
        .unwrap();
    registry
        .register_stream(
            "counter",
            |_payload, _ctx: Context, sink: StreamSink| async move {
                for v in 1..=3 {
                    sink.send(json!({"v": v})).await?;
                }
                Ok(())
            },
            StreamOptions::default(),
        )
        .unwrap();
    registry
        .register_event(
            "audit.log",
            move |_payload, _ctx| {
                let hits = event_hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            EventOptions::default(),
        )
        .unwrap();
    registry
}

async fn start_server() -> (Server, Arc<AtomicU32>) {
    let event_hits = Arc::new(AtomicU32::new(0));
    let server = Server::builder(ServerConfig::default())
        .registry(test_registry(event_hits.clone()))
        .start()
        .await
        .expect("server starts");
    (server, event_hits)
}

#[tokio::test]
async fn default_post_route_dispatches_procedures() {
    let (server, _) = start_server().await;
    let url = format!("http://{}/math.add", server.http_addr());

    let client = reqwest::Client::new();
    let response = client
        .post(&url)
        .json(&json!({"a": 2, "b": 3}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(response.headers().contains_key("x-request-id"));
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({"sum": 5}));

    server.shutdown().await;
}

#[tokio::test]
async fn validation_and_lookup_errors_map_to_http_statuses() {
    let (server, _) = start_server().await;
    let base = format!("http://{}", server.http_addr());
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/math.add"))
        .json(&json!({"a": "x", "b": 3}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "VALIDATION_ERROR");
    assert_eq!(body["details"]["errors"][0]["field"], "a");

    let response = client
        .post(format!("{base}/does.not.exist"))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "NOT_FOUND");

    let response = client
        .post(format!("{base}/math.add"))
        .header("content-type", "application/json")
        .body("{nope")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "PARSE_ERROR");

    server.shutdown().await;
}

#[tokio::test]
async fn explicit_binding_merges_path_and_query_params() {
    let (server, _) = start_server().await;
    let url = format!("http://{}/users/42?page=2", server.http_addr());

    let body: Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
    assert_eq!(body, json!({"id": "42", "page": "2"}));

    server.shutdown().await;
}

#[tokio::test]
async fn streams_serve_as_sse_over_get() {
    let (server, _) = start_server().await;
    let url = format!("http://{}/counter", server.http_addr());

    let response = reqwest::get(&url).await.unwrap();
    assert_eq!(response.status(), 200);
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned();
    assert!(content_type.starts_with("text/event-stream"));

    let body = response.text().await.unwrap();
    let data_lines: Vec<&str> = body
        .lines()
        .filter(|line| line.starts_with("data:") && !line.contains("keepalive"))
        .collect();
    assert_eq!(data_lines.len(), 3, "three data events, body: {body}");
    assert!(data_lines[0].contains("\"v\":1"));
    assert!(data_lines[2].contains("\"v\":3"));

    server.shutdown().await;
}

#[tokio::test]
async fn events_return_202_and_run_once() {
    let (server, event_hits) = start_server().await;
    let url = format!("http://{}/events/audit.log", server.http_addr());

    let response = reqwest::Client::new()
        .post(&url)
        .json(&json!({"action": "login"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(event_hits.load(Ordering::SeqCst), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn rate_limited_responses_carry_limit_headers() {
    let mut config = ServerConfig::default();
    config.jsonrpc.enabled = false;
    let mut registry = Registry::new();
    registry
        .register_procedure(
            "pinged",
            |_p: Value, _ctx| async move { Ok(json!("pong")) },
            ProcedureOptions::default(),
        )
        .unwrap();
    let server = Server::builder(config)
        .registry(registry)
        .interceptor(Arc::new(RateLimit::new(
            RateLimitRule::new(1, Duration::from_secs(60)).fixed_window(),
            KeySelector::Ip,
        )))
        .start()
        .await
        .unwrap();

    let url = format!("http://{}/pinged", server.http_addr());
    let client = reqwest::Client::new();
    let ok = client
        .post(&url)
        .header("x-forwarded-for", "3.3.3.3")
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(ok.status(), 200);

    let limited = client
        .post(&url)
        .header("x-forwarded-for", "3.3.3.3")
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(limited.status(), 429);
    assert_eq!(
        limited
            .headers()
            .get("x-ratelimit-limit")
            .and_then(|v| v.to_str().ok()),
        Some("1")
    );
    assert!(limited.headers().contains_key("x-ratelimit-reset"));
    assert!(limited.headers().contains_key("retry-after"));

    server.shutdown().await;
}

// ---------------------------------------------------------------------------
// JSON-RPC
// ---------------------------------------------------------------------------

#[tokio::test]
async fn jsonrpc_single_request_round_trips() {
    let (server, _) = start_server().await;
    let url = format!("http://{}/rpc", server.http_addr());

    let body: Value = reqwest::Client::new()
        .post(&url)
        .json(&json!({"jsonrpc": "2.0", "method": "math.add", "params": {"a": 4, "b": 5}, "id": 1}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["jsonrpc"], "2.0");
    assert_eq!(body["result"], json!({"sum": 9}));
    assert_eq!(body["id"], 1);

    server.shutdown().await;
}

#[tokio::test]
async fn jsonrpc_method_not_found_uses_dash_32601() {
    let (server, _) = start_server().await;
    let url = format!("http://{}/rpc", server.http_addr());

    let body: Value = reqwest::Client::new()
        .post(&url)
        .json(&json!({"jsonrpc": "2.0", "method": "missing.method", "id": 7}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["error"]["code"], -32601);
    assert_eq!(body["error"]["data"]["code"], "NOT_FOUND");
    assert_eq!(body["id"], 7);

    server.shutdown().await;
}

#[tokio::test]
async fn jsonrpc_batch_preserves_order_and_omits_notifications() {
    let (server, event_hits) = start_server().await;
    let url = format!("http://{}/rpc", server.http_addr());

    let body: Value = reqwest::Client::new()
        .post(&url)
        .json(&json!([
            {"jsonrpc": "2.0", "method": "math.add", "params": {"a": 1, "b": 1}, "id": "first"},
            {"jsonrpc": "2.0", "method": "audit.log", "params": {"action": "x"}},
            {"jsonrpc": "2.0", "method": "math.add", "params": {"a": 2, "b": 2}, "id": "second"},
        ]))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let responses = body.as_array().unwrap();
    assert_eq!(responses.len(), 2, "notification omitted");
    assert_eq!(responses[0]["id"], "first");
    assert_eq!(responses[0]["result"], json!({"sum": 2}));
    assert_eq!(responses[1]["id"], "second");
    assert_eq!(responses[1]["result"], json!({"sum": 4}));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(event_hits.load(Ordering::SeqCst), 1, "notification ran");

    server.shutdown().await;
}

#[tokio::test]
async fn jsonrpc_parse_error_uses_dash_32700() {
    let (server, _) = start_server().await;
    let url = format!("http://{}/rpc", server.http_addr());

    let body: Value = reqwest::Client::new()
        .post(&url)
        .header("content-type", "application/json")
        .body("[{broken")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["error"]["code"], -32700);

    server.shutdown().await;
}
