//! Router dispatch contracts: procedure happy path, validation failures,
//! unknown procedures, kind mismatches, and middleware ordering through the
//! public API.

use sb_test_utils::TypeValidator;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use switchboard::{
    Context, Envelope, ErrorCode, FrameKind, Interceptor, Next, ProcedureOptions, Registry, Reply,
    Router, RpcError, SharedRegistry, for_pattern,
};

fn adder_registry() -> Registry {
    let mut registry = Registry::with_validator(Arc::new(TypeValidator));
    registry
        .register_procedure(
            "math.add",
            |payload: Value, _ctx| async move {
                let a = payload["a"].as_i64().unwrap_or(0);
                let b = payload["b"].as_i64().unwrap_or(0);
                Ok(json!({"sum": a + b}))
            },
            ProcedureOptions::default()
                .input_schema(json!({
                    "type": "object",
                    "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
                    "required": ["a", "b"],
                }))
                .output_schema(json!({
                    "type": "object",
                    "properties": {"sum": {"type": "number"}},
                })),
        )
        .unwrap();
    registry
}

fn router_over(registry: Registry) -> Router {
    Router::new(Arc::new(SharedRegistry::new(registry)))
}

#[tokio::test]
async fn procedure_happy_path_returns_single_response() {
    let router = router_over(adder_registry());
    let env = Envelope::request_with_id("1", "math.add", json!({"a": 2, "b": 3}));
    let reply = router.handle(env, &Context::new()).await;
    let Reply::Response(response) = reply else {
        panic!("expected a single response envelope");
    };
    assert_eq!(response.kind, FrameKind::Response);
    assert_eq!(response.id, "1");
    assert_eq!(response.payload, json!({"sum": 5}));
}

#[tokio::test]
async fn validation_failure_carries_field_errors() {
    let router = router_over(adder_registry());
    let env = Envelope::request_with_id("2", "math.add", json!({"a": "x", "b": 3}));
    let Reply::Response(response) = router.handle(env, &Context::new()).await else {
        panic!("expected a response envelope");
    };
    assert_eq!(response.kind, FrameKind::Error);
    let err = response.as_error().unwrap();
    assert_eq!(err.code, ErrorCode::ValidationError);
    let errors = err.details.unwrap()["errors"].clone();
    assert_eq!(errors[0]["field"], "a");
}

#[tokio::test]
async fn unknown_procedure_is_not_found() {
    let router = router_over(adder_registry());
    let env = Envelope::request_with_id("3", "does.not.exist", json!({}));
    let Reply::Response(response) = router.handle(env, &Context::new()).await else {
        panic!("expected a response envelope");
    };
    assert_eq!(response.as_error().unwrap().code, ErrorCode::NotFound);
}

#[tokio::test]
async fn duplicate_names_rejected_at_registration() {
    let mut registry = adder_registry();
    let err = registry
        .register_procedure(
            "math.add",
            |p: Value, _| async move { Ok(p) },
            ProcedureOptions::default(),
        )
        .unwrap_err();
    let rpc: RpcError = err.into();
    assert_eq!(rpc.code, ErrorCode::AlreadyExists);
}

struct Tracer {
    name: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait::async_trait]
impl Interceptor for Tracer {
    async fn handle(
        &self,
        envelope: Envelope,
        ctx: Context,
        next: Next,
    ) -> Result<Value, RpcError> {
        self.log.lock().unwrap().push(format!("{}.pre", self.name));
        let result = next.run(envelope, ctx).await;
        self.log.lock().unwrap().push(format!("{}.post", self.name));
        result
    }
}

#[tokio::test]
async fn middleware_runs_global_then_handler_then_validation() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut registry = Registry::with_validator(Arc::new(TypeValidator));
    registry
        .register_procedure(
            "traced.call",
            {
                let log = log.clone();
                move |p: Value, _ctx| {
                    let log = log.clone();
                    async move {
                        log.lock().unwrap().push("handler".to_owned());
                        Ok(p)
                    }
                }
            },
            ProcedureOptions::default()
                .middleware(Arc::new(Tracer {
                    name: "handler_mw",
                    log: log.clone(),
                }))
                .input_schema(json!({"type": "object"})),
        )
        .unwrap();

    let router = Router::builder(Arc::new(SharedRegistry::new(registry)))
        .interceptor(Arc::new(Tracer {
            name: "global",
            log: log.clone(),
        }))
        .build();

    let env = Envelope::request_with_id("m1", "traced.call", json!({}));
    router.handle(env, &Context::new()).await;

    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "global.pre",
            "handler_mw.pre",
            "handler",
            "handler_mw.post",
            "global.post"
        ]
    );
}

#[tokio::test]
async fn pattern_scoped_interceptor_skips_other_procedures() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut registry = Registry::new();
    registry
        .register_procedure(
            "users.get",
            |p: Value, _| async move { Ok(p) },
            ProcedureOptions::default(),
        )
        .unwrap();
    registry
        .register_procedure(
            "orders.get",
            |p: Value, _| async move { Ok(p) },
            ProcedureOptions::default(),
        )
        .unwrap();

    let router = Router::builder(Arc::new(SharedRegistry::new(registry)))
        .interceptor(for_pattern(
            "users.**",
            Arc::new(Tracer {
                name: "users_only",
                log: log.clone(),
            }),
        ))
        .build();

    router
        .handle(
            Envelope::request_with_id("a", "users.get", json!({})),
            &Context::new(),
        )
        .await;
    router
        .handle(
            Envelope::request_with_id("b", "orders.get", json!({})),
            &Context::new(),
        )
        .await;

    assert_eq!(
        *log.lock().unwrap(),
        vec!["users_only.pre", "users_only.post"]
    );
}

#[tokio::test]
async fn error_envelope_reuses_id_with_error_suffix() {
    let mut registry = Registry::new();
    registry
        .register_procedure(
            "always.fails",
            |_: Value, _| async move {
                Err::<Value, _>(RpcError::new(ErrorCode::Unavailable, "down"))
            },
            ProcedureOptions::default(),
        )
        .unwrap();
    let router = router_over(registry);
    let Reply::Response(response) = router
        .handle(
            Envelope::request_with_id("id-9", "always.fails", json!({})),
            &Context::new(),
        )
        .await
    else {
        panic!("expected response");
    };
    assert_eq!(response.id, "id-9:error");
    assert_eq!(response.kind, FrameKind::Error);
}

#[tokio::test]
async fn hot_swap_is_atomic_for_new_requests() {
    let shared = Arc::new(SharedRegistry::new(adder_registry()));
    let router = Router::new(shared.clone());

    let mut v2 = Registry::new();
    v2.register_procedure(
        "math.add",
        |_: Value, _| async move { Ok(json!({"sum": -1})) },
        ProcedureOptions::default(),
    )
    .unwrap();
    shared.swap(v2);

    let Reply::Response(response) = router
        .handle(
            Envelope::request_with_id("s1", "math.add", json!({"a": 1, "b": 1})),
            &Context::new(),
        )
        .await
    else {
        panic!("expected response");
    };
    assert_eq!(response.payload, json!({"sum": -1}));
}
