//! Authentication and authorization.
//!
//! Authentication runs a chain of strategies; each inspects the envelope
//! metadata (bearer header, api-key header, cookie, query parameter) and
//! returns authenticated / not-applicable / invalid.  The first
//! authenticated strategy wins and its [`AuthContext`] is attached to the
//! request context.  If every strategy is not-applicable the request is
//! rejected with `UNAUTHENTICATED` unless the procedure is in the public
//! set.
//!
//! Authorization is a separate interceptor checking roles against
//! declarative pattern rules; failures raise `PERMISSION_DENIED`.

use async_trait::async_trait;
use sb_core::middleware::BoxFuture;
use sb_core::{AuthContext, Context, Interceptor, Next, Pattern};
use sb_protocol::{Envelope, ErrorCode, RpcError};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

// ---------------------------------------------------------------------------
// Strategy port
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum AuthOutcome {
    Authenticated(AuthContext),
    /// The strategy's credential shape is absent from this request.
    NotApplicable,
    /// The credential was present but did not verify.
    Invalid(String),
}

#[async_trait]
pub trait AuthStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    async fn authenticate(&self, envelope: &Envelope, ctx: &Context) -> AuthOutcome;
}

type VerifyFn = Arc<dyn Fn(&str) -> BoxFuture<'static, Option<AuthContext>> + Send + Sync>;

fn boxed_verify<F, Fut>(verify: F) -> VerifyFn
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<AuthContext>> + Send + 'static,
{
    Arc::new(move |token: &str| Box::pin(verify(token.to_owned())))
}

// ---------------------------------------------------------------------------
// Built-in strategies
// ---------------------------------------------------------------------------

/// `Authorization: Bearer <token>` metadata.
pub struct BearerAuth {
    verify: VerifyFn,
}

impl BearerAuth {
    pub fn new<F, Fut>(verify: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<AuthContext>> + Send + 'static,
    {
        BearerAuth {
            verify: boxed_verify(verify),
        }
    }
}

fn extract_bearer(header: &str) -> Option<&str> {
    header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

#[async_trait]
impl AuthStrategy for BearerAuth {
    fn name(&self) -> &'static str {
        "bearer"
    }

    async fn authenticate(&self, envelope: &Envelope, _ctx: &Context) -> AuthOutcome {
        let Some(header) = envelope.metadata.get("authorization") else {
            return AuthOutcome::NotApplicable;
        };
        let Some(token) = extract_bearer(header) else {
            return AuthOutcome::NotApplicable;
        };
        match (self.verify)(token).await {
            Some(auth) => AuthOutcome::Authenticated(auth),
            None => AuthOutcome::Invalid("invalid bearer token".to_owned()),
        }
    }
}

/// An api-key header (default `x-api-key`).
pub struct ApiKeyAuth {
    header: String,
    verify: VerifyFn,
}

impl ApiKeyAuth {
    pub fn new<F, Fut>(verify: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<AuthContext>> + Send + 'static,
    {
        ApiKeyAuth {
            header: "x-api-key".to_owned(),
            verify: boxed_verify(verify),
        }
    }

    pub fn header(mut self, header: impl Into<String>) -> Self {
        self.header = header.into();
        self
    }
}

#[async_trait]
impl AuthStrategy for ApiKeyAuth {
    fn name(&self) -> &'static str {
        "api-key"
    }

    async fn authenticate(&self, envelope: &Envelope, _ctx: &Context) -> AuthOutcome {
        let Some(key) = envelope.metadata.get(&self.header) else {
            return AuthOutcome::NotApplicable;
        };
        match (self.verify)(key).await {
            Some(auth) => AuthOutcome::Authenticated(auth),
            None => AuthOutcome::Invalid("invalid api key".to_owned()),
        }
    }
}

/// A session cookie inside `cookie` metadata.
pub struct CookieAuth {
    cookie: String,
    verify: VerifyFn,
}

impl CookieAuth {
    pub fn new<F, Fut>(cookie: impl Into<String>, verify: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<AuthContext>> + Send + 'static,
    {
        CookieAuth {
            cookie: cookie.into(),
            verify: boxed_verify(verify),
        }
    }
}

fn cookie_value<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    header.split(';').find_map(|pair| {
        let (k, v) = pair.trim().split_once('=')?;
        (k == name).then_some(v)
    })
}

#[async_trait]
impl AuthStrategy for CookieAuth {
    fn name(&self) -> &'static str {
        "cookie"
    }

    async fn authenticate(&self, envelope: &Envelope, _ctx: &Context) -> AuthOutcome {
        let Some(header) = envelope.metadata.get("cookie") else {
            return AuthOutcome::NotApplicable;
        };
        let Some(value) = cookie_value(header, &self.cookie) else {
            return AuthOutcome::NotApplicable;
        };
        match (self.verify)(value).await {
            Some(auth) => AuthOutcome::Authenticated(auth),
            None => AuthOutcome::Invalid("invalid session cookie".to_owned()),
        }
    }
}

/// A token carried as a payload field (GET/DELETE query parameters are
/// merged into the payload by the HTTP adapter).
pub struct QueryParamAuth {
    param: String,
    verify: VerifyFn,
}

impl QueryParamAuth {
    pub fn new<F, Fut>(param: impl Into<String>, verify: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<AuthContext>> + Send + 'static,
    {
        QueryParamAuth {
            param: param.into(),
            verify: boxed_verify(verify),
        }
    }
}

#[async_trait]
impl AuthStrategy for QueryParamAuth {
    fn name(&self) -> &'static str {
        "query-param"
    }

    async fn authenticate(&self, envelope: &Envelope, _ctx: &Context) -> AuthOutcome {
        let Some(token) = envelope.payload.get(&self.param).and_then(Value::as_str) else {
            return AuthOutcome::NotApplicable;
        };
        match (self.verify)(token).await {
            Some(auth) => AuthOutcome::Authenticated(auth),
            None => AuthOutcome::Invalid("invalid token parameter".to_owned()),
        }
    }
}

// ---------------------------------------------------------------------------
// Authentication interceptor
// ---------------------------------------------------------------------------

pub struct Authentication {
    strategies: Vec<Arc<dyn AuthStrategy>>,
    public: Vec<Pattern>,
}

impl Authentication {
    pub fn new(strategies: Vec<Arc<dyn AuthStrategy>>) -> Self {
        Authentication {
            strategies,
            public: Vec::new(),
        }
    }

    /// Procedures matching `pattern` skip the authentication requirement.
    pub fn public(mut self, pattern: &str) -> Self {
        self.public.push(Pattern::parse(pattern));
        self
    }

    fn is_public(&self, procedure: &str) -> bool {
        self.public.iter().any(|p| p.matches(procedure))
    }
}

#[async_trait]
impl Interceptor for Authentication {
    async fn handle(
        &self,
        envelope: Envelope,
        mut ctx: Context,
        next: Next,
    ) -> Result<Value, RpcError> {
        for strategy in &self.strategies {
            match strategy.authenticate(&envelope, &ctx).await {
                AuthOutcome::Authenticated(auth) => {
                    debug!(strategy = strategy.name(), principal = %auth.principal, "authenticated");
                    ctx.auth = Some(auth);
                    return next.run(envelope, ctx).await;
                }
                AuthOutcome::Invalid(reason) => {
                    if self.is_public(&envelope.procedure) {
                        return next.run(envelope, ctx).await;
                    }
                    return Err(RpcError::new(ErrorCode::Unauthenticated, reason));
                }
                AuthOutcome::NotApplicable => {}
            }
        }
        if self.is_public(&envelope.procedure) {
            return next.run(envelope, ctx).await;
        }
        Err(RpcError::new(
            ErrorCode::Unauthenticated,
            "no credentials presented",
        ))
    }
}

// ---------------------------------------------------------------------------
// Authorization interceptor
// ---------------------------------------------------------------------------

pub struct Authorization {
    rules: Vec<(Pattern, Vec<String>)>,
}

impl Authorization {
    pub fn new() -> Self {
        Authorization { rules: Vec::new() }
    }

    /// Require any of `roles` for procedures matching `pattern`.
    pub fn require_role(mut self, pattern: &str, roles: &[&str]) -> Self {
        self.rules.push((
            Pattern::parse(pattern),
            roles.iter().map(|r| (*r).to_owned()).collect(),
        ));
        self
    }
}

impl Default for Authorization {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Interceptor for Authorization {
    async fn handle(
        &self,
        envelope: Envelope,
        ctx: Context,
        next: Next,
    ) -> Result<Value, RpcError> {
        for (pattern, roles) in &self.rules {
            if !pattern.matches(&envelope.procedure) {
                continue;
            }
            let Some(auth) = ctx.auth.as_ref().filter(|a| a.authenticated) else {
                return Err(RpcError::new(
                    ErrorCode::Unauthenticated,
                    "authentication required",
                ));
            };
            if !roles.iter().any(|role| auth.has_role(role)) {
                return Err(RpcError::new(
                    ErrorCode::PermissionDenied,
                    format!("requires one of roles: {}", roles.join(", ")),
                ));
            }
        }
        next.run(envelope, ctx).await
    }
}
