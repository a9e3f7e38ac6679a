//! Per-request context and the cancellation model.
//!
//! One `Context` exists per in-flight envelope.  Its cancellation token is
//! the single source of truth for cancellation: adapters trip it on client
//! disconnect, the timeout middleware trips it on deadline expiry, and
//! upstream callers may trip it explicitly.  Derived child contexts cancel
//! when their parent cancels; cancellation is one-shot and monotonic.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Cancellation token
// ---------------------------------------------------------------------------

/// Cloneable one-shot cancellation handle.
///
/// Supports the three observation modes: non-blocking query
/// ([`CancelToken::is_cancelled`]), await ([`CancelToken::cancelled`]), and
/// callback subscription ([`CancelToken::on_cancel`]).  All registered
/// callbacks fire on the single trip.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: CancellationToken,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken {
            inner: CancellationToken::new(),
        }
    }

    /// Trip the token.  Idempotent; later calls are no-ops.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Resolves when the token trips; resolves immediately if already tripped.
    pub async fn cancelled(&self) {
        self.inner.cancelled().await;
    }

    /// Register a callback to run once when the token trips.  Fires
    /// immediately (still on a spawned task) if the token is already tripped.
    pub fn on_cancel<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let token = self.inner.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            callback();
        });
    }

    /// Derive a child token: cancels when the parent cancels, but cancelling
    /// the child does not affect the parent.
    pub fn child(&self) -> CancelToken {
        CancelToken {
            inner: self.inner.child_token(),
        }
    }
}

// ---------------------------------------------------------------------------
// Auth and tracing
// ---------------------------------------------------------------------------

/// The authentication outcome attached to a context by the auth middleware.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthContext {
    pub authenticated: bool,
    pub principal: String,
    pub claims: serde_json::Value,
    pub roles: Vec<String>,
}

impl AuthContext {
    pub fn authenticated(principal: impl Into<String>) -> Self {
        AuthContext {
            authenticated: true,
            principal: principal.into(),
            claims: serde_json::Value::Null,
            roles: Vec::new(),
        }
    }

    pub fn with_roles(mut self, roles: Vec<String>) -> Self {
        self.roles = roles;
        self
    }

    pub fn with_claims(mut self, claims: serde_json::Value) -> Self {
        self.claims = claims;
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
}

impl TraceContext {
    fn generate() -> Self {
        TraceContext {
            trace_id: Uuid::new_v4().to_string(),
            span_id: Uuid::new_v4().to_string(),
        }
    }

    /// A child span under the same trace.
    fn child(&self) -> Self {
        TraceContext {
            trace_id: self.trace_id.clone(),
            span_id: Uuid::new_v4().to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Typed extension map
// ---------------------------------------------------------------------------

/// Typed side-channel for middleware to attach data (validated payload,
/// resolved user, ...).  Keyed by `TypeId`; shared between a context and its
/// children so attachments made mid-chain stay visible downstream.
#[derive(Clone, Default)]
pub struct Extensions {
    map: Arc<RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>>,
}

impl Extensions {
    pub fn insert<T: Any + Send + Sync>(&self, value: T) {
        self.map
            .write()
            .expect("extensions lock poisoned")
            .insert(TypeId::of::<T>(), Arc::new(value));
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.map
            .read()
            .expect("extensions lock poisoned")
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|any| any.downcast::<T>().ok())
    }

    pub fn remove<T: Any + Send + Sync>(&self) {
        self.map
            .write()
            .expect("extensions lock poisoned")
            .remove(&TypeId::of::<T>());
    }
}

impl std::fmt::Debug for Extensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.map.read().map(|m| m.len()).unwrap_or(0);
        write!(f, "Extensions({len} entries)")
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Extension slot recording the effective request id once middleware has
/// propagated or minted one.  The router prefers this over the context's
/// own id when stamping reply metadata, because extensions are shared with
/// the chain's child contexts while `request_id` is not.
#[derive(Debug, Clone)]
pub struct RequestIdTag(pub String);

/// Everything that travels alongside one in-flight envelope.
#[derive(Debug, Clone)]
pub struct Context {
    pub request_id: String,
    pub cancellation: CancelToken,
    pub auth: Option<AuthContext>,
    pub trace: TraceContext,
    pub extensions: Extensions,
}

impl Context {
    pub fn new() -> Self {
        Context {
            request_id: Uuid::new_v4().to_string(),
            cancellation: CancelToken::new(),
            auth: None,
            trace: TraceContext::generate(),
            extensions: Extensions::default(),
        }
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = id.into();
        self
    }

    /// Build a context whose cancellation is tied to an adapter-owned token
    /// (e.g. a per-socket token tripped on disconnect).
    pub fn with_cancellation(mut self, token: CancelToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn with_auth(mut self, auth: AuthContext) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Derive a child: same request id and auth, child cancellation token,
    /// child span, shared extensions.
    pub fn child(&self) -> Context {
        Context {
            request_id: self.request_id.clone(),
            cancellation: self.cancellation.child(),
            auth: self.auth.clone(),
            trace: self.trace.child(),
            extensions: self.extensions.clone(),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}
