//! Middleware composition.
//!
//! An [`Interceptor`] wraps the terminal dispatch: it may short-circuit
//! (return without calling `next`), transform the downstream result, or pass
//! a derived envelope/context down the chain.  Composition is left-to-right:
//! `compose([A, B])` runs `A` outermost, and responses unwind in reverse.

use crate::context::Context;
use async_trait::async_trait;
use sb_protocol::{Envelope, RpcError};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The innermost dispatch function a chain wraps.
pub type Terminal =
    Arc<dyn Fn(Envelope, Context) -> BoxFuture<'static, Result<Value, RpcError>> + Send + Sync>;

/// A wrapping function around the terminal dispatch.
///
/// Implementations must thread `ctx` through unchanged unless they
/// explicitly derive a child, and must not swallow cancellation errors.
#[async_trait]
pub trait Interceptor: Send + Sync {
    async fn handle(
        &self,
        envelope: Envelope,
        ctx: Context,
        next: Next,
    ) -> Result<Value, RpcError>;
}

// ---------------------------------------------------------------------------
// Chain continuation
// ---------------------------------------------------------------------------

/// The downstream continuation handed to each interceptor.
///
/// Calling [`Next::run`] invokes the rest of the chain and finally the
/// terminal.  `Next` is cloneable so recovery-style middleware (retry) can
/// re-invoke the downstream chain.
#[derive(Clone)]
pub struct Next {
    chain: Arc<[Arc<dyn Interceptor>]>,
    index: usize,
    terminal: Terminal,
}

impl Next {
    pub fn new(chain: Arc<[Arc<dyn Interceptor>]>, terminal: Terminal) -> Self {
        Next {
            chain,
            index: 0,
            terminal,
        }
    }

    pub fn run(
        self,
        envelope: Envelope,
        ctx: Context,
    ) -> BoxFuture<'static, Result<Value, RpcError>> {
        Box::pin(async move {
            match self.chain.get(self.index).cloned() {
                Some(interceptor) => {
                    let next = Next {
                        chain: self.chain,
                        index: self.index + 1,
                        terminal: self.terminal,
                    };
                    interceptor.handle(envelope, ctx, next).await
                }
                None => (self.terminal)(envelope, ctx).await,
            }
        })
    }
}

/// Run `interceptors` left-to-right around `terminal`.
pub async fn dispatch(
    interceptors: Vec<Arc<dyn Interceptor>>,
    terminal: Terminal,
    envelope: Envelope,
    ctx: Context,
) -> Result<Value, RpcError> {
    Next::new(interceptors.into(), terminal).run(envelope, ctx).await
}

// ---------------------------------------------------------------------------
// compose / for_pattern
// ---------------------------------------------------------------------------

struct Composite {
    inner: Arc<[Arc<dyn Interceptor>]>,
}

#[async_trait]
impl Interceptor for Composite {
    async fn handle(
        &self,
        envelope: Envelope,
        ctx: Context,
        next: Next,
    ) -> Result<Value, RpcError> {
        // The composite's inner chain terminates by resuming the outer chain.
        let terminal: Terminal = Arc::new(move |env, ctx| {
            let next = next.clone();
            next.run(env, ctx)
        });
        Next::new(self.inner.clone(), terminal)
            .run(envelope, ctx)
            .await
    }
}

/// Fold an ordered list of interceptors into one.  Composition is
/// associative: `compose([A, compose([B, C])])` behaves as `compose([A, B, C])`.
pub fn compose(interceptors: Vec<Arc<dyn Interceptor>>) -> Arc<dyn Interceptor> {
    Arc::new(Composite {
        inner: interceptors.into(),
    })
}

struct PatternScoped {
    pattern: crate::pattern::Pattern,
    inner: Arc<dyn Interceptor>,
}

#[async_trait]
impl Interceptor for PatternScoped {
    async fn handle(
        &self,
        envelope: Envelope,
        ctx: Context,
        next: Next,
    ) -> Result<Value, RpcError> {
        if self.pattern.matches(&envelope.procedure) {
            self.inner.handle(envelope, ctx, next).await
        } else {
            next.run(envelope, ctx).await
        }
    }
}

/// Wrap `inner` so it only applies when the envelope's procedure matches
/// `glob` (`*` = one segment, `**` = any suffix, bare name = exact).
pub fn for_pattern(glob: &str, inner: Arc<dyn Interceptor>) -> Arc<dyn Interceptor> {
    Arc::new(PatternScoped {
        pattern: crate::pattern::Pattern::parse(glob),
        inner,
    })
}
