//! Dispatch core: context + cancellation, handler registry, middleware
//! composition, and the router that turns inbound envelopes into replies.
//!
//! Protocol adapters sit on top of this crate; they parse wire bytes into
//! [`sb_protocol::Envelope`]s, hand them to [`Router::handle`] with a fresh
//! [`Context`], and encode the resulting reply (single envelope, lazy frame
//! stream, or nothing) back onto the wire.

pub mod context;
pub mod middleware;
pub mod pattern;
pub mod registry;
pub mod router;
pub mod store;
pub mod validator;

pub use context::{AuthContext, CancelToken, Context, Extensions, RequestIdTag, TraceContext};
pub use middleware::{Interceptor, Next, Terminal, compose, for_pattern};
pub use pattern::Pattern;
pub use registry::{
    DeliveryGuarantee, EventOptions, EventRetryPolicy, HandlerEntry, HandlerKind, HttpBinding,
    ProcedureOptions, Registry, RegistryError, SharedRegistry, StreamDirection, StreamOptions,
    StreamSink,
};
pub use router::{Reply, Router, RouterBuilder};
pub use store::{MemoryStore, Store};
pub use validator::Validator;
