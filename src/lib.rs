//! Switchboard: a protocol-agnostic request dispatch runtime.
//!
//! One set of named handlers — request/response procedures, lazy streams,
//! and fire-and-forget events — served simultaneously over HTTP, WebSocket,
//! JSON-RPC 2.0, TCP, and UDP, with a composable interceptor chain (rate
//! limiting, retries, circuit breaking, caching, auth, timeouts) and a
//! WebSocket channel layer with public/private/presence semantics.
//!
//! ```rust,no_run
//! use switchboard::{ProcedureOptions, Registry, Server, ServerConfig};
//! use serde_json::{Value, json};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut registry = Registry::new();
//! registry.register_procedure(
//!     "math.add",
//!     |payload: Value, _ctx| async move {
//!         let a = payload["a"].as_i64().unwrap_or(0);
//!         let b = payload["b"].as_i64().unwrap_or(0);
//!         Ok(json!({"sum": a + b}))
//!     },
//!     ProcedureOptions::default(),
//! )?;
//!
//! let server = Server::builder(ServerConfig::default())
//!     .registry(registry)
//!     .start()
//!     .await?;
//! println!("listening on {}", server.http_addr());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod server;

pub use config::{
    ConfigError, JsonRpcProtocolConfig, ServerConfig, TcpProtocolConfig, UdpProtocolConfig,
    WsProtocolConfig, load_config_from_path, load_config_from_str,
};
pub use server::{Server, ServerBuilder, ServerError};

pub use sb_adapters::{
    CorsConfig, HttpConfig, JsonRpcConfig, MulticastConfig, TcpAdapter, TcpConfig, UdpAdapter,
    UdpConfig, UdpRetryClient, WsConfig,
};
pub use sb_channels::{ChannelDefinition, ChannelKind, ChannelManager, ChannelRequest};
pub use sb_middleware as middleware;
pub use sb_core::{
    AuthContext, CancelToken, Context, DeliveryGuarantee, EventOptions, EventRetryPolicy,
    HandlerKind, Interceptor, MemoryStore, Next, Pattern, ProcedureOptions, Registry, Reply,
    Router, SharedRegistry, Store, StreamDirection, StreamOptions, StreamSink, Validator, compose,
    for_pattern,
};
pub use sb_protocol::{
    Envelope, ErrorCode, FieldError, FrameKind, JsonRpcRequest, JsonRpcResponse, RpcError,
};
