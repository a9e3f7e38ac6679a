//! Protocol adapters: translators between wire formats and envelopes.
//!
//! Each adapter owns its listener, a per-connection/session pool, per-session
//! cancellation wiring, and the parse/encode functions for one wire format.
//! HTTP, WebSocket, and JSON-RPC share one axum listener (the WebSocket
//! endpoint is an upgrade route, not an auxiliary port); TCP and UDP bind
//! their own sockets.

pub mod http;
pub mod jsonrpc;
pub mod shutdown;
pub mod tcp;
pub mod udp;
pub mod ws;

pub use http::{CorsConfig, HttpConfig};
pub use jsonrpc::{DEFAULT_RPC_PATH, JsonRpcConfig};
pub use shutdown::{ConnectionTracker, Shutdown};
pub use tcp::{TcpAdapter, TcpConfig, encode_frame};
pub use udp::{DEFAULT_MAX_DATAGRAM, MulticastConfig, UdpAdapter, UdpConfig, UdpRetryClient};
pub use ws::{ConnectAuthFn, DEFAULT_WS_PATH, WsConfig};
