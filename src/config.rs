//! Server configuration loading.
//!
//! TOML is the config source; hosts may also build [`ServerConfig`]
//! literally.  Environment variable handling is left to the host program.
//!
//! # Layout
//! ```toml
//! host = "127.0.0.1"
//! port = 8080
//! base_path = "/api"
//!
//! [cors]
//! allowed_origins = ["https://app.example.com"]
//!
//! [websocket]
//! enabled = true
//! path = "/ws"
//! heartbeat_ms = 30000
//!
//! [jsonrpc]
//! enabled = true
//! path = "/rpc"
//!
//! [tcp]
//! enabled = true
//! port = 9000
//!
//! [udp]
//! enabled = true
//! port = 9001
//! ack_mode = true
//! ```

use sb_adapters::{CorsConfig, HttpConfig, JsonRpcConfig, TcpConfig, UdpConfig, WsConfig};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Validated config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Prefix for every HTTP route ("" = mounted at root).
    pub base_path: String,
    pub cors: Option<CorsConfig>,
    pub websocket: WsProtocolConfig,
    pub jsonrpc: JsonRpcProtocolConfig,
    pub tcp: TcpProtocolConfig,
    pub udp: UdpProtocolConfig,
    /// How long graceful shutdown waits for in-flight work.
    pub drain_deadline: Duration,
}

#[derive(Debug, Clone)]
pub struct WsProtocolConfig {
    pub enabled: bool,
    pub path: String,
    pub heartbeat: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct JsonRpcProtocolConfig {
    pub enabled: bool,
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct TcpProtocolConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub max_frame_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct UdpProtocolConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub max_datagram_size: usize,
    pub ack_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "127.0.0.1".to_owned(),
            port: 0,
            base_path: String::new(),
            cors: None,
            websocket: WsProtocolConfig {
                enabled: true,
                path: sb_adapters::DEFAULT_WS_PATH.to_owned(),
                heartbeat: None,
            },
            jsonrpc: JsonRpcProtocolConfig {
                enabled: true,
                path: sb_adapters::DEFAULT_RPC_PATH.to_owned(),
            },
            tcp: TcpProtocolConfig {
                enabled: false,
                host: "127.0.0.1".to_owned(),
                port: 0,
                max_frame_bytes: 1024 * 1024,
            },
            udp: UdpProtocolConfig {
                enabled: false,
                host: "127.0.0.1".to_owned(),
                port: 0,
                max_datagram_size: sb_adapters::DEFAULT_MAX_DATAGRAM,
                ack_mode: false,
            },
            drain_deadline: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    pub fn http_bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub(crate) fn http_config(&self) -> HttpConfig {
        HttpConfig {
            cors: self.cors.clone(),
        }
    }

    pub(crate) fn ws_config(&self) -> WsConfig {
        WsConfig {
            path: self.websocket.path.clone(),
            heartbeat_interval: self.websocket.heartbeat,
            ..WsConfig::default()
        }
    }

    pub(crate) fn jsonrpc_config(&self) -> JsonRpcConfig {
        JsonRpcConfig {
            path: self.jsonrpc.path.clone(),
        }
    }

    pub(crate) fn tcp_config(&self) -> TcpConfig {
        TcpConfig {
            bind: format!("{}:{}", self.tcp.host, self.tcp.port),
            max_frame_bytes: self.tcp.max_frame_bytes,
        }
    }

    pub(crate) fn udp_config(&self) -> UdpConfig {
        UdpConfig {
            bind: format!("{}:{}", self.udp.host, self.udp.port),
            max_datagram_size: self.udp.max_datagram_size,
            ack_mode: self.udp.ack_mode,
            multicast: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (Option for every optional field)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    host: Option<String>,
    port: Option<u16>,
    base_path: Option<String>,
    drain_deadline_ms: Option<u64>,
    cors: Option<RawCorsConfig>,
    websocket: Option<RawWsConfig>,
    jsonrpc: Option<RawJsonRpcConfig>,
    tcp: Option<RawTcpConfig>,
    udp: Option<RawUdpConfig>,
}

#[derive(Debug, Deserialize)]
struct RawCorsConfig {
    allowed_origins: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct RawWsConfig {
    enabled: Option<bool>,
    path: Option<String>,
    heartbeat_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawJsonRpcConfig {
    enabled: Option<bool>,
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawTcpConfig {
    enabled: Option<bool>,
    host: Option<String>,
    port: Option<u16>,
    max_frame_bytes: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawUdpConfig {
    enabled: Option<bool>,
    host: Option<String>,
    port: Option<u16>,
    max_datagram_size: Option<usize>,
    ack_mode: Option<bool>,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config file: {0}")]
    Io(String),
    #[error("parsing config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

pub fn load_config_from_path(path: &Path) -> Result<ServerConfig, ConfigError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("'{}': {}", path.display(), e)))?;
    load_config_from_str(&text)
}

pub fn load_config_from_str(text: &str) -> Result<ServerConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
    let defaults = ServerConfig::default();

    let base_path = raw.base_path.unwrap_or_default();
    if !base_path.is_empty() && !base_path.starts_with('/') {
        return Err(ConfigError::Invalid(format!(
            "base_path must start with '/', got '{base_path}'"
        )));
    }

    let websocket = match raw.websocket {
        Some(ws) => WsProtocolConfig {
            enabled: ws.enabled.unwrap_or(true),
            path: ws.path.unwrap_or(defaults.websocket.path.clone()),
            // 0 disables the heartbeat rather than pinging in a hot loop.
            heartbeat: ws
                .heartbeat_ms
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
        },
        None => defaults.websocket.clone(),
    };
    let jsonrpc = match raw.jsonrpc {
        Some(rpc) => JsonRpcProtocolConfig {
            enabled: rpc.enabled.unwrap_or(true),
            path: rpc.path.unwrap_or(defaults.jsonrpc.path.clone()),
        },
        None => defaults.jsonrpc.clone(),
    };
    let tcp = match raw.tcp {
        Some(tcp) => TcpProtocolConfig {
            enabled: tcp.enabled.unwrap_or(true),
            host: tcp.host.unwrap_or_else(|| "127.0.0.1".to_owned()),
            port: tcp.port.unwrap_or(0),
            max_frame_bytes: tcp.max_frame_bytes.unwrap_or(defaults.tcp.max_frame_bytes),
        },
        None => defaults.tcp.clone(),
    };
    let udp = match raw.udp {
        Some(udp) => UdpProtocolConfig {
            enabled: udp.enabled.unwrap_or(true),
            host: udp.host.unwrap_or_else(|| "127.0.0.1".to_owned()),
            port: udp.port.unwrap_or(0),
            max_datagram_size: udp
                .max_datagram_size
                .unwrap_or(defaults.udp.max_datagram_size),
            ack_mode: udp.ack_mode.unwrap_or(false),
        },
        None => defaults.udp.clone(),
    };

    Ok(ServerConfig {
        host: raw.host.unwrap_or(defaults.host),
        port: raw.port.unwrap_or(defaults.port),
        base_path,
        cors: raw.cors.map(|c| CorsConfig {
            allowed_origins: c.allowed_origins.unwrap_or_default(),
        }),
        websocket,
        jsonrpc,
        tcp,
        udp,
        drain_deadline: raw
            .drain_deadline_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.drain_deadline),
    })
}
