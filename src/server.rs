//! Server orchestrator.
//!
//! Wires one shared registry + router + channel manager into the enabled
//! protocol adapters and owns their lifecycle.  HTTP, JSON-RPC, SSE, and
//! WebSocket share a single listener; TCP and UDP bind their own sockets
//! when enabled.
//!
//! Graceful shutdown: every listener stops accepting, every in-flight
//! context is cancelled, and the server waits for work to drain up to the
//! configured deadline before force-closing.

use crate::config::ServerConfig;
use sb_adapters::{Shutdown, TcpAdapter, UdpAdapter, http, jsonrpc, ws};
use sb_channels::{ChannelDefinition, ChannelManager};
use sb_core::{Interceptor, Registry, Router, SharedRegistry};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("bind failed: {0}")]
    Bind(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct ServerBuilder {
    config: ServerConfig,
    registry: Registry,
    channels: Vec<ChannelDefinition>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    ws_auth: Option<ws::ConnectAuthFn>,
    event_dedup_store: Option<Arc<dyn sb_core::Store>>,
}

impl ServerBuilder {
    pub fn new(config: ServerConfig) -> Self {
        ServerBuilder {
            config,
            registry: Registry::new(),
            channels: Vec::new(),
            interceptors: Vec::new(),
            ws_auth: None,
            event_dedup_store: None,
        }
    }

    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    pub fn channel(mut self, definition: ChannelDefinition) -> Self {
        self.channels.push(definition);
        self
    }

    /// Add a global interceptor; global interceptors run outermost.
    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Authenticate WebSocket connections at upgrade time.
    pub fn ws_connect_auth(mut self, hook: ws::ConnectAuthFn) -> Self {
        self.ws_auth = Some(hook);
        self
    }

    /// Backend for the router's event deduplication table (defaults to an
    /// in-memory store).
    pub fn event_dedup_store(mut self, store: Arc<dyn sb_core::Store>) -> Self {
        self.event_dedup_store = Some(store);
        self
    }

    pub async fn start(self) -> Result<Server, ServerError> {
        let ServerBuilder {
            config,
            registry,
            channels,
            interceptors,
            ws_auth,
            event_dedup_store,
        } = self;

        let shared = Arc::new(SharedRegistry::new(registry));
        let mut router_builder = Router::builder(shared.clone());
        for interceptor in interceptors {
            router_builder = router_builder.interceptor(interceptor);
        }
        if let Some(store) = event_dedup_store {
            router_builder = router_builder.event_dedup_store(store);
        }
        let router = Arc::new(router_builder.build());
        let channel_manager = Arc::new(ChannelManager::new(channels));

        // HTTP listener shared by plain HTTP, SSE, JSON-RPC, and WebSocket.
        let http_shutdown = Arc::new(Shutdown::new());
        let mut app = http::build_router(router.clone(), http_shutdown.clone(), &config.http_config());
        if config.jsonrpc.enabled {
            app = app.merge(jsonrpc::build_router(
                router.clone(),
                http_shutdown.clone(),
                &config.jsonrpc_config(),
            ));
        }
        if config.websocket.enabled {
            let mut ws_config = config.ws_config();
            ws_config.connect_auth = ws_auth;
            app = app.merge(ws::build_router(
                router.clone(),
                channel_manager.clone(),
                http_shutdown.clone(),
                &ws_config,
            ));
        }
        if !config.base_path.is_empty() {
            app = axum::Router::new().nest(&config.base_path, app);
        }

        let listener = tokio::net::TcpListener::bind(config.http_bind()).await?;
        let http_addr = listener.local_addr()?;
        info!(%http_addr, "http listener bound");

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let serve_task = tokio::spawn(async move {
            let shutdown_signal = async move {
                // Serve until told to stop.
                while stop_rx.changed().await.is_ok() {
                    if *stop_rx.borrow() {
                        break;
                    }
                }
            };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal)
                .await
            {
                tracing::error!(error = %e, "http server error");
            }
        });

        let tcp = if config.tcp.enabled {
            let adapter = TcpAdapter::bind(config.tcp_config(), router.clone()).await?;
            Some(adapter)
        } else {
            None
        };
        let udp = if config.udp.enabled {
            let adapter = UdpAdapter::bind(config.udp_config(), router.clone()).await?;
            Some(adapter)
        } else {
            None
        };

        Ok(Server {
            config,
            registry: shared,
            router,
            channels: channel_manager,
            http_addr,
            http_shutdown,
            http_stop: stop_tx,
            serve_task: Some(serve_task),
            tcp,
            udp,
        })
    }
}

// ---------------------------------------------------------------------------
// Running server handle
// ---------------------------------------------------------------------------

pub struct Server {
    config: ServerConfig,
    registry: Arc<SharedRegistry>,
    router: Arc<Router>,
    channels: Arc<ChannelManager>,
    http_addr: SocketAddr,
    http_shutdown: Arc<Shutdown>,
    http_stop: watch::Sender<bool>,
    serve_task: Option<tokio::task::JoinHandle<()>>,
    tcp: Option<TcpAdapter>,
    udp: Option<UdpAdapter>,
}

impl Server {
    pub fn builder(config: ServerConfig) -> ServerBuilder {
        ServerBuilder::new(config)
    }

    /// Address of the shared HTTP/WS/JSON-RPC listener.
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp.as_ref().map(TcpAdapter::local_addr)
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp.as_ref().map(UdpAdapter::local_addr)
    }

    pub fn router(&self) -> Arc<Router> {
        self.router.clone()
    }

    pub fn channels(&self) -> Arc<ChannelManager> {
        self.channels.clone()
    }

    /// Hot reload: atomically replace the registry.  New requests see the
    /// new registry in full; in-flight requests finish against the snapshot
    /// they started with.
    pub fn swap_registry(&self, registry: Registry) {
        self.registry.swap(registry);
        info!("registry swapped");
    }

    /// Graceful shutdown: stop accepting everywhere, cancel in-flight
    /// contexts, wait for drain up to the configured deadline.
    pub async fn shutdown(mut self) {
        let deadline = self.config.drain_deadline;
        let _ = self.http_stop.send(true);

        let drained = self.http_shutdown.shutdown(deadline).await;
        if !drained {
            tracing::warn!("http requests still in flight at drain deadline");
        }
        if let Some(tcp) = &self.tcp {
            if !tcp.shutdown(deadline).await {
                tracing::warn!("tcp connections still open at drain deadline");
            }
        }
        if let Some(udp) = &self.udp {
            let _ = udp.shutdown(deadline).await;
        }
        if let Some(task) = self.serve_task.take() {
            let _ = task.await;
        }
        info!("server stopped");
    }
}
