//! UDP adapter: one datagram = one UTF-8 JSON envelope.
//!
//! Fire-and-forget by default.  In ACK mode the server replies
//! `{id: "<origId>:ack", type: "ack"}` once the envelope has been handed to
//! the router, so retrying senders can stop.  Multicast groups can be
//! joined with configurable TTL and loopback.
//!
//! Datagrams larger than `max_datagram_size` are dropped with a warning;
//! malformed payloads get a `PARSE_ERROR` reply when a return address is
//! usable.

use crate::shutdown::Shutdown;
use sb_core::{Context, Reply, Router};
use sb_protocol::{Envelope, FrameKind, strip_ack_suffix};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_DATAGRAM: usize = 65_507;

#[derive(Debug, Clone)]
pub struct MulticastConfig {
    pub group: Ipv4Addr,
    pub interface: Ipv4Addr,
    pub ttl: u32,
    pub loopback: bool,
}

#[derive(Debug, Clone)]
pub struct UdpConfig {
    pub bind: String,
    pub max_datagram_size: usize,
    /// Reply with an ack envelope after accepting each datagram.
    pub ack_mode: bool,
    pub multicast: Option<MulticastConfig>,
}

impl Default for UdpConfig {
    fn default() -> Self {
        UdpConfig {
            bind: "127.0.0.1:0".to_owned(),
            max_datagram_size: DEFAULT_MAX_DATAGRAM,
            ack_mode: false,
            multicast: None,
        }
    }
}

pub struct UdpAdapter {
    local_addr: SocketAddr,
    shutdown: Arc<Shutdown>,
}

impl UdpAdapter {
    pub async fn bind(config: UdpConfig, router: Arc<Router>) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(&config.bind).await?;
        if let Some(mc) = &config.multicast {
            socket.join_multicast_v4(mc.group, mc.interface)?;
            socket.set_multicast_ttl_v4(mc.ttl)?;
            socket.set_multicast_loop_v4(mc.loopback)?;
            info!(group = %mc.group, "joined multicast group");
        }
        let local_addr = socket.local_addr()?;
        info!(%local_addr, ack_mode = config.ack_mode, "udp adapter listening");

        let socket = Arc::new(socket);
        let shutdown = Arc::new(Shutdown::new());
        let loop_shutdown = shutdown.clone();
        let loop_socket = socket.clone();
        tokio::spawn(async move {
            let mut stop = loop_shutdown.subscribe();
            let mut buf = vec![0u8; config.max_datagram_size];
            loop {
                tokio::select! {
                    biased;
                    _ = stop.changed() => {
                        if *stop.borrow() { break; }
                    }
                    received = loop_socket.recv_from(&mut buf) => {
                        match received {
                            Ok((len, peer)) => {
                                if len >= config.max_datagram_size {
                                    warn!(%peer, len, "datagram at/over size cap dropped");
                                    continue;
                                }
                                let raw = buf[..len].to_vec();
                                let guard = loop_shutdown.tracker().guard();
                                let ctx = Context::new()
                                    .with_cancellation(loop_shutdown.root_token().child());
                                let router = router.clone();
                                let socket = loop_socket.clone();
                                let ack_mode = config.ack_mode;
                                tokio::spawn(async move {
                                    let _guard = guard;
                                    handle_datagram(&raw, peer, router, ctx, socket, ack_mode).await;
                                });
                            }
                            Err(e) => {
                                warn!(error = %e, "udp recv failed");
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok(UdpAdapter {
            local_addr,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn shutdown(&self, drain_deadline: Duration) -> bool {
        self.shutdown.shutdown(drain_deadline).await
    }
}

async fn handle_datagram(
    raw: &[u8],
    peer: SocketAddr,
    router: Arc<Router>,
    ctx: Context,
    socket: Arc<UdpSocket>,
    ack_mode: bool,
) {
    let envelope = match Envelope::from_json_bytes(raw) {
        Ok(envelope) => envelope,
        Err(err) => {
            debug!(%peer, code = %err.code, "bad datagram");
            let reply = Envelope::error_frame(uuid::Uuid::new_v4().to_string(), &err);
            let _ = socket.send_to(reply.to_json().as_bytes(), peer).await;
            return;
        }
    };

    if ack_mode {
        let ack = Envelope::ack_to(&envelope);
        let _ = socket.send_to(ack.to_json().as_bytes(), peer).await;
    }

    match router.handle(envelope, &ctx).await {
        Reply::Response(reply) => {
            let _ = socket.send_to(reply.to_json().as_bytes(), peer).await;
        }
        Reply::Stream(mut rx) => {
            // Each stream frame rides in its own datagram.
            while let Some(frame) = rx.recv().await {
                if socket
                    .send_to(frame.to_json().as_bytes(), peer)
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
        Reply::None => {}
    }
}

// ---------------------------------------------------------------------------
// Send-with-retry client
// ---------------------------------------------------------------------------

/// A small client for ACK-mode servers: sends a datagram repeatedly until
/// the matching `<id>:ack` arrives or attempts run out.  Pending sends live
/// in a guarded map keyed by envelope id; entries are removed on resolution
/// or timeout.
pub struct UdpRetryClient {
    socket: Arc<UdpSocket>,
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<()>>>>,
}

impl UdpRetryClient {
    pub async fn bind() -> std::io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
        let pending: Arc<Mutex<HashMap<String, oneshot::Sender<()>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let recv_socket = socket.clone();
        let recv_pending = pending.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; DEFAULT_MAX_DATAGRAM];
            while let Ok((len, _peer)) = recv_socket.recv_from(&mut buf).await {
                let Ok(envelope) = Envelope::from_json_bytes(&buf[..len]) else {
                    continue;
                };
                if envelope.kind != FrameKind::Ack {
                    continue;
                }
                if let Some(origin) = strip_ack_suffix(&envelope.id) {
                    let waiter = recv_pending
                        .lock()
                        .expect("pending lock poisoned")
                        .remove(origin);
                    if let Some(tx) = waiter {
                        let _ = tx.send(());
                    }
                }
            }
        });

        Ok(UdpRetryClient { socket, pending })
    }

    /// Send `envelope` to `target`, retrying every `interval` until acked.
    /// Returns false if all attempts went unacknowledged.
    pub async fn send_with_retry(
        &self,
        envelope: &Envelope,
        target: SocketAddr,
        attempts: u32,
        interval: Duration,
    ) -> std::io::Result<bool> {
        let (tx, mut rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(envelope.id.clone(), tx);
        let payload = envelope.to_json();

        for _ in 0..attempts.max(1) {
            self.socket.send_to(payload.as_bytes(), target).await?;
            tokio::select! {
                _ = &mut rx => return Ok(true),
                () = tokio::time::sleep(interval) => {}
            }
        }
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .remove(&envelope.id);
        Ok(false)
    }
}
