//! WebSocket adapter.
//!
//! Served as an upgrade route on the shared HTTP listener (default `/ws`),
//! so one port carries HTTP, JSON-RPC, SSE, and WebSocket traffic.  Frames
//! are JSON envelopes; request / stream:start / event frames go through the
//! router, subscribe / unsubscribe / publish frames go straight to the
//! channel manager.
//!
//! Each socket owns one outbound queue (registered with the channel
//! manager) feeding a single writer half, so RPC replies, stream frames,
//! and channel traffic interleave without tearing.  Socket close cancels
//! every in-flight context for that socket.  An optional heartbeat pings on
//! an interval; a missed pong closes the socket.

use crate::shutdown::Shutdown;
use axum::Router as AxumRouter;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::any;
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use sb_channels::ChannelManager;
use sb_core::{AuthContext, CancelToken, Context, Reply, Router};
use sb_protocol::{Envelope, ErrorCode, FrameKind, RpcError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_WS_PATH: &str = "/ws";

/// Authenticates a socket at upgrade time from the HTTP headers.  The
/// resulting auth context is what every channel authorization hook sees for
/// the socket's lifetime (no mid-session re-auth).
pub type ConnectAuthFn = Arc<dyn Fn(&HeaderMap) -> Option<AuthContext> + Send + Sync>;

#[derive(Clone)]
pub struct WsConfig {
    pub path: String,
    /// Ping interval; `None` disables the heartbeat.
    pub heartbeat_interval: Option<Duration>,
    /// Close the socket after this long without a pong.
    pub pong_timeout: Duration,
    pub connect_auth: Option<ConnectAuthFn>,
}

impl Default for WsConfig {
    fn default() -> Self {
        WsConfig {
            path: DEFAULT_WS_PATH.to_owned(),
            heartbeat_interval: None,
            pong_timeout: Duration::from_secs(30),
            connect_auth: None,
        }
    }
}

pub fn build_router(
    dispatch: Arc<Router>,
    channels: Arc<ChannelManager>,
    shutdown: Arc<Shutdown>,
    config: &WsConfig,
) -> AxumRouter {
    let config = config.clone();
    let path = config.path.clone();
    let handler = move |upgrade: WebSocketUpgrade, headers: HeaderMap| {
        let dispatch = dispatch.clone();
        let channels = channels.clone();
        let shutdown = shutdown.clone();
        let config = config.clone();
        async move { accept(upgrade, headers, dispatch, channels, shutdown, config) }
    };
    AxumRouter::new().route(&path, any(handler))
}

fn accept(
    upgrade: WebSocketUpgrade,
    headers: HeaderMap,
    dispatch: Arc<Router>,
    channels: Arc<ChannelManager>,
    shutdown: Arc<Shutdown>,
    config: WsConfig,
) -> Response {
    let auth = config
        .connect_auth
        .as_ref()
        .and_then(|hook| hook(&headers));
    upgrade.on_upgrade(move |socket| async move {
        let guard = shutdown.tracker().guard();
        serve_socket(socket, dispatch, channels, shutdown, config, auth).await;
        drop(guard);
    })
}

async fn serve_socket(
    socket: WebSocket,
    dispatch: Arc<Router>,
    channels: Arc<ChannelManager>,
    shutdown: Arc<Shutdown>,
    config: WsConfig,
    auth: Option<AuthContext>,
) {
    let socket_id = Uuid::new_v4().to_string();
    info!(socket_id = %socket_id, "websocket connected");

    let socket_cancel = shutdown.root_token().child();
    let mut socket_ctx = Context::new().with_cancellation(socket_cancel.clone());
    if let Some(auth) = auth {
        socket_ctx = socket_ctx.with_auth(auth);
    }

    let mut outbound = channels.register_socket(&socket_id);
    let Some(out_tx) = channels.socket_sender(&socket_id) else {
        return;
    };

    let (mut sink, mut frames) = socket.split();
    let mut stop = shutdown.subscribe();

    let mut heartbeat = tokio::time::interval(
        config
            .heartbeat_interval
            .unwrap_or(Duration::from_secs(3600)),
    );
    heartbeat.tick().await; // first tick fires immediately; skip it
    let mut awaiting_pong: Option<tokio::time::Instant> = None;

    loop {
        tokio::select! {
            biased;
            _ = stop.changed() => {
                if *stop.borrow() { break; }
            }
            _ = socket_cancel.cancelled() => break,
            outgoing = outbound.recv() => {
                match outgoing {
                    Some(envelope) => {
                        if send_envelope(&mut sink, &envelope).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = heartbeat.tick(), if config.heartbeat_interval.is_some() => {
                if let Some(since) = awaiting_pong {
                    if since.elapsed() >= config.pong_timeout {
                        warn!(socket_id = %socket_id, "pong timeout, closing socket");
                        break;
                    }
                }
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                if awaiting_pong.is_none() {
                    awaiting_pong = Some(tokio::time::Instant::now());
                }
            }
            incoming = frames.next() => {
                match incoming {
                    None | Some(Err(_)) => break,
                    Some(Ok(Message::Close(_))) => break,
                    Some(Ok(Message::Pong(_))) => {
                        awaiting_pong = None;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(
                            &text,
                            &socket_id,
                            &socket_ctx,
                            &dispatch,
                            &channels,
                            &out_tx,
                        )
                        .await;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    // Disconnect: cancel in-flight contexts, tear down channel membership.
    socket_cancel.cancel();
    channels.on_disconnect(&socket_id);
    info!(socket_id = %socket_id, "websocket disconnected");
}

async fn send_envelope(
    sink: &mut SplitSink<WebSocket, Message>,
    envelope: &Envelope,
) -> Result<(), axum::Error> {
    sink.send(Message::Text(envelope.to_json().into())).await
}

async fn handle_frame(
    text: &str,
    socket_id: &str,
    socket_ctx: &Context,
    dispatch: &Arc<Router>,
    channels: &Arc<ChannelManager>,
    out_tx: &mpsc::UnboundedSender<Envelope>,
) {
    let envelope = match Envelope::from_json_str(text) {
        Ok(envelope) => envelope,
        Err(err) => {
            debug!(socket_id, code = %err.code, "bad frame");
            let _ = out_tx.send(Envelope::error_frame(Uuid::new_v4().to_string(), &err));
            return;
        }
    };

    match envelope.kind {
        FrameKind::Subscribe => {
            let Some(channel) = envelope.channel.clone() else {
                channel_error(&envelope, out_tx, "subscribe frame missing 'channel'");
                return;
            };
            if let Err(err) = channels
                .subscribe(socket_id, &channel, &envelope.id, socket_ctx)
                .await
            {
                let _ = out_tx.send(Envelope::error_to(&envelope, &err));
            }
        }
        FrameKind::Unsubscribe => {
            let Some(channel) = envelope.channel.clone() else {
                channel_error(&envelope, out_tx, "unsubscribe frame missing 'channel'");
                return;
            };
            channels.unsubscribe(socket_id, &channel, &envelope.id);
        }
        FrameKind::Publish => {
            let (Some(channel), Some(event)) =
                (envelope.channel.clone(), envelope.event.clone())
            else {
                channel_error(&envelope, out_tx, "publish frame missing 'channel' or 'event'");
                return;
            };
            if let Err(err) = channels
                .publish(socket_id, &channel, &event, envelope.payload.clone(), socket_ctx)
                .await
            {
                let _ = out_tx.send(Envelope::error_to(&envelope, &err));
            }
        }
        FrameKind::Request | FrameKind::StreamStart | FrameKind::Event => {
            // Fresh context per request (own extensions), cancellation under
            // the socket's token so close cancels everything in flight, auth
            // inherited from the upgrade handshake.
            let mut ctx =
                Context::new().with_cancellation(socket_ctx.cancellation.child());
            ctx.auth = socket_ctx.auth.clone();
            let dispatch = dispatch.clone();
            let out_tx = out_tx.clone();
            tokio::spawn(async move {
                match dispatch.handle(envelope, &ctx).await {
                    Reply::Response(reply) => {
                        let _ = out_tx.send(reply);
                    }
                    Reply::Stream(mut rx) => {
                        while let Some(frame) = rx.recv().await {
                            if out_tx.send(frame).is_err() {
                                break;
                            }
                        }
                    }
                    Reply::None => {}
                }
            });
        }
        other => {
            let err = RpcError::new(
                ErrorCode::InvalidEnvelope,
                format!("frame kind '{}' is not accepted from clients", other.as_str()),
            );
            let _ = out_tx.send(Envelope::error_to(&envelope, &err));
        }
    }
}

fn channel_error(envelope: &Envelope, out_tx: &mpsc::UnboundedSender<Envelope>, message: &str) {
    let err = RpcError::new(ErrorCode::InvalidEnvelope, message);
    let _ = out_tx.send(Envelope::error_to(envelope, &err));
}
