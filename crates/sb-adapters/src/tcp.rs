//! TCP adapter: length-prefixed JSON envelopes over persistent sockets.
//!
//! Frame = 4-byte big-endian length N, then N bytes UTF-8 JSON envelope.
//! Multiple requests may be in flight concurrently on one connection;
//! replies are correlated by envelope id and interleave freely, including
//! stream frames.  A single writer task per connection serializes the wire.

use crate::shutdown::Shutdown;
use futures_util::{SinkExt, StreamExt};
use sb_core::{Context, Reply, Router};
use sb_protocol::Envelope;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct TcpConfig {
    pub bind: String,
    /// Reject frames longer than this (bytes of JSON, excluding the prefix).
    pub max_frame_bytes: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        TcpConfig {
            bind: "127.0.0.1:0".to_owned(),
            max_frame_bytes: 1024 * 1024,
        }
    }
}

pub struct TcpAdapter {
    local_addr: SocketAddr,
    shutdown: Arc<Shutdown>,
}

impl TcpAdapter {
    /// Bind and start serving.  Runs until [`TcpAdapter::shutdown`].
    pub async fn bind(config: TcpConfig, router: Arc<Router>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(&config.bind).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "tcp adapter listening");

        let shutdown = Arc::new(Shutdown::new());
        let accept_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut stop = accept_shutdown.subscribe();
            loop {
                tokio::select! {
                    biased;
                    _ = stop.changed() => {
                        if *stop.borrow() { break; }
                    }
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                debug!(%peer, "tcp connection accepted");
                                let guard = accept_shutdown.tracker().guard();
                                let conn_cancel = accept_shutdown.root_token().child();
                                let router = router.clone();
                                let max = config.max_frame_bytes;
                                tokio::spawn(async move {
                                    let _guard = guard;
                                    serve_connection(stream, router, conn_cancel, max).await;
                                });
                            }
                            Err(e) => {
                                warn!(error = %e, "tcp accept failed");
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok(TcpAdapter {
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

/// Drive one connection: reader dispatches frames, a single writer task owns
/// the sink so interleaved replies stay frame-atomic.
async fn serve_connection(
    stream: TcpStream,
    router: Arc<Router>,
    conn_cancel: sb_core::CancelToken,
    max_frame_bytes: usize,
) {
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_bytes)
        .new_codec();
    let framed = Framed::new(stream, codec);
    let (mut sink, mut frames) = framed.split();

    let (out_tx, mut out_rx) = mpsc::channel::<Envelope>(64);
    let writer = tokio::spawn(async move {
        while let Some(envelope) = out_rx.recv().await {
            let bytes = bytes::Bytes::from(envelope.to_json().into_bytes());
            if sink.send(bytes).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            biased;
            _ = conn_cancel.cancelled() => break,
            frame = frames.next() => {
                match frame {
                    None => break,
                    Some(Err(e)) => {
                        warn!(error = %e, "tcp frame error");
                        break;
                    }
                    Some(Ok(raw)) => {
                        match Envelope::from_json_bytes(&raw) {
                            Ok(envelope) => {
                                let router = router.clone();
                                let out_tx = out_tx.clone();
                                let ctx = Context::new()
                                    .with_cancellation(conn_cancel.child());
                                tokio::spawn(async move {
                                    dispatch(router, envelope, ctx, out_tx).await;
                                });
                            }
                            Err(err) => {
                                let _ = out_tx
                                    .send(Envelope::error_frame(uuid::Uuid::new_v4().to_string(), &err))
                                    .await;
                            }
                        }
                    }
                }
            }
        }
    }

    // Reader done: drop our sender so the writer drains and exits, then
    // cancel anything still in flight on this connection.
    conn_cancel.cancel();
    drop(out_tx);
    let _ = writer.await;
}

async fn dispatch(
    router: Arc<Router>,
    envelope: Envelope,
    ctx: Context,
    out_tx: mpsc::Sender<Envelope>,
) {
    match router.handle(envelope, &ctx).await {
        Reply::Response(reply) => {
            let _ = out_tx.send(reply).await;
        }
        Reply::Stream(mut rx) => {
            while let Some(frame) = rx.recv().await {
                if out_tx.send(frame).await.is_err() {
                    break;
                }
            }
        }
        Reply::None => {}
    }
}

/// Encode one envelope as a length-prefixed frame (client-side helper).
pub fn encode_frame(envelope: &Envelope) -> Vec<u8> {
    let json = envelope.to_json().into_bytes();
    let mut frame = Vec::with_capacity(4 + json.len());
    frame.extend_from_slice(&(json.len() as u32).to_be_bytes());
    frame.extend_from_slice(&json);
    frame
}
