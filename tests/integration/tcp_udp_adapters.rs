//! TCP and UDP adapters end-to-end: framing, id correlation under
//! concurrency, interleaved stream frames, parse errors, ACK mode, and
//! send-with-retry.

use sb_test_utils::{free_port, read_frame, write_frame};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use switchboard::{
    Context, Envelope, ErrorCode, EventOptions, FrameKind, ProcedureOptions, Registry, Router,
    SharedRegistry, StreamOptions, StreamSink, TcpAdapter, TcpConfig, UdpAdapter, UdpConfig,
    UdpRetryClient,
};

fn build_router(event_hits: Arc<AtomicU32>) -> Arc<Router> {
    let mut registry = Registry::new();
    registry
        .register_procedure(
            "echo",
            |payload: Value, _ctx| async move { Ok(payload) },
            ProcedureOptions::default(),
        )
        .unwrap();
    registry
        .register_procedure(
            "slow.echo",
            |payload: Value, _ctx: Context| async move {
                let delay = payload["delay_ms"].as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(payload)
            },
            ProcedureOptions::default(),
        )
        .unwrap();
    registry
        .register_stream(
            "count.to",
            |payload: Value, _ctx, sink: StreamSink| async move {
                let n = payload["n"].as_i64().unwrap_or(0);
                for v in 1..=n {
                    sink.send(json!({"v": v})).await?;
                }
                Ok(())
            },
            StreamOptions::default(),
        )
        .unwrap();
    registry
        .register_event(
            "telemetry.ping",
            move |_p, _ctx| {
                let hits = event_hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            EventOptions::default(),
        )
        .unwrap();
    Arc::new(Router::new(Arc::new(SharedRegistry::new(registry))))
}

// ---------------------------------------------------------------------------
// TCP
// ---------------------------------------------------------------------------

#[tokio::test]
async fn tcp_request_response_round_trip() {
    let router = build_router(Arc::new(AtomicU32::new(0)));
    let adapter = TcpAdapter::bind(TcpConfig::default(), router).await.unwrap();

    let mut stream = tokio::net::TcpStream::connect(adapter.local_addr())
        .await
        .unwrap();
    let request = Envelope::request_with_id("t1", "echo", json!({"hello": "tcp"}));
    write_frame(&mut stream, &request).await.unwrap();

    let reply = read_frame(&mut stream).await.unwrap();
    assert_eq!(reply.kind, FrameKind::Response);
    assert_eq!(reply.id, "t1");
    assert_eq!(reply.payload, json!({"hello": "tcp"}));

    adapter.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn tcp_concurrent_requests_correlate_by_id() {
    let router = build_router(Arc::new(AtomicU32::new(0)));
    let adapter = TcpAdapter::bind(TcpConfig::default(), router).await.unwrap();

    let mut stream = tokio::net::TcpStream::connect(adapter.local_addr())
        .await
        .unwrap();
    // Slow request first, fast request second; the fast reply must win.
    let slow = Envelope::request_with_id("slow", "slow.echo", json!({"delay_ms": 200}));
    let fast = Envelope::request_with_id("fast", "echo", json!({"x": 1}));
    write_frame(&mut stream, &slow).await.unwrap();
    write_frame(&mut stream, &fast).await.unwrap();

    let first = read_frame(&mut stream).await.unwrap();
    let second = read_frame(&mut stream).await.unwrap();
    assert_eq!(first.id, "fast");
    assert_eq!(second.id, "slow");

    adapter.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn tcp_stream_frames_interleave_on_one_connection() {
    let router = build_router(Arc::new(AtomicU32::new(0)));
    let adapter = TcpAdapter::bind(TcpConfig::default(), router).await.unwrap();

    let mut stream = tokio::net::TcpStream::connect(adapter.local_addr())
        .await
        .unwrap();
    let request = Envelope {
        id: "st1".to_owned(),
        procedure: "count.to".to_owned(),
        kind: FrameKind::StreamStart,
        payload: json!({"n": 3}),
        metadata: Default::default(),
        channel: None,
        event: None,
    };
    write_frame(&mut stream, &request).await.unwrap();

    let mut kinds = Vec::new();
    loop {
        let frame = read_frame(&mut stream).await.unwrap();
        assert_eq!(frame.id, "st1");
        kinds.push(frame.kind);
        if matches!(frame.kind, FrameKind::StreamEnd | FrameKind::StreamError) {
            break;
        }
    }
    assert_eq!(
        kinds,
        vec![
            FrameKind::StreamStart,
            FrameKind::StreamData,
            FrameKind::StreamData,
            FrameKind::StreamData,
            FrameKind::StreamEnd,
        ]
    );

    adapter.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn tcp_malformed_frame_gets_parse_error() {
    let router = build_router(Arc::new(AtomicU32::new(0)));
    let adapter = TcpAdapter::bind(TcpConfig::default(), router).await.unwrap();

    let mut stream = tokio::net::TcpStream::connect(adapter.local_addr())
        .await
        .unwrap();
    use tokio::io::AsyncWriteExt;
    let garbage = b"{not json";
    stream
        .write_all(&(garbage.len() as u32).to_be_bytes())
        .await
        .unwrap();
    stream.write_all(garbage).await.unwrap();

    let reply = read_frame(&mut stream).await.unwrap();
    assert_eq!(reply.kind, FrameKind::Error);
    assert_eq!(reply.as_error().unwrap().code, ErrorCode::ParseError);

    adapter.shutdown(Duration::from_secs(1)).await;
}

// ---------------------------------------------------------------------------
// UDP
// ---------------------------------------------------------------------------

#[tokio::test]
async fn udp_request_gets_response_datagram() {
    let router = build_router(Arc::new(AtomicU32::new(0)));
    let adapter = UdpAdapter::bind(UdpConfig::default(), router).await.unwrap();

    let client = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let request = Envelope::request_with_id("u1", "echo", json!({"via": "udp"}));
    client
        .send_to(request.to_json().as_bytes(), adapter.local_addr())
        .await
        .unwrap();

    let mut buf = vec![0u8; 65_507];
    let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
        .await
        .expect("response datagram")
        .unwrap();
    let reply = Envelope::from_json_bytes(&buf[..len]).unwrap();
    assert_eq!(reply.id, "u1");
    assert_eq!(reply.payload, json!({"via": "udp"}));

    adapter.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn udp_event_is_fire_and_forget_without_ack_mode() {
    let hits = Arc::new(AtomicU32::new(0));
    let router = build_router(hits.clone());
    let adapter = UdpAdapter::bind(UdpConfig::default(), router).await.unwrap();

    let client = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let event = Envelope::event("telemetry.ping", json!({"seq": 1}));
    client
        .send_to(event.to_json().as_bytes(), adapter.local_addr())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let mut buf = vec![0u8; 1024];
    let got = tokio::time::timeout(Duration::from_millis(100), client.recv_from(&mut buf)).await;
    assert!(got.is_err(), "no reply datagram without ack mode");

    adapter.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn udp_ack_mode_acknowledges_and_retry_client_stops() {
    let hits = Arc::new(AtomicU32::new(0));
    let router = build_router(hits.clone());
    let config = UdpConfig {
        ack_mode: true,
        ..UdpConfig::default()
    };
    let adapter = UdpAdapter::bind(config, router).await.unwrap();

    let client = UdpRetryClient::bind().await.unwrap();
    let mut event = Envelope::event("telemetry.ping", json!({"seq": 2}));
    event.id = "evt-ack-1".to_owned();
    let acked = client
        .send_with_retry(
            &event,
            adapter.local_addr(),
            5,
            Duration::from_millis(100),
        )
        .await
        .unwrap();
    assert!(acked, "ack must arrive");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1, "dispatched once despite retry loop");

    adapter.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn udp_retry_client_gives_up_without_server() {
    let client = UdpRetryClient::bind().await.unwrap();
    let port = free_port().await;
    let target: std::net::SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
    let event = Envelope::event("telemetry.ping", json!({}));
    let acked = client
        .send_with_retry(&event, target, 2, Duration::from_millis(20))
        .await
        .unwrap();
    assert!(!acked);
}

#[tokio::test]
async fn udp_malformed_datagram_gets_parse_error_reply() {
    let router = build_router(Arc::new(AtomicU32::new(0)));
    let adapter = UdpAdapter::bind(UdpConfig::default(), router).await.unwrap();

    let client = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(b"%%%", adapter.local_addr())
        .await
        .unwrap();

    let mut buf = vec![0u8; 4096];
    let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
        .await
        .expect("error reply datagram")
        .unwrap();
    let reply = Envelope::from_json_bytes(&buf[..len]).unwrap();
    assert_eq!(reply.as_error().unwrap().code, ErrorCode::ParseError);

    adapter.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn udp_missing_fields_get_invalid_envelope() {
    let router = build_router(Arc::new(AtomicU32::new(0)));
    let adapter = UdpAdapter::bind(UdpConfig::default(), router).await.unwrap();

    let client = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(br#"{"procedure": "echo"}"#, adapter.local_addr())
        .await
        .unwrap();

    let mut buf = vec![0u8; 4096];
    let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
        .await
        .expect("error reply datagram")
        .unwrap();
    let reply = Envelope::from_json_bytes(&buf[..len]).unwrap();
    assert_eq!(reply.as_error().unwrap().code, ErrorCode::InvalidEnvelope);

    adapter.shutdown(Duration::from_secs(1)).await;
}
