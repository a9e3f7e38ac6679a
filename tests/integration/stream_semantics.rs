//! Stream contracts: frame ordering, exactly-one terminal frame,
//! cancellation behavior, and bounded-channel backpressure.

use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use switchboard::{
    Context, Envelope, ErrorCode, FrameKind, Registry, Reply, Router, RpcError, SharedRegistry,
    StreamOptions, StreamSink,
};

fn router_with_stream<F, Fut>(name: &str, handler: F) -> Router
where
    F: Fn(Value, Context, StreamSink) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), RpcError>> + Send + 'static,
{
    let mut registry = Registry::new();
    registry
        .register_stream(name, handler, StreamOptions::default())
        .unwrap();
    Router::new(Arc::new(SharedRegistry::new(registry)))
}

async fn collect(reply: Reply) -> Vec<Envelope> {
    let Reply::Stream(mut rx) = reply else {
        panic!("expected a stream reply");
    };
    let mut frames = Vec::new();
    while let Some(frame) = rx.recv().await {
        frames.push(frame);
    }
    frames
}

#[tokio::test]
async fn stream_of_three_emits_ordered_frames_sharing_the_id() {
    let router = router_with_stream("counter", |_p, _ctx, sink: StreamSink| async move {
        for v in 1..=3 {
            sink.send(json!({"v": v})).await?;
        }
        Ok(())
    });

    let env = Envelope::stream_request("counter", Value::Null);
    let origin = env.id.clone();
    let frames = collect(router.handle(env, &Context::new()).await).await;

    let kinds: Vec<FrameKind> = frames.iter().map(|f| f.kind).collect();
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
    for frame in &frames {
        assert_eq!(frame.id, origin);
    }
    assert_eq!(frames[1].payload, json!({"v": 1}));
    assert_eq!(frames[2].payload, json!({"v": 2}));
    assert_eq!(frames[3].payload, json!({"v": 3}));
}

#[tokio::test]
async fn handler_failure_terminates_with_exactly_one_stream_error() {
    let router = router_with_stream("flaky", |_p, _ctx, sink: StreamSink| async move {
        sink.send(json!(1)).await?;
        Err(RpcError::new(ErrorCode::Internal, "producer blew up"))
    });

    let frames = collect(
        router
            .handle(Envelope::stream_request("flaky", Value::Null), &Context::new())
            .await,
    )
    .await;
    let terminals: Vec<&Envelope> = frames
        .iter()
        .filter(|f| matches!(f.kind, FrameKind::StreamEnd | FrameKind::StreamError))
        .collect();
    assert_eq!(terminals.len(), 1, "exactly one terminal frame");
    assert_eq!(terminals[0].kind, FrameKind::StreamError);
    assert_eq!(terminals[0].as_error().unwrap().code, ErrorCode::Internal);
}

#[tokio::test]
async fn cancellation_after_first_frame_stops_the_stream() {
    let router = router_with_stream("one.then.wait", |_p, ctx: Context, sink: StreamSink| {
        async move {
            sink.send(json!({"n": 1})).await?;
            ctx.cancellation.cancelled().await;
            Ok(())
        }
    });

    let ctx = Context::new();
    let Reply::Stream(mut rx) = router
        .handle(Envelope::stream_request("one.then.wait", Value::Null), &ctx)
        .await
    else {
        panic!("expected stream");
    };

    assert_eq!(rx.recv().await.unwrap().kind, FrameKind::StreamStart);
    assert_eq!(rx.recv().await.unwrap().kind, FrameKind::StreamData);

    ctx.cancellation.cancel();
    let terminal = rx.recv().await.unwrap();
    assert!(
        matches!(terminal.kind, FrameKind::StreamEnd | FrameKind::StreamError),
        "stream must terminate after cancellation, got {:?}",
        terminal.kind
    );
    if terminal.kind == FrameKind::StreamError {
        assert_eq!(terminal.as_error().unwrap().code, ErrorCode::Cancelled);
    }
    assert!(rx.recv().await.is_none(), "no frames after the terminal");
}

#[tokio::test]
async fn uncooperative_producer_is_cut_off_with_cancelled_error() {
    // Producer ignores the sink and sleeps forever.
    let router = router_with_stream("stuck", |_p, _ctx, sink: StreamSink| async move {
        sink.send(json!(0)).await?;
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    });

    let ctx = Context::new();
    let Reply::Stream(mut rx) = router
        .handle(Envelope::stream_request("stuck", Value::Null), &ctx)
        .await
    else {
        panic!("expected stream");
    };
    assert_eq!(rx.recv().await.unwrap().kind, FrameKind::StreamStart);
    assert_eq!(rx.recv().await.unwrap().kind, FrameKind::StreamData);

    ctx.cancellation.cancel();
    let terminal = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("terminal frame must arrive promptly")
        .unwrap();
    assert_eq!(terminal.kind, FrameKind::StreamError);
    assert_eq!(terminal.as_error().unwrap().code, ErrorCode::Cancelled);
}

#[tokio::test]
async fn bounded_channel_applies_backpressure_to_fast_producers() {
    // Producer tries to push 100 values; the consumer reads slowly.  The
    // producer must not run ahead of the channel capacity (32) + in-flight.
    let produced = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = produced.clone();
    let mut registry = Registry::new();
    registry
        .register_stream(
            "firehose",
            move |_p, _ctx, sink: StreamSink| {
                let counter = counter.clone();
                async move {
                    for n in 0..100 {
                        sink.send(json!(n)).await?;
                        counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    }
                    Ok(())
                }
            },
            StreamOptions::default(),
        )
        .unwrap();
    let router = Router::builder(Arc::new(SharedRegistry::new(registry)))
        .stream_buffer(8)
        .build();

    let Reply::Stream(mut rx) = router
        .handle(Envelope::stream_request("firehose", Value::Null), &Context::new())
        .await
    else {
        panic!("expected stream");
    };

    // Read nothing for a moment; the producer should stall at the buffer.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let stalled = produced.load(std::sync::atomic::Ordering::SeqCst);
    assert!(
        stalled <= 16,
        "producer should be blocked by backpressure, got {stalled}"
    );

    // Drain everything; the full sequence arrives in order.
    let mut values = Vec::new();
    while let Some(frame) = rx.recv().await {
        if frame.kind == FrameKind::StreamData {
            values.push(frame.payload.as_i64().unwrap());
        }
    }
    assert_eq!(values, (0..100).collect::<Vec<i64>>());
}

#[tokio::test]
async fn request_kind_aimed_at_stream_handler_is_invalid() {
    let router = router_with_stream("s.only", |_p, _ctx, _sink| async move { Ok(()) });
    let Reply::Response(response) = router
        .handle(
            Envelope::request_with_id("x", "s.only", Value::Null),
            &Context::new(),
        )
        .await
    else {
        panic!("expected single error envelope");
    };
    assert_eq!(response.as_error().unwrap().code, ErrorCode::InvalidEnvelope);
}
