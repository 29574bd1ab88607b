//! Channel engine conformance tests.
//!
//! Both ends of an in-memory socket pair get a full channel stack; one side
//! plays the worker, the other the manager. A few tests drive the peer's
//! raw transport directly to produce byte patterns a well-behaved channel
//! never would.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde_json::{Value, json};

use forkwire_core::{
    Channel, ChannelError, ChannelEvent, ChannelOptions, ErrorObject, Middleware, Transport,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// A started channel pair over an in-memory transport.
async fn channel_pair(
    client_options: ChannelOptions,
    server_options: ChannelOptions,
) -> (Channel, Channel) {
    init_tracing();
    let (a, b) = Transport::socket_pair();
    let client = Channel::json_rpc(a, client_options);
    let server = Channel::json_rpc(b, server_options);
    client.start().await.unwrap();
    server.start().await.unwrap();
    (client, server)
}

/// Channel on one end, the raw peer transport on the other.
async fn channel_with_raw_peer(options: ChannelOptions) -> (Channel, Transport) {
    init_tracing();
    let (a, b) = Transport::socket_pair();
    let channel = Channel::json_rpc(a, options);
    channel.start().await.unwrap();
    (channel, b)
}

#[tokio::test]
async fn echo_request_round_trip() {
    let (client, server) = channel_pair(ChannelOptions::default(), ChannelOptions::default()).await;

    let _handler = server.on_request(|request| {
        async move {
            assert_eq!(request.method, "add");
            let params = request.params.unwrap_or(Value::Null);
            let a = params["a"].as_i64().unwrap();
            let b = params["b"].as_i64().unwrap();
            Ok(json!({"sum": a + b}))
        }
        .boxed()
    });

    let result = tokio::time::timeout(
        Duration::from_millis(100),
        client.request("add", Some(json!({"a": 2, "b": 3})), None),
    )
    .await
    .expect("response within 100ms")
    .unwrap();
    assert_eq!(result, json!({"sum": 5}));
}

#[tokio::test]
async fn concurrent_requests_resolve_in_caller_order() {
    let (client, server) = channel_pair(ChannelOptions::default(), ChannelOptions::default()).await;

    let _handler = server.on_request(|request| {
        async move {
            let params = request.params.unwrap();
            let ms = params["ms"].as_u64().unwrap();
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(params["value"].clone())
        }
        .boxed()
    });

    let (first, second, third) = tokio::join!(
        client.request("delay", Some(json!({"ms": 50, "value": "first"})), None),
        client.request("delay", Some(json!({"ms": 30, "value": "second"})), None),
        client.request("delay", Some(json!({"ms": 10, "value": "third"})), None),
    );
    let results = [first.unwrap(), second.unwrap(), third.unwrap()];
    assert_eq!(results, [json!("first"), json!("second"), json!("third")]);
}

#[tokio::test]
async fn responses_correlate_by_id_under_interleaving() {
    let (client, server) = channel_pair(ChannelOptions::default(), ChannelOptions::default()).await;

    let _handler = server.on_request(|request| {
        async move {
            let n = request.params.unwrap()["n"].as_u64().unwrap();
            // Later requests answer faster, forcing out-of-order traffic at
            // the wire level if dispatch were not serialized per frame.
            tokio::time::sleep(Duration::from_millis(30 - 3 * n.min(9))).await;
            Ok(json!(n * n))
        }
        .boxed()
    });

    let calls = (0..8u64).map(|n| client.request("square", Some(json!({"n": n})), None));
    let results = futures_util::future::join_all(calls).await;
    for (n, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap(), json!((n * n) as u64));
    }
}

#[tokio::test]
async fn early_notifications_keep_a_sliding_window() {
    let (client, server) = channel_pair(ChannelOptions::default(), ChannelOptions::default()).await;
    let _sync = server.on_request(|_req| async move { Ok(Value::Null) }.boxed());

    // 15 notifications against the default buffer of 10, before any handler
    // exists on the client.
    for i in 0..15 {
        server.notify("tick", Some(json!({"seq": i}))).await.unwrap();
    }
    // Wait until the client has certainly dispatched them: the reply to a
    // later request cannot overtake earlier writes on a FIFO byte stream.
    client.request("sync", None, None).await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _handler = client.on_notification(move |method, params| {
        assert_eq!(method, "tick");
        sink.lock().push(params.unwrap()["seq"].as_i64().unwrap());
    });

    // Only the most recent 10, oldest first.
    assert_eq!(&*seen.lock(), &[5, 6, 7, 8, 9, 10, 11, 12, 13, 14]);

    // A later notification arrives after the buffered ones.
    server.notify("tick", Some(json!({"seq": 99}))).await.unwrap();
    client.request("sync", None, None).await.unwrap();
    assert_eq!(seen.lock().last(), Some(&99));
}

#[tokio::test]
async fn inbound_flood_closes_after_one_error() {
    let options = ChannelOptions {
        max_inbound_frames: Some(3),
        ..ChannelOptions::default()
    };
    let (channel, peer) = channel_with_raw_peer(options).await;

    let errors = Arc::new(AtomicUsize::new(0));
    let closes = Arc::new(AtomicUsize::new(0));
    let dispatched = Arc::new(AtomicUsize::new(0));
    let error_count = Arc::clone(&errors);
    let close_count = Arc::clone(&closes);
    let _sub = channel.events().subscribe(move |event| match event {
        ChannelEvent::Error(_) => {
            error_count.fetch_add(1, Ordering::SeqCst);
        }
        ChannelEvent::Close => {
            close_count.fetch_add(1, Ordering::SeqCst);
        }
        ChannelEvent::Start => {}
    });
    let count = Arc::clone(&dispatched);
    let _handler = channel.on_notification(move |_, _| {
        count.fetch_add(1, Ordering::SeqCst);
    });

    // Six valid frames in a single chunk against a cap of three.
    let mut flood = Vec::new();
    for i in 0..6 {
        flood.extend_from_slice(
            format!("{{\"jsonrpc\":\"2.0\",\"method\":\"n\",\"params\":{{\"i\":{i}}}}}\n")
                .as_bytes(),
        );
    }
    peer.write(Bytes::from(flood)).await.unwrap();

    tokio::time::timeout(Duration::from_secs(1), async {
        while closes.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("channel must close");

    assert_eq!(errors.load(Ordering::SeqCst), 1, "exactly one error event");
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    assert!(dispatched.load(Ordering::SeqCst) <= 3);
    assert!(!channel.is_connected());
}

#[tokio::test]
async fn request_times_out_when_no_response_arrives() {
    let (channel, _peer) = channel_with_raw_peer(ChannelOptions::default()).await;

    let started = Instant::now();
    let err = channel
        .request("void", None, Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert!(err.is_timeout(), "got {err:?}");
}

#[tokio::test]
async fn unsolicited_response_is_discarded_silently() {
    let (channel, peer) = channel_with_raw_peer(ChannelOptions::default()).await;

    let errors = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&errors);
    let _sub = channel.events().subscribe(move |event| {
        if matches!(event, ChannelEvent::Error(_)) {
            count.fetch_add(1, Ordering::SeqCst);
        }
    });

    peer.write(Bytes::from_static(
        b"{\"jsonrpc\":\"2.0\",\"id\":4242,\"result\":\"nobody asked\"}\n",
    ))
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(errors.load(Ordering::SeqCst), 0);
    assert!(channel.is_connected());
}

#[tokio::test]
async fn poisoned_payload_does_not_silence_later_ones() {
    let (channel, peer) = channel_with_raw_peer(ChannelOptions::default()).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _handler = channel.on_notification(move |_method, params| {
        sink.lock().push(params.unwrap()["i"].as_i64().unwrap());
    });
    let errors = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&errors);
    let _sub = channel.events().subscribe(move |event| {
        if matches!(event, ChannelEvent::Error(_)) {
            count.fetch_add(1, Ordering::SeqCst);
        }
    });

    // Valid, garbage, valid — all in one chunk.
    let chunk = b"{\"jsonrpc\":\"2.0\",\"method\":\"n\",\"params\":{\"i\":1}}\n\
        this is not json\n\
        {\"jsonrpc\":\"2.0\",\"method\":\"n\",\"params\":{\"i\":2}}\n";
    peer.write(Bytes::from_static(chunk)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(&*seen.lock(), &[1, 2]);
    assert_eq!(errors.load(Ordering::SeqCst), 1);
    assert!(channel.is_connected());
}

#[tokio::test]
async fn missing_handler_answers_method_not_found() {
    let (client, _server) =
        channel_pair(ChannelOptions::default(), ChannelOptions::default()).await;

    let err = client.request("nope", None, None).await.unwrap_err();
    match err {
        ChannelError::Peer { code, .. } => assert_eq!(code, -32601),
        other => panic!("expected peer error, got {other:?}"),
    }
}

#[tokio::test]
async fn handler_failure_becomes_an_error_response() {
    let (client, server) = channel_pair(ChannelOptions::default(), ChannelOptions::default()).await;

    let _handler = server.on_request(|_request| {
        async move { Err(ErrorObject::new(-32603, "boom").with_data(json!({"hint": "none"}))) }
            .boxed()
    });

    let err = client.request("explode", None, None).await.unwrap_err();
    match err {
        ChannelError::Peer { code, message, data } => {
            assert_eq!(code, -32603);
            assert_eq!(message, "boom");
            assert_eq!(data, Some(json!({"hint": "none"})));
        }
        other => panic!("expected peer error, got {other:?}"),
    }
}

#[tokio::test]
async fn handler_panic_does_not_kill_the_channel() {
    let (client, server) = channel_pair(ChannelOptions::default(), ChannelOptions::default()).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&calls);
    let _handler = server.on_request(move |request| {
        let count = Arc::clone(&count);
        async move {
            if count.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("handler bug");
            }
            let _ = request;
            Ok(json!("recovered"))
        }
        .boxed()
    });

    let err = client.request("first", None, None).await.unwrap_err();
    assert!(matches!(err, ChannelError::Peer { code: -32603, .. }));

    // The channel survived and serves the next request.
    let result = client.request("second", None, None).await.unwrap();
    assert_eq!(result, json!("recovered"));
}

#[tokio::test]
async fn close_rejects_pending_requests() {
    let (client, _peer) = channel_with_raw_peer(ChannelOptions::default()).await;

    let inflight = {
        let client = client.clone();
        tokio::spawn(async move { client.request("never", None, None).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    client.close().await;

    let err = inflight.await.unwrap().unwrap_err();
    assert!(matches!(err, ChannelError::Closed), "got {err:?}");
    assert!(!client.is_connected());
}

#[tokio::test]
async fn failed_start_leaves_no_transport_subscriptions() {
    init_tracing();
    let transport = Transport::socket_client("/nonexistent/forkwire-test.sock");
    let channel = Channel::json_rpc(transport, ChannelOptions::default());

    assert_eq!(channel.transport().events().listener_count(), 0);

    assert!(channel.start().await.is_err());
    assert_eq!(channel.transport().events().listener_count(), 0);
    assert!(!channel.is_connected());

    // The retry fails on the connect again, not on stale channel state.
    let err = channel.start().await.unwrap_err();
    assert!(matches!(err, ChannelError::Transport(_)), "got {err:?}");
}

#[derive(Default)]
struct CountingMiddleware {
    outgoing_requests: AtomicUsize,
    incoming_responses: AtomicUsize,
    fail_hooks: bool,
}

impl Middleware for CountingMiddleware {
    fn on_outgoing_request(&self, _envelope: &Value) -> Result<(), forkwire_core::BoxError> {
        self.outgoing_requests.fetch_add(1, Ordering::SeqCst);
        if self.fail_hooks {
            return Err("hook failure".into());
        }
        Ok(())
    }

    fn on_incoming_response(&self, _envelope: &Value) -> Result<(), forkwire_core::BoxError> {
        self.incoming_responses.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn middleware_observes_and_its_failures_stay_contained() {
    let middleware = Arc::new(CountingMiddleware {
        fail_hooks: true,
        ..CountingMiddleware::default()
    });
    let diagnostics = Arc::new(AtomicUsize::new(0));
    let diag_count = Arc::clone(&diagnostics);

    let options = ChannelOptions {
        middleware: vec![middleware.clone() as Arc<dyn Middleware>],
        diagnostics: Some(Arc::new(move |_hook, _err| {
            diag_count.fetch_add(1, Ordering::SeqCst);
        })),
        ..ChannelOptions::default()
    };

    let (a, b) = Transport::socket_pair();
    let client = Channel::json_rpc(a, options);
    let server = Channel::json_rpc(b, ChannelOptions::default());
    client.start().await.unwrap();
    server.start().await.unwrap();
    let _handler = server.on_request(|_req| async move { Ok(json!("ok")) }.boxed());

    let result = client.request("observed", None, None).await.unwrap();
    assert_eq!(result, json!("ok"));

    assert_eq!(middleware.outgoing_requests.load(Ordering::SeqCst), 1);
    assert_eq!(middleware.incoming_responses.load(Ordering::SeqCst), 1);
    // The failing hook went to diagnostics instead of breaking the call.
    assert_eq!(diagnostics.load(Ordering::SeqCst), 1);
}
