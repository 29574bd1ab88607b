//! Reconnect manager conformance tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{Value, json};

use forkwire_core::ChannelError;
use forkwire_process::{ReconnectEvent, ReconnectManager, ReconnectOptions, Reconnectable};

/// Target that fails a scripted number of connect attempts, then succeeds.
struct ScriptedTarget {
    failures_left: AtomicUsize,
    connects: AtomicUsize,
}

impl ScriptedTarget {
    fn failing(times: usize) -> Arc<Self> {
        Arc::new(Self {
            failures_left: AtomicUsize::new(times),
            connects: AtomicUsize::new(0),
        })
    }
}

impl Reconnectable for ScriptedTarget {
    fn connect(&self) -> BoxFuture<'_, Result<(), ChannelError>> {
        async move {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                Err(ChannelError::transport("connection refused"))
            } else {
                Ok(())
            }
        }
        .boxed()
    }
}

fn options(max_attempts: u32) -> ReconnectOptions {
    ReconnectOptions {
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(40),
        multiplier: 2.0,
        jitter: 0.0,
        max_attempts,
        ..ReconnectOptions::default()
    }
}

fn record_events(manager: &ReconnectManager<ScriptedTarget>) -> Arc<Mutex<Vec<ReconnectEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    // The subscription guard only matters for cancellation; the listener
    // itself lives with the hub.
    let _ = manager.events().subscribe(move |event| {
        sink.lock().push(event.clone());
    });
    events
}

#[tokio::test]
async fn backoff_sequence_doubles_and_clamps() {
    let target = ScriptedTarget::failing(usize::MAX);
    let manager = ReconnectManager::new(Arc::clone(&target), options(4));
    let events = record_events(&manager);

    let reconnected = manager
        .handle_disconnect(&ChannelError::transport("gone"))
        .await;
    assert!(!reconnected);
    assert_eq!(target.connects.load(Ordering::SeqCst), 4);

    let delays: Vec<Duration> = events
        .lock()
        .iter()
        .filter_map(|event| match event {
            ReconnectEvent::Attempting { delay, .. } => Some(*delay),
            _ => None,
        })
        .collect();
    assert_eq!(delays, [10, 20, 40, 40].map(Duration::from_millis));
    assert!(matches!(
        events.lock().last(),
        Some(ReconnectEvent::Failed { attempts: 4 })
    ));
    assert!(!manager.is_reconnecting());
}

#[tokio::test]
async fn second_disconnect_while_reconnecting_is_ignored() {
    let target = ScriptedTarget::failing(usize::MAX);
    let manager = ReconnectManager::new(target, options(50));

    let runner = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .handle_disconnect(&ChannelError::transport("gone"))
                .await
        })
    };
    while !manager.is_reconnecting() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    assert!(
        !manager
            .handle_disconnect(&ChannelError::transport("again"))
            .await
    );

    manager.cancel();
    assert!(!runner.await.unwrap());
}

#[tokio::test]
async fn success_flushes_queue_in_fifo_order() {
    let target = ScriptedTarget::failing(2);
    let manager = ReconnectManager::new(target, options(10));
    let events = record_events(&manager);

    let runner = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .handle_disconnect(&ChannelError::transport("gone"))
                .await
        })
    };
    while !manager.is_reconnecting() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut receivers = Vec::new();
    for i in 0..3 {
        let order = Arc::clone(&order);
        let rx = manager
            .queue_request("queued", move || {
                async move {
                    order.lock().push(i);
                    Ok(json!(i))
                }
                .boxed()
            })
            .unwrap()
            .expect("reconnect in progress, entry must queue");
        receivers.push(rx);
    }
    assert_eq!(manager.state().queue_size, 3);

    assert!(runner.await.unwrap(), "reconnect must succeed");
    for (i, rx) in receivers.into_iter().enumerate() {
        assert_eq!(rx.await.unwrap().unwrap(), json!(i));
    }
    assert_eq!(&*order.lock(), &[0, 1, 2]);
    assert_eq!(manager.state().queue_size, 0);
    assert!(
        events
            .lock()
            .iter()
            .any(|event| matches!(event, ReconnectEvent::Success { .. }))
    );
}

#[tokio::test]
async fn queue_timeout_rejects_one_entry_without_touching_others() {
    let target = ScriptedTarget::failing(usize::MAX);
    let mut opts = options(1);
    opts.initial_delay = Duration::from_millis(300);
    opts.queue_timeout = Duration::from_millis(50);
    let manager = ReconnectManager::new(target, opts);

    let runner = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .handle_disconnect(&ChannelError::transport("gone"))
                .await
        })
    };
    while !manager.is_reconnecting() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let noop = || async move { Ok(Value::Null) }.boxed();
    let first = manager.queue_request("first", noop).unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let noop = || async move { Ok(Value::Null) }.boxed();
    let mut second = manager.queue_request("second", noop).unwrap().unwrap();

    let err = first.await.unwrap().unwrap_err();
    assert!(err.is_timeout(), "got {err:?}");
    // The second entry is untouched by the first one's timer.
    assert!(second.try_recv().is_err());
    assert_eq!(manager.state().queue_size, 1);

    let err = second.await.unwrap().unwrap_err();
    assert!(err.is_timeout(), "got {err:?}");

    assert!(!runner.await.unwrap());
}

#[tokio::test]
async fn queue_is_bounded_and_idle_queueing_is_declined() {
    let target = ScriptedTarget::failing(usize::MAX);
    let mut opts = options(1);
    opts.initial_delay = Duration::from_millis(200);
    opts.max_queue_size = 1;
    let manager = ReconnectManager::new(target, opts);

    // Not reconnecting: the caller is told to fall back.
    let declined = manager
        .queue_request("idle", || async move { Ok(Value::Null) }.boxed())
        .unwrap();
    assert!(declined.is_none());

    let runner = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .handle_disconnect(&ChannelError::transport("gone"))
                .await
        })
    };
    while !manager.is_reconnecting() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let _first = manager
        .queue_request("fits", || async move { Ok(Value::Null) }.boxed())
        .unwrap()
        .unwrap();
    let overflow = manager.queue_request("overflow", || async move { Ok(Value::Null) }.boxed());
    assert!(matches!(overflow, Err(ChannelError::State(_))));

    manager.cancel();
    runner.await.unwrap();
}

#[tokio::test]
async fn cancel_stops_the_loop_and_drains_via_failure() {
    let target = ScriptedTarget::failing(usize::MAX);
    let mut opts = options(100);
    opts.initial_delay = Duration::from_millis(50);
    opts.max_delay = Duration::from_millis(50);
    let manager = ReconnectManager::new(target, opts);

    let runner = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .handle_disconnect(&ChannelError::transport("gone"))
                .await
        })
    };
    while !manager.is_reconnecting() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    let queued = manager
        .queue_request("doomed", || async move { Ok(Value::Null) }.boxed())
        .unwrap()
        .unwrap();

    manager.cancel();
    assert!(!runner.await.unwrap());
    assert!(!manager.is_reconnecting());
    // Queue drained through the failure path.
    assert!(queued.await.unwrap().is_err());
    assert_eq!(manager.state().queue_size, 0);
}
