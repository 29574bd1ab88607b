//! Minimal worker binary: speaks the control protocol over its own stdio.
//!
//! Answers the runtime handshake, a couple of arithmetic methods, and the
//! graceful-shutdown request. Spawn it with `ProcessManager::spawn` and a
//! `CommandSpec` pointing at this binary.

use futures_util::FutureExt;
use serde_json::{Value, json};

use forkwire::{Channel, ChannelOptions, ErrorObject, Transport, reserved};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let channel = Channel::json_rpc(Transport::worker_stdio(), ChannelOptions::default());
    channel.start().await?;

    let (exit_tx, mut exit_rx) = tokio::sync::mpsc::channel::<i32>(1);

    let responder = channel.clone();
    let _requests = channel.on_request(move |request| {
        let responder = responder.clone();
        let exit_tx = exit_tx.clone();
        async move {
            match request.method.as_str() {
                reserved::HANDSHAKE => Ok(json!({
                    "version": reserved::PROTOCOL_VERSION,
                    "capabilities": ["add", "delay"],
                })),
                reserved::SHUTDOWN => {
                    // Ack first; completion goes out as a notification once
                    // the reply is on the wire.
                    tokio::spawn(async move {
                        let _ = responder
                            .notify(reserved::SHUTDOWN_COMPLETE, Some(json!({"exit_code": 0})))
                            .await;
                        let _ = exit_tx.send(0).await;
                    });
                    Ok(json!({"status": "shutting_down", "pending_requests": 0}))
                }
                "add" => {
                    let params = request.params.unwrap_or(Value::Null);
                    let a = params["a"].as_i64().unwrap_or(0);
                    let b = params["b"].as_i64().unwrap_or(0);
                    Ok(json!({"sum": a + b}))
                }
                "delay" => {
                    let params = request.params.unwrap_or(Value::Null);
                    let ms = params["ms"].as_u64().unwrap_or(0);
                    tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
                    Ok(params["value"].clone())
                }
                other => Err(ErrorObject::new(
                    forkwire::CODE_METHOD_NOT_FOUND,
                    format!("unknown method {other:?}"),
                )),
            }
        }
        .boxed()
    });

    let heartbeat = channel.clone();
    let _notifications = channel.on_notification(move |method, params| {
        if method == reserved::HEARTBEAT_PING {
            let pong = params.cloned().unwrap_or(Value::Null);
            let heartbeat = heartbeat.clone();
            tokio::spawn(async move {
                let _ = heartbeat.notify(reserved::HEARTBEAT_PONG, Some(pong)).await;
            });
        }
    });

    let code = exit_rx.recv().await.unwrap_or(0);
    channel.close().await;
    std::process::exit(code);
}
