use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use forkwire_core::{Channel, EventHub};

use crate::{
    ProcessError, SHUTDOWN, SHUTDOWN_COMPLETE, ShutdownAck, ShutdownCompleteParams, ShutdownParams,
    ShutdownReason,
};

#[derive(Debug, Clone)]
pub struct ShutdownOptions {
    /// Budget for the reserved shutdown request itself.
    pub request_timeout: Duration,
    /// Budget for the worker's completion notification after the ack.
    pub exit_wait: Duration,
}

impl Default for ShutdownOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            exit_wait: Duration::from_secs(5),
        }
    }
}

/// Why the child was killed forcefully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForceReason {
    /// The worker acknowledged but never reported completion in time.
    Timeout,
    /// The worker never (successfully) answered the shutdown request.
    NoResponse,
}

#[derive(Debug, Clone)]
pub enum ShutdownEvent {
    Start { process_id: String },
    Ack { process_id: String, pending_requests: u64 },
    Complete { process_id: String, exit_code: Option<i32> },
    Timeout { process_id: String },
    Force { process_id: String, reason: ForceReason },
    Done { process_id: String, graceful: bool, duration: Duration },
}

/// Result of one shutdown flow.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownOutcome {
    pub graceful: bool,
    pub duration: Duration,
}

/// Drives the graceful-exit handshake against one worker at a time per
/// process id: shutdown request, ack, completion notification, and a
/// forceful kill when the worker stays silent.
///
/// No per-process state survives past the `Done` event.
pub struct ShutdownManager {
    in_progress: Mutex<HashSet<String>>,
    events: EventHub<ShutdownEvent>,
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            in_progress: Mutex::new(HashSet::new()),
            events: EventHub::new(),
        }
    }

    pub fn events(&self) -> &EventHub<ShutdownEvent> {
        &self.events
    }

    /// Run the shutdown flow for `process_id` over its control channel.
    ///
    /// `force_kill` is invoked at most once, when the worker must be
    /// terminated forcefully. A second call for the same process while one
    /// flow is in progress fails fast.
    pub async fn shutdown(
        &self,
        process_id: &str,
        channel: &Channel,
        reason: ShutdownReason,
        options: &ShutdownOptions,
        force_kill: impl FnOnce(),
    ) -> Result<ShutdownOutcome, ProcessError> {
        if !self.in_progress.lock().insert(process_id.to_owned()) {
            return Err(ProcessError::ShutdownInProgress(process_id.to_owned()));
        }

        let started = Instant::now();
        self.events.emit(&ShutdownEvent::Start {
            process_id: process_id.to_owned(),
        });
        tracing::info!(process_id, ?reason, "shutdown started");

        // Armed before the request so a worker that completes instantly is
        // not missed.
        let (complete_tx, complete_rx) = oneshot::channel::<Option<i32>>();
        let complete_tx = Arc::new(Mutex::new(Some(complete_tx)));
        let tx_slot = Arc::clone(&complete_tx);
        let listener = channel.on_notification(move |method, params| {
            if method != SHUTDOWN_COMPLETE {
                return;
            }
            if let Some(tx) = tx_slot.lock().take() {
                let exit_code = params
                    .and_then(|p| {
                        serde_json::from_value::<ShutdownCompleteParams>(p.clone()).ok()
                    })
                    .map(|p| p.exit_code);
                let _ = tx.send(exit_code);
            }
        });

        let params = ShutdownParams {
            timeout_ms: options.request_timeout.as_millis() as u64,
            reason,
        };
        let ack = channel
            .request(
                SHUTDOWN,
                serde_json::to_value(&params).ok(),
                Some(options.request_timeout),
            )
            .await;

        let graceful = match ack {
            Err(err) => {
                tracing::warn!(process_id, error = %err, "shutdown request failed");
                self.events.emit(&ShutdownEvent::Force {
                    process_id: process_id.to_owned(),
                    reason: ForceReason::NoResponse,
                });
                force_kill();
                false
            }
            Ok(value) => {
                let pending = serde_json::from_value::<ShutdownAck>(value)
                    .map(|ack| ack.pending_requests)
                    .unwrap_or(0);
                self.events.emit(&ShutdownEvent::Ack {
                    process_id: process_id.to_owned(),
                    pending_requests: pending,
                });

                match tokio::time::timeout(options.exit_wait, complete_rx).await {
                    Ok(Ok(exit_code)) => {
                        self.events.emit(&ShutdownEvent::Complete {
                            process_id: process_id.to_owned(),
                            exit_code,
                        });
                        true
                    }
                    // Channel closed, or the worker went quiet after the ack.
                    Ok(Err(_)) | Err(_) => {
                        self.events.emit(&ShutdownEvent::Timeout {
                            process_id: process_id.to_owned(),
                        });
                        self.events.emit(&ShutdownEvent::Force {
                            process_id: process_id.to_owned(),
                            reason: ForceReason::Timeout,
                        });
                        force_kill();
                        false
                    }
                }
            }
        };

        listener.cancel();
        self.in_progress.lock().remove(process_id);

        let outcome = ShutdownOutcome {
            graceful,
            duration: started.elapsed(),
        };
        self.events.emit(&ShutdownEvent::Done {
            process_id: process_id.to_owned(),
            graceful,
            duration: outcome.duration,
        });
        tracing::info!(process_id, graceful, duration = ?outcome.duration, "shutdown done");
        Ok(outcome)
    }
}
