use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value;
use tokio::sync::{oneshot, watch};

use forkwire_core::{ChannelError, EventHub};

/// Anything that can be dialed back in after a disconnect.
pub trait Reconnectable: Send + Sync {
    fn connect(&self) -> BoxFuture<'_, Result<(), ChannelError>>;
}

/// A channel reconnects by starting again: its transport re-dials and a
/// fresh reader loop comes up.
impl Reconnectable for forkwire_core::Channel {
    fn connect(&self) -> BoxFuture<'_, Result<(), ChannelError>> {
        Box::pin(self.start())
    }
}

#[derive(Debug, Clone)]
pub struct ReconnectOptions {
    pub enabled: bool,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Jitter ratio: each delay is perturbed by a uniform factor in
    /// `[-jitter, +jitter]` of itself.
    pub jitter: f64,
    pub max_attempts: u32,
    pub queue_requests: bool,
    pub max_queue_size: usize,
    /// Deadline for a single queued request to survive the reconnect.
    pub queue_timeout: Duration,
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.1,
            max_attempts: 10,
            queue_requests: true,
            max_queue_size: 100,
            queue_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ReconnectEvent {
    Attempting { attempt: u32, delay: Duration },
    Success { attempt: u32 },
    Failed { attempts: u32 },
}

/// Snapshot of the manager's state.
#[derive(Debug, Clone)]
pub struct ReconnectState {
    pub attempt: u32,
    pub is_reconnecting: bool,
    pub started_at: Option<Instant>,
    pub queue_size: usize,
    pub last_error: Option<String>,
}

type Execute = Box<dyn FnOnce() -> BoxFuture<'static, Result<Value, ChannelError>> + Send>;

struct QueuedRequest {
    id: u64,
    method: String,
    execute: Execute,
    tx: oneshot::Sender<Result<Value, ChannelError>>,
    queued_at: Instant,
    timer: tokio::task::JoinHandle<()>,
}

#[derive(Default)]
struct StateData {
    attempt: u32,
    is_reconnecting: bool,
    started_at: Option<Instant>,
    last_error: Option<String>,
}

/// Reconnect loop with bounded exponential backoff and a bounded queue of
/// requests issued while the connection is down.
pub struct ReconnectManager<T> {
    inner: Arc<ReconnectInner<T>>,
}

impl<T> Clone for ReconnectManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct ReconnectInner<T> {
    target: Arc<T>,
    options: ReconnectOptions,
    events: EventHub<ReconnectEvent>,
    state: Mutex<StateData>,
    queue: Mutex<VecDeque<QueuedRequest>>,
    next_queue_id: AtomicU64,
    cancel: watch::Sender<bool>,
}

impl<T: Reconnectable + 'static> ReconnectManager<T> {
    pub fn new(target: Arc<T>, options: ReconnectOptions) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            inner: Arc::new(ReconnectInner {
                target,
                options,
                events: EventHub::new(),
                state: Mutex::new(StateData::default()),
                queue: Mutex::new(VecDeque::new()),
                next_queue_id: AtomicU64::new(1),
                cancel,
            }),
        }
    }

    pub fn events(&self) -> &EventHub<ReconnectEvent> {
        &self.inner.events
    }

    pub fn state(&self) -> ReconnectState {
        let state = self.inner.state.lock();
        ReconnectState {
            attempt: state.attempt,
            is_reconnecting: state.is_reconnecting,
            started_at: state.started_at,
            queue_size: self.inner.queue.lock().len(),
            last_error: state.last_error.clone(),
        }
    }

    pub fn is_reconnecting(&self) -> bool {
        self.inner.state.lock().is_reconnecting
    }

    /// Run the backoff loop after a disconnect.
    ///
    /// Returns `true` once the target reconnected (the queue has been
    /// flushed), `false` when reconnection is disabled, already running, or
    /// every attempt failed (the queue has been rejected).
    pub async fn handle_disconnect(&self, error: &ChannelError) -> bool {
        let inner = &self.inner;
        if !inner.options.enabled {
            return false;
        }
        {
            let mut state = inner.state.lock();
            if state.is_reconnecting {
                return false;
            }
            state.is_reconnecting = true;
            state.attempt = 0;
            state.started_at = Some(Instant::now());
            state.last_error = Some(error.to_string());
        }
        tracing::info!(error = %error, "connection lost, reconnecting");

        let mut cancel_rx = inner.cancel.subscribe();
        let mut last_error = error.clone();
        let mut cancelled = *cancel_rx.borrow();

        while !cancelled && inner.state.lock().attempt < inner.options.max_attempts {
            let attempt = {
                let mut state = inner.state.lock();
                state.attempt += 1;
                state.attempt
            };
            let delay = backoff_delay(&inner.options, attempt);
            inner
                .events
                .emit(&ReconnectEvent::Attempting { attempt, delay });
            tracing::debug!(attempt, ?delay, "reconnect attempt");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel_rx.changed() => {
                    cancelled = true;
                }
            }
            if cancelled || *cancel_rx.borrow() {
                break;
            }

            match inner.target.connect().await {
                Ok(()) => {
                    {
                        let mut state = inner.state.lock();
                        state.is_reconnecting = false;
                        state.last_error = None;
                    }
                    inner.events.emit(&ReconnectEvent::Success { attempt });
                    tracing::info!(attempt, "reconnected");
                    self.flush_queue().await;
                    return true;
                }
                Err(err) => {
                    inner.state.lock().last_error = Some(err.to_string());
                    tracing::debug!(attempt, error = %err, "reconnect attempt failed");
                    last_error = err;
                }
            }
        }

        let attempts = {
            let mut state = inner.state.lock();
            state.is_reconnecting = false;
            state.attempt
        };
        inner.events.emit(&ReconnectEvent::Failed { attempts });
        tracing::warn!(attempts, error = %last_error, "reconnect failed");
        self.reject_queue(&last_error);
        false
    }

    /// Queue a request while reconnection is in progress.
    ///
    /// `Ok(None)` means no reconnect is running (or queueing is disabled)
    /// and the caller should fall back to its own handling. A full queue
    /// fails synchronously. The returned receiver resolves with the
    /// request's result once the queue is flushed, or with an error when
    /// the entry times out or the reconnect fails.
    pub fn queue_request(
        &self,
        method: &str,
        execute: impl FnOnce() -> BoxFuture<'static, Result<Value, ChannelError>> + Send + 'static,
    ) -> Result<Option<oneshot::Receiver<Result<Value, ChannelError>>>, ChannelError> {
        let inner = &self.inner;
        if !inner.options.queue_requests || !inner.state.lock().is_reconnecting {
            return Ok(None);
        }

        let mut queue = inner.queue.lock();
        if queue.len() >= inner.options.max_queue_size {
            return Err(ChannelError::state(format!(
                "reconnect queue full ({} entries)",
                inner.options.max_queue_size
            )));
        }

        let id = inner.next_queue_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        let timeout = inner.options.queue_timeout;
        let weak = Arc::downgrade(inner);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = weak.upgrade() else { return };
            let expired = {
                let mut queue = inner.queue.lock();
                queue
                    .iter()
                    .position(|entry| entry.id == id)
                    .map(|at| queue.remove(at).expect("position came from this queue"))
            };
            if let Some(entry) = expired {
                tracing::debug!(method = %entry.method, "queued request expired");
                let _ = entry.tx.send(Err(ChannelError::Timeout {
                    during: "wait for reconnection",
                    after: timeout,
                }));
            }
        });

        queue.push_back(QueuedRequest {
            id,
            method: method.to_owned(),
            execute: Box::new(execute),
            tx,
            queued_at: Instant::now(),
            timer,
        });
        Ok(Some(rx))
    }

    /// Stop an in-progress loop at its next decision point. The loop then
    /// drains the queue through the failure path.
    pub fn cancel(&self) {
        let _ = self.inner.cancel.send(true);
    }

    /// Clear state and queue for reuse. Queued entries are rejected.
    pub fn reset(&self) {
        let _ = self.inner.cancel.send(false);
        *self.inner.state.lock() = StateData::default();
        self.reject_queue(&ChannelError::state("reconnect manager reset"));
    }

    /// Execute queued entries in FIFO order, cancelling each entry's timer
    /// before awaiting its execute.
    async fn flush_queue(&self) {
        loop {
            let entry = self.inner.queue.lock().pop_front();
            let Some(entry) = entry else { break };
            entry.timer.abort();
            tracing::debug!(
                method = %entry.method,
                waited = ?entry.queued_at.elapsed(),
                "flushing queued request"
            );
            let result = (entry.execute)().await;
            let _ = entry.tx.send(result);
        }
    }

    fn reject_queue(&self, error: &ChannelError) {
        let entries: Vec<QueuedRequest> = self.inner.queue.lock().drain(..).collect();
        for entry in entries {
            entry.timer.abort();
            let _ = entry.tx.send(Err(error.clone()));
        }
    }
}

/// `initial * multiplier^(attempt-1)`, clamped to `max_delay`, perturbed by
/// the jitter ratio.
fn backoff_delay(options: &ReconnectOptions, attempt: u32) -> Duration {
    let base = options.initial_delay.as_secs_f64() * options.multiplier.powi(attempt as i32 - 1);
    let capped = base.min(options.max_delay.as_secs_f64());
    let jittered = if options.jitter > 0.0 {
        let factor = rand::thread_rng().gen_range(-options.jitter..=options.jitter);
        (capped + capped * factor).max(0.0)
    } else {
        capped
    };
    Duration::from_secs_f64(jittered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_clamps() {
        let options = ReconnectOptions {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
            multiplier: 2.0,
            jitter: 0.0,
            ..ReconnectOptions::default()
        };
        let delays: Vec<_> = (1..=5).map(|a| backoff_delay(&options, a)).collect();
        assert_eq!(
            delays,
            [100, 200, 400, 400, 400].map(Duration::from_millis)
        );
    }

    #[test]
    fn jitter_stays_in_band() {
        let options = ReconnectOptions {
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            jitter: 0.25,
            ..ReconnectOptions::default()
        };
        for attempt in 1..=4 {
            let base = 100.0 * 2f64.powi(attempt - 1);
            for _ in 0..50 {
                let delay = backoff_delay(&options, attempt as u32).as_secs_f64() * 1000.0;
                assert!(delay >= base * 0.75 - 1e-6 && delay <= base * 1.25 + 1e-6);
            }
        }
    }
}
