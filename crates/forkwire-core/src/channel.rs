use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{oneshot, watch};

use crate::{
    BoxError, CODE_INTERNAL_ERROR, CODE_METHOD_NOT_FOUND, ChannelError, ChannelMessage, ErrorObject,
    EventHub, FramingCodec, MessageId, MetricsEvent, MetricsSink, Middleware, Protocol,
    ResponseAccessor, Serializer, Subscription, Transport, TransportEvent, default_accessor,
};

/// Default deadline for [`Channel::request`].
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Default capacity of the early-notification buffer.
pub const DEFAULT_EARLY_NOTIFICATIONS: usize = 10;
/// Default initial capacity reserved for the pending-request map.
pub const DEFAULT_PENDING_POOL_SIZE: usize = 100;

/// Tuning and instrumentation knobs for a [`Channel`].
#[derive(Clone)]
pub struct ChannelOptions {
    /// Deadline applied when a request does not pass its own.
    pub timeout: Duration,
    /// Overrides the accessor auto-detected from the protocol id.
    pub response_accessor: Option<Arc<dyn ResponseAccessor>>,
    pub middleware: Vec<Arc<dyn Middleware>>,
    pub metrics: Option<Arc<dyn MetricsSink>>,
    /// Receives hook name and error when a middleware hook fails.
    pub diagnostics: Option<Arc<dyn Fn(&'static str, BoxError) + Send + Sync>>,
    /// Cap on decoded frames per delivered transport chunk. Exceeding it
    /// emits one error and closes the channel. `None` = unbounded.
    pub max_inbound_frames: Option<usize>,
    /// Notifications retained before the first handler registers; a full
    /// buffer evicts the oldest entry.
    pub buffer_early_notifications: usize,
    /// Initial capacity reserved for the pending-request map; 0 disables
    /// the reservation.
    pub pending_request_pool_size: usize,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_REQUEST_TIMEOUT,
            response_accessor: None,
            middleware: Vec::new(),
            metrics: None,
            diagnostics: None,
            max_inbound_frames: None,
            buffer_early_notifications: DEFAULT_EARLY_NOTIFICATIONS,
            pending_request_pool_size: DEFAULT_PENDING_POOL_SIZE,
        }
    }
}

/// Channel lifecycle events.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Start,
    Close,
    Error(ChannelError),
}

/// An inbound request as seen by a request handler.
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    pub id: MessageId,
    pub method: String,
    pub params: Option<Value>,
}

/// Async request handler. `Ok` becomes a success response, `Err` an error
/// response; a panic is caught and answered with an internal error.
pub type RequestHandler =
    Arc<dyn Fn(IncomingRequest) -> BoxFuture<'static, Result<Value, ErrorObject>> + Send + Sync>;

/// Notification handler. Runs on the channel's dispatch path; must not
/// register further handlers on the same channel from inside the callback.
pub type NotificationHandler = Arc<dyn Fn(&str, Option<&Value>) + Send + Sync>;

struct PendingEntry {
    method: String,
    tx: oneshot::Sender<Result<Value, ChannelError>>,
}

/// The channel engine: composes a transport, a framing codec, a serializer,
/// and an application protocol into a request/response/notification pipe.
///
/// Cloning shares the underlying channel.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    transport: Transport,
    framing: Mutex<FramingCodec>,
    serializer: Arc<dyn Serializer>,
    protocol: Arc<dyn Protocol>,
    accessor: Arc<dyn ResponseAccessor>,
    middleware: Vec<Arc<dyn Middleware>>,
    metrics: Option<Arc<dyn MetricsSink>>,
    diagnostics: Option<Arc<dyn Fn(&'static str, BoxError) + Send + Sync>>,
    default_timeout: Duration,
    max_inbound_frames: Option<usize>,
    early_capacity: usize,

    connected: AtomicBool,
    next_request_id: AtomicU64,
    next_handler_id: AtomicU64,
    pending: Mutex<HashMap<MessageId, PendingEntry>>,
    request_handlers: Mutex<Vec<(u64, RequestHandler)>>,
    notification_handlers: Mutex<Vec<(u64, NotificationHandler)>>,
    early_notifications: Mutex<VecDeque<(String, Option<Value>)>>,
    events: EventHub<ChannelEvent>,
    write_gate: tokio::sync::Mutex<()>,
    stop: Mutex<Option<watch::Sender<bool>>>,
    transport_error_sub: Mutex<Option<Subscription>>,
}

impl Channel {
    pub fn new(
        transport: Transport,
        framing: FramingCodec,
        serializer: Arc<dyn Serializer>,
        protocol: Arc<dyn Protocol>,
        options: ChannelOptions,
    ) -> Self {
        let accessor = options
            .response_accessor
            .unwrap_or_else(|| default_accessor(protocol.id()));
        Self {
            inner: Arc::new(ChannelInner {
                transport,
                framing: Mutex::new(framing),
                serializer,
                protocol,
                accessor,
                middleware: options.middleware,
                metrics: options.metrics,
                diagnostics: options.diagnostics,
                default_timeout: options.timeout,
                max_inbound_frames: options.max_inbound_frames,
                early_capacity: options.buffer_early_notifications,
                connected: AtomicBool::new(false),
                next_request_id: AtomicU64::new(0),
                next_handler_id: AtomicU64::new(1),
                pending: Mutex::new(HashMap::with_capacity(options.pending_request_pool_size)),
                request_handlers: Mutex::new(Vec::new()),
                notification_handlers: Mutex::new(Vec::new()),
                early_notifications: Mutex::new(VecDeque::new()),
                events: EventHub::new(),
                write_gate: tokio::sync::Mutex::new(()),
                stop: Mutex::new(None),
                transport_error_sub: Mutex::new(None),
            }),
        }
    }

    /// JSON-RPC over newline-delimited JSON, the control-channel default.
    pub fn json_rpc(transport: Transport, options: ChannelOptions) -> Self {
        Self::new(
            transport,
            FramingCodec::newline_delimited(),
            Arc::new(crate::JsonSerializer),
            Arc::new(crate::JsonRpcProtocol),
            options,
        )
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    pub fn events(&self) -> &EventHub<ChannelEvent> {
        &self.inner.events
    }

    pub fn transport(&self) -> &Transport {
        &self.inner.transport
    }

    /// Connect the transport (when needed) and begin dispatching inbound
    /// frames.
    ///
    /// Transport events are subscribed before the connect so nothing from a
    /// fast-starting peer is missed; a connect failure tears that
    /// subscription down again, leaving the channel clean for a retry.
    pub async fn start(&self) -> Result<(), ChannelError> {
        if self.is_connected() {
            return Err(ChannelError::state("channel already started"));
        }

        let events = self.inner.events.clone();
        let sub = self.inner.transport.events().subscribe(move |event| {
            if let TransportEvent::Error(message) = event {
                events.emit(&ChannelEvent::Error(ChannelError::Transport(message.clone())));
            }
        });

        if !self.inner.transport.is_connected() {
            if let Err(err) = self.inner.transport.connect().await {
                sub.cancel();
                return Err(err);
            }
        }

        *self.inner.transport_error_sub.lock() = Some(sub);
        self.inner.connected.store(true, Ordering::Release);
        self.spawn_reader();
        self.inner.events.emit(&ChannelEvent::Start);
        tracing::debug!(protocol = self.inner.protocol.id(), "channel started");
        Ok(())
    }

    /// Close the channel: reject every pending request, reset framing,
    /// disconnect the transport, drop registered handlers.
    pub async fn close(&self) {
        self.inner.shutdown(None).await;
    }

    /// Issue a request and await its response.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, ChannelError> {
        if !self.is_connected() {
            return Err(ChannelError::state("channel is not started"));
        }
        let inner = &self.inner;
        let id = MessageId::Int(inner.next_request_id.fetch_add(1, Ordering::Relaxed) + 1);
        let envelope = inner
            .protocol
            .create_request(method, params, &id);
        inner.run_middleware("on_outgoing_request", |m| m.on_outgoing_request(&envelope));
        inner.record(|| MetricsEvent::RequestStarted {
            method: method.to_owned(),
        });

        // The pending entry goes in before the write so a fast peer cannot
        // answer a request we have not recorded yet.
        let (tx, rx) = oneshot::channel();
        inner.pending.lock().insert(
            id.clone(),
            PendingEntry {
                method: method.to_owned(),
                tx,
            },
        );

        let started = Instant::now();
        if let Err(err) = inner.send_envelope(&envelope).await {
            inner.pending.lock().remove(&id);
            inner.record(|| MetricsEvent::RequestFinished {
                method: method.to_owned(),
                elapsed: started.elapsed(),
                ok: false,
            });
            return Err(err);
        }

        let limit = timeout.unwrap_or(inner.default_timeout);
        let outcome = match tokio::time::timeout(limit, rx).await {
            Ok(Ok(result)) => result,
            // The channel closed and dropped the pending entry mid-flight.
            Ok(Err(_)) => Err(ChannelError::Closed),
            Err(_) => {
                inner.pending.lock().remove(&id);
                Err(ChannelError::Timeout {
                    during: "request",
                    after: limit,
                })
            }
        };
        inner.record(|| MetricsEvent::RequestFinished {
            method: method.to_owned(),
            elapsed: started.elapsed(),
            ok: outcome.is_ok(),
        });
        outcome
    }

    /// Fire-and-forget notification; resolves once the write drained.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ChannelError> {
        if !self.is_connected() {
            return Err(ChannelError::state("channel is not started"));
        }
        let envelope = self.inner.protocol.create_notification(method, params);
        self.inner.send_envelope(&envelope).await?;
        self.inner.record(|| MetricsEvent::NotificationSent {
            method: method.to_owned(),
        });
        Ok(())
    }

    /// Register a request handler.
    ///
    /// Multiple handlers may be registered; only the first replies, the
    /// rest observe.
    pub fn on_request(
        &self,
        handler: impl Fn(IncomingRequest) -> BoxFuture<'static, Result<Value, ErrorObject>>
        + Send
        + Sync
        + 'static,
    ) -> Subscription {
        let id = self.inner.next_handler_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .request_handlers
            .lock()
            .push((id, Arc::new(handler)));

        let weak = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.request_handlers.lock().retain(|(hid, _)| *hid != id);
            }
        })
    }

    /// Register a notification handler.
    ///
    /// The first registration drains the early-notification buffer to the
    /// new handler, oldest first, before any later notification reaches it.
    pub fn on_notification(
        &self,
        handler: impl Fn(&str, Option<&Value>) + Send + Sync + 'static,
    ) -> Subscription {
        let handler: NotificationHandler = Arc::new(handler);
        let id = self.inner.next_handler_id.fetch_add(1, Ordering::Relaxed);

        {
            // Held across the drain so a concurrently arriving notification
            // cannot overtake the buffered ones.
            let mut handlers = self.inner.notification_handlers.lock();
            let first = handlers.is_empty();
            handlers.push((id, Arc::clone(&handler)));
            if first {
                let drained: Vec<_> =
                    self.inner.early_notifications.lock().drain(..).collect();
                for (method, params) in &drained {
                    handler(method, params.as_ref());
                }
            }
        }

        let weak = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner
                    .notification_handlers
                    .lock()
                    .retain(|(hid, _)| *hid != id);
            }
        })
    }

    fn spawn_reader(&self) {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        *self.inner.stop.lock() = Some(stop_tx);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    chunk = inner.transport.recv() => match chunk {
                        Ok(Some(bytes)) => {
                            if !inner.process_chunk(bytes).await {
                                break;
                            }
                        }
                        Ok(None) => {
                            inner.shutdown(None).await;
                            break;
                        }
                        Err(err) => {
                            inner.shutdown(Some(err)).await;
                            break;
                        }
                    },
                }
            }
        });
    }
}

impl ChannelInner {
    /// Receive pipeline for one delivered transport chunk. Returns `false`
    /// once the channel closed and dispatch must stop.
    async fn process_chunk(&self, chunk: Bytes) -> bool {
        let decoded = {
            let mut framing = self.framing.lock();
            framing.decode(chunk)
        };
        let payloads = match decoded {
            Ok(payloads) => payloads,
            Err(err) => {
                // A broken frame boundary poisons the byte stream; no
                // later payload in it can be trusted.
                self.shutdown(Some(err)).await;
                return false;
            }
        };

        // The flood cap is per delivered chunk; each chunk starts at zero.
        let mut delivered = 0usize;
        for payload in payloads {
            if let Some(cap) = self.max_inbound_frames {
                if delivered >= cap {
                    self.shutdown(Some(ChannelError::state(format!(
                        "more than {cap} frames in one inbound chunk"
                    ))))
                    .await;
                    return false;
                }
            }
            delivered += 1;
            self.record(|| MetricsEvent::PayloadReceived {
                bytes: payload.len(),
            });

            let value = match self.serializer.deserialize(&payload) {
                Ok(value) => value,
                Err(err) => {
                    // One poisoned message does not silence the channel.
                    self.emit_error(&err);
                    continue;
                }
            };

            match self.protocol.parse_message(&value) {
                ChannelMessage::Invalid { reason } => {
                    self.emit_error(&ChannelError::protocol(reason));
                }
                ChannelMessage::Response { raw } => self.handle_response(raw),
                ChannelMessage::Request { id, method, params } => {
                    self.handle_request(id, method, params, &value).await;
                }
                ChannelMessage::Notification { method, params } => {
                    self.handle_notification(method, params);
                }
            }
        }
        true
    }

    fn handle_response(&self, raw: Value) {
        self.run_middleware("on_incoming_response", |m| m.on_incoming_response(&raw));

        let Some(id) = self.accessor.id(&raw) else {
            self.emit_error(&ChannelError::protocol("response without a usable id"));
            return;
        };
        let Some(entry) = self.pending.lock().remove(&id) else {
            tracing::debug!(%id, "unsolicited response discarded");
            return;
        };

        let outcome = if self.accessor.is_error(&raw) {
            match self.accessor.error(&raw) {
                Some(error) => Err(ChannelError::peer(error)),
                None => Err(ChannelError::protocol(
                    "error response with a malformed error body",
                )),
            }
        } else {
            Ok(self.accessor.result(&raw).unwrap_or(Value::Null))
        };
        tracing::trace!(%id, method = %entry.method, ok = outcome.is_ok(), "response correlated");
        let _ = entry.tx.send(outcome);
    }

    async fn handle_request(
        &self,
        id: MessageId,
        method: String,
        params: Option<Value>,
        envelope: &Value,
    ) {
        self.run_middleware("on_incoming_request", |m| m.on_incoming_request(envelope));

        let handlers: Vec<RequestHandler> = self
            .request_handlers
            .lock()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        let response = if handlers.is_empty() {
            self.protocol.create_error_response(
                &id,
                &ErrorObject::new(
                    CODE_METHOD_NOT_FOUND,
                    format!("no handler registered for method {method:?}"),
                ),
            )
        } else {
            let request = IncomingRequest {
                id: id.clone(),
                method: method.clone(),
                params: params.clone(),
            };
            let outcome = AssertUnwindSafe(handlers[0](request)).catch_unwind().await;

            for handler in &handlers[1..] {
                let observed = IncomingRequest {
                    id: id.clone(),
                    method: method.clone(),
                    params: params.clone(),
                };
                let _ = AssertUnwindSafe(handler(observed)).catch_unwind().await;
            }

            match outcome {
                Ok(Ok(result)) => self.protocol.create_response(&id, result),
                Ok(Err(error)) => self.protocol.create_error_response(&id, &error),
                Err(_panic) => self.protocol.create_error_response(
                    &id,
                    &ErrorObject::new(CODE_INTERNAL_ERROR, "request handler panicked"),
                ),
            }
        };

        self.run_middleware("on_outgoing_response", |m| m.on_outgoing_response(&response));
        if let Err(err) = self.send_envelope(&response).await {
            self.emit_error(&err);
        }
    }

    fn handle_notification(&self, method: String, params: Option<Value>) {
        let handlers = self.notification_handlers.lock();
        if handlers.is_empty() {
            if self.early_capacity == 0 {
                return;
            }
            let mut buffer = self.early_notifications.lock();
            if buffer.len() == self.early_capacity {
                buffer.pop_front();
            }
            buffer.push_back((method, params));
            return;
        }
        for (_, handler) in handlers.iter() {
            handler(&method, params.as_ref());
        }
    }

    async fn send_envelope(&self, envelope: &Value) -> Result<(), ChannelError> {
        let bytes = self.serializer.serialize(envelope)?;
        let framed = self.framing.lock().encode(&bytes);
        // One write at a time; framed bytes must not interleave.
        let _gate = self.write_gate.lock().await;
        self.transport.write(framed).await
    }

    async fn shutdown(&self, error: Option<ChannelError>) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(err) = &error {
            self.emit_error(err);
        }

        if let Some(stop) = self.stop.lock().take() {
            let _ = stop.send(true);
        }
        if let Some(sub) = self.transport_error_sub.lock().take() {
            sub.cancel();
        }

        let entries: Vec<PendingEntry> = self
            .pending
            .lock()
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in entries {
            let _ = entry.tx.send(Err(ChannelError::Closed));
        }

        self.framing.lock().reset();
        let _ = self.transport.disconnect().await;

        self.events.emit(&ChannelEvent::Close);
        self.request_handlers.lock().clear();
        self.notification_handlers.lock().clear();
        self.early_notifications.lock().clear();
        tracing::debug!("channel closed");
    }

    fn emit_error(&self, err: &ChannelError) {
        tracing::warn!(error = %err, "channel error");
        self.run_middleware("on_error", |m| m.on_error(err));
        self.record(|| MetricsEvent::Error {
            kind: error_kind(err),
        });
        self.events.emit(&ChannelEvent::Error(err.clone()));
    }

    fn run_middleware(
        &self,
        hook: &'static str,
        f: impl Fn(&dyn Middleware) -> Result<(), BoxError>,
    ) {
        for middleware in &self.middleware {
            if let Err(err) = f(middleware.as_ref()) {
                match &self.diagnostics {
                    Some(sink) => sink(hook, err),
                    None => tracing::warn!(hook, error = %err, "middleware hook failed"),
                }
            }
        }
    }

    fn record(&self, event: impl FnOnce() -> MetricsEvent) {
        if let Some(metrics) = &self.metrics {
            metrics.record(event());
        }
    }
}

fn error_kind(err: &ChannelError) -> &'static str {
    match err {
        ChannelError::Transport(_) => "transport",
        ChannelError::Framing(_) => "framing",
        ChannelError::Serialization(_) => "serialization",
        ChannelError::Protocol(_) => "protocol",
        ChannelError::Peer { .. } => "peer",
        ChannelError::Timeout { .. } => "timeout",
        ChannelError::State(_) => "state",
        ChannelError::Closed => "closed",
        ChannelError::Shutdown(_) => "shutdown",
    }
}
