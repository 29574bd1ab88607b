use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};

use forkwire_core::{ChannelError, ChannelEvent, EventHub, Transport};
use forkwire_wire::{DEFAULT_MAX_PAYLOAD, Frame, FrameFlags, FrameHeader, METHOD_ID_ABORT, Reassembler};

/// Which side of the parent/child pair this endpoint is. Children set the
/// direction flag on everything they send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataRole {
    Parent,
    Child,
}

#[derive(Debug, Clone)]
pub struct DataOptions {
    pub max_payload: u32,
    pub request_timeout: Duration,
}

impl Default for DataOptions {
    fn default() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Handler for inbound data-plane requests: `(method_id, payload)` in,
/// response payload or error text out.
pub type DataRequestHandler =
    Arc<dyn Fn(u16, Bytes) -> BoxFuture<'static, Result<Bytes, String>> + Send + Sync>;

enum Pending {
    Unary {
        tx: oneshot::Sender<Result<Bytes, ChannelError>>,
        accum: Vec<Bytes>,
    },
    Stream {
        tx: mpsc::UnboundedSender<Result<Bytes, ChannelError>>,
    },
}

/// High-throughput binary channel: 11-byte frame headers straight over a
/// local socket, no envelope or serialization layer in between.
///
/// Request/response correlation runs on the header's `request_id`;
/// streamed responses arrive chunk-by-chunk; `0xFFFF` aborts cancel an
/// in-flight request on both ends.
#[derive(Clone)]
pub struct DataChannel {
    inner: Arc<DataInner>,
}

struct DataInner {
    transport: Transport,
    role: DataRole,
    options: DataOptions,
    connected: AtomicBool,
    next_request_id: AtomicU32,
    pending: Mutex<HashMap<u32, Pending>>,
    handler: Mutex<Option<DataRequestHandler>>,
    events: EventHub<ChannelEvent>,
    write_gate: tokio::sync::Mutex<()>,
    stop: Mutex<Option<watch::Sender<bool>>>,
}

impl DataChannel {
    pub fn new(transport: Transport, role: DataRole, options: DataOptions) -> Self {
        Self {
            inner: Arc::new(DataInner {
                transport,
                role,
                options,
                connected: AtomicBool::new(false),
                next_request_id: AtomicU32::new(0),
                pending: Mutex::new(HashMap::new()),
                handler: Mutex::new(None),
                events: EventHub::new(),
                write_gate: tokio::sync::Mutex::new(()),
                stop: Mutex::new(None),
            }),
        }
    }

    pub fn events(&self) -> &EventHub<ChannelEvent> {
        &self.inner.events
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Serve inbound requests. Replaces any previous handler.
    pub fn set_request_handler(
        &self,
        handler: impl Fn(u16, Bytes) -> BoxFuture<'static, Result<Bytes, String>> + Send + Sync + 'static,
    ) {
        *self.inner.handler.lock() = Some(Arc::new(handler));
    }

    /// Connect the transport when needed and begin parsing frames.
    pub async fn start(&self) -> Result<(), ChannelError> {
        if self.is_connected() {
            return Err(ChannelError::state("data channel already started"));
        }
        if !self.inner.transport.is_connected() {
            self.inner.transport.connect().await?;
        }
        self.inner.connected.store(true, Ordering::Release);
        self.spawn_reader();
        self.inner.events.emit(&ChannelEvent::Start);
        Ok(())
    }

    /// Unary request. Streamed responses are concatenated; an ack resolves
    /// empty.
    pub async fn request(
        &self,
        method_id: u16,
        payload: Bytes,
        timeout: Option<Duration>,
    ) -> Result<Bytes, ChannelError> {
        let id = self.begin_request(method_id, payload.len())?;
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(
            id,
            Pending::Unary {
                tx,
                accum: Vec::new(),
            },
        );

        if let Err(err) = self.write_frame(method_id, id, FrameFlags::empty(), payload).await {
            self.inner.pending.lock().remove(&id);
            return Err(err);
        }

        let limit = timeout.unwrap_or(self.inner.options.request_timeout);
        match tokio::time::timeout(limit, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ChannelError::Closed),
            Err(_) => {
                self.inner.pending.lock().remove(&id);
                Err(ChannelError::Timeout {
                    during: "data request",
                    after: limit,
                })
            }
        }
    }

    /// Request whose response chunks are surfaced as they arrive. The
    /// receiver ends after the terminal chunk or an error.
    pub async fn request_stream(
        &self,
        method_id: u16,
        payload: Bytes,
    ) -> Result<(u32, mpsc::UnboundedReceiver<Result<Bytes, ChannelError>>), ChannelError> {
        let id = self.begin_request(method_id, payload.len())?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.pending.lock().insert(id, Pending::Stream { tx });

        if let Err(err) = self.write_frame(method_id, id, FrameFlags::empty(), payload).await {
            self.inner.pending.lock().remove(&id);
            return Err(err);
        }
        Ok((id, rx))
    }

    /// Fire-and-forget frame (`request_id` 0).
    pub async fn send(&self, method_id: u16, payload: Bytes) -> Result<(), ChannelError> {
        self.check_sendable(method_id, payload.len())?;
        self.write_frame(method_id, 0, FrameFlags::empty(), payload).await
    }

    /// Abort an in-flight request: tells the peer to stop and rejects the
    /// local pending entry.
    pub async fn abort(&self, request_id: u32) -> Result<(), ChannelError> {
        if let Some(entry) = self.inner.pending.lock().remove(&request_id) {
            reject(entry, ChannelError::state("request aborted"));
        }
        self.write_frame(METHOD_ID_ABORT, request_id, FrameFlags::empty(), Bytes::new())
            .await
    }

    /// Stop parsing, reject every pending request, release the transport.
    pub async fn close(&self) {
        if !self.inner.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(stop) = self.inner.stop.lock().take() {
            let _ = stop.send(true);
        }
        let entries: Vec<Pending> = self
            .inner
            .pending
            .lock()
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in entries {
            reject(entry, ChannelError::Closed);
        }
        let _ = self.inner.transport.disconnect().await;
        self.inner.events.emit(&ChannelEvent::Close);
    }

    fn check_sendable(&self, method_id: u16, payload_len: usize) -> Result<(), ChannelError> {
        if !self.is_connected() {
            return Err(ChannelError::state("data channel is not started"));
        }
        if method_id == 0 || method_id == METHOD_ID_ABORT {
            return Err(ChannelError::state(format!(
                "method id {method_id:#06x} is reserved"
            )));
        }
        if payload_len as u64 > u64::from(self.inner.options.max_payload) {
            return Err(ChannelError::state(format!(
                "payload of {payload_len} bytes exceeds the {} byte limit",
                self.inner.options.max_payload
            )));
        }
        Ok(())
    }

    fn begin_request(&self, method_id: u16, payload_len: usize) -> Result<u32, ChannelError> {
        self.check_sendable(method_id, payload_len)?;
        Ok(self.inner.next_request_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1))
    }

    async fn write_frame(
        &self,
        method_id: u16,
        request_id: u32,
        extra: FrameFlags,
        payload: Bytes,
    ) -> Result<(), ChannelError> {
        self.inner
            .write_header_and_payload(method_id, request_id, extra, payload)
            .await
    }

    fn spawn_reader(&self) {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        *self.inner.stop.lock() = Some(stop_tx);

        let inner = Arc::clone(&self.inner);
        let channel = self.clone();
        tokio::spawn(async move {
            let mut reassembler = Reassembler::with_max_payload(inner.options.max_payload);
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    chunk = inner.transport.recv() => {
                        let frames = match chunk {
                            Ok(Some(bytes)) => match reassembler.push(bytes) {
                                Ok(frames) => frames,
                                Err(err) => {
                                    channel.close_with_error(err.into()).await;
                                    break;
                                }
                            },
                            Ok(None) => {
                                channel.close().await;
                                break;
                            }
                            Err(err) => {
                                channel.close_with_error(err).await;
                                break;
                            }
                        };
                        for frame in frames {
                            inner.handle_frame(frame).await;
                        }
                    }
                }
            }
        });
    }

    async fn close_with_error(&self, err: ChannelError) {
        self.inner.events.emit(&ChannelEvent::Error(err));
        self.close().await;
    }
}

impl DataInner {
    async fn handle_frame(&self, frame: Frame) {
        let header = frame.header;

        if header.is_abort() {
            if let Some(entry) = self.pending.lock().remove(&header.request_id) {
                reject(entry, ChannelError::protocol("request aborted by peer"));
            }
            return;
        }

        if header.flags.contains(FrameFlags::RESPONSE) {
            self.handle_response(header, frame);
            return;
        }

        // Inbound request or fire-and-forget frame.
        let handler = self.handler.lock().clone();
        let Some(handler) = handler else {
            if header.request_id != 0 {
                let _ = self
                    .write_header_and_payload(
                        header.method_id,
                        header.request_id,
                        FrameFlags::RESPONSE | FrameFlags::ERROR,
                        Bytes::from_static(b"no data handler registered"),
                    )
                    .await;
            }
            return;
        };

        let result = handler(header.method_id, frame.payload_bytes()).await;
        if header.request_id == 0 {
            return;
        }
        let (flags, payload) = match result {
            Ok(payload) => (FrameFlags::RESPONSE, payload),
            Err(message) => (FrameFlags::RESPONSE | FrameFlags::ERROR, Bytes::from(message)),
        };
        if let Err(err) = self
            .write_header_and_payload(header.method_id, header.request_id, flags, payload)
            .await
        {
            tracing::warn!(error = %err, "failed to write data response");
        }
    }

    fn handle_response(&self, header: FrameHeader, frame: Frame) {
        let mut pending = self.pending.lock();
        let Some(entry) = pending.get_mut(&header.request_id) else {
            tracing::debug!(request_id = header.request_id, "unsolicited data response");
            return;
        };

        if header.flags.contains(FrameFlags::ERROR) {
            let message = String::from_utf8_lossy(&frame.payload_bytes()).into_owned();
            let entry = pending.remove(&header.request_id).expect("entry exists");
            drop(pending);
            reject(
                entry,
                ChannelError::Peer {
                    code: -32000,
                    message,
                    data: None,
                },
            );
            return;
        }

        if header.flags.contains(FrameFlags::ACK) {
            let entry = pending.remove(&header.request_id).expect("entry exists");
            drop(pending);
            resolve(entry, Bytes::new());
            return;
        }

        if header.flags.contains(FrameFlags::STREAM) {
            let ended = header.flags.contains(FrameFlags::STREAM_END);
            match entry {
                Pending::Unary { accum, .. } => {
                    accum.extend(frame.into_chunks());
                    if ended {
                        let Pending::Unary { tx, accum } =
                            pending.remove(&header.request_id).expect("entry exists")
                        else {
                            unreachable!("entry kind checked above");
                        };
                        drop(pending);
                        let total = Frame::new(header, accum).payload_bytes();
                        let _ = tx.send(Ok(total));
                    }
                }
                Pending::Stream { tx } => {
                    let _ = tx.send(Ok(frame.payload_bytes()));
                    if ended {
                        pending.remove(&header.request_id);
                    }
                }
            }
            return;
        }

        // Plain single-frame response.
        let entry = pending.remove(&header.request_id).expect("entry exists");
        drop(pending);
        resolve(entry, frame.payload_bytes());
    }

    async fn write_header_and_payload(
        &self,
        method_id: u16,
        request_id: u32,
        extra: FrameFlags,
        payload: Bytes,
    ) -> Result<(), ChannelError> {
        let mut header = FrameHeader::new(method_id, request_id);
        header.flags = extra;
        if self.role == DataRole::Child {
            header.flags |= FrameFlags::TO_PARENT;
        }
        header.payload_len = payload.len() as u32;

        // Header and payload under one gate so frames never interleave.
        let _gate = self.write_gate.lock().await;
        self.transport
            .write(Bytes::copy_from_slice(&header.encode()))
            .await?;
        if !payload.is_empty() {
            self.transport.write(payload).await?;
        }
        Ok(())
    }
}

fn reject(entry: Pending, err: ChannelError) {
    match entry {
        Pending::Unary { tx, .. } => {
            let _ = tx.send(Err(err));
        }
        Pending::Stream { tx } => {
            let _ = tx.send(Err(err));
        }
    }
}

fn resolve(entry: Pending, payload: Bytes) {
    match entry {
        Pending::Unary { tx, .. } => {
            let _ = tx.send(Ok(payload));
        }
        Pending::Stream { tx } => {
            let _ = tx.send(Ok(payload));
        }
    }
}
