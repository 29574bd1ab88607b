use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;

use crate::{ChannelError, EventHub, TransportEvent, TransportState};

const READ_CHUNK: usize = 8 * 1024;

type Reader = Box<dyn AsyncRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Local-socket transport.
///
/// Connects to a filesystem-bound stream socket (Unix) or a named pipe
/// (Windows), or wraps any already-connected byte stream via
/// [`SocketTransport::from_stream`] / [`SocketTransport::pair`].
#[derive(Clone)]
pub struct SocketTransport {
    inner: Arc<SocketInner>,
}

struct SocketInner {
    endpoint: Option<String>,
    state: Mutex<TransportState>,
    events: EventHub<TransportEvent>,
    reader: AsyncMutex<Option<Reader>>,
    writer: AsyncMutex<Option<Writer>>,
}

impl SocketTransport {
    /// Client for `endpoint`; call [`connect`](Self::connect) to dial.
    pub fn client(endpoint: impl Into<String>) -> Self {
        Self::build(Some(endpoint.into()), None)
    }

    /// Wrap an already-connected stream (an accepted server connection, a
    /// duplex pipe in tests).
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::build(None, Some((Box::new(reader) as Reader, Box::new(writer) as Writer)))
    }

    /// Wrap separate read and write halves, such as a process's own
    /// stdin/stdout.
    pub fn from_split<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::build(None, Some((Box::new(reader), Box::new(writer))))
    }

    /// Worker side of a control channel: this process's own stdio.
    pub fn from_stdio() -> Self {
        Self::from_split(tokio::io::stdin(), tokio::io::stdout())
    }

    /// Connected in-memory pair.
    pub fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (Self::from_stream(a), Self::from_stream(b))
    }

    fn build(endpoint: Option<String>, halves: Option<(Reader, Writer)>) -> Self {
        let connected = halves.is_some();
        let (reader, writer) = match halves {
            Some((r, w)) => (Some(r), Some(w)),
            None => (None, None),
        };
        Self {
            inner: Arc::new(SocketInner {
                endpoint,
                state: Mutex::new(if connected {
                    TransportState::Connected
                } else {
                    TransportState::Disconnected
                }),
                events: EventHub::new(),
                reader: AsyncMutex::new(reader),
                writer: AsyncMutex::new(writer),
            }),
        }
    }

    pub fn state(&self) -> TransportState {
        *self.inner.state.lock()
    }

    pub fn events(&self) -> &EventHub<TransportEvent> {
        &self.inner.events
    }

    /// The endpoint this client dials, when one was configured.
    pub fn endpoint(&self) -> Option<&str> {
        self.inner.endpoint.as_deref()
    }

    /// Dial the configured endpoint.
    ///
    /// Callable again after an error or disconnect; each successful call
    /// starts a fresh connection life.
    pub async fn connect(&self) -> Result<(), ChannelError> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                TransportState::Connected | TransportState::Connecting => {
                    return Err(ChannelError::state("transport already connected"));
                }
                _ => *state = TransportState::Connecting,
            }
        }

        let Some(endpoint) = self.inner.endpoint.as_deref() else {
            *self.inner.state.lock() = TransportState::Error;
            return Err(ChannelError::state(
                "stream-wrapped transport cannot reconnect",
            ));
        };

        match Self::dial(endpoint).await {
            Ok((reader, writer)) => {
                *self.inner.reader.lock().await = Some(reader);
                *self.inner.writer.lock().await = Some(writer);
                *self.inner.state.lock() = TransportState::Connected;
                self.inner.events.emit(&TransportEvent::Connected);
                tracing::debug!(endpoint, "socket connected");
                Ok(())
            }
            Err(err) => {
                *self.inner.state.lock() = TransportState::Error;
                let err = ChannelError::transport(format!("connect to {endpoint}: {err}"));
                self.inner.events.emit(&TransportEvent::Error(err.to_string()));
                Err(err)
            }
        }
    }

    #[cfg(unix)]
    async fn dial(endpoint: &str) -> std::io::Result<(Reader, Writer)> {
        let stream = tokio::net::UnixStream::connect(endpoint).await?;
        let (reader, writer) = tokio::io::split(stream);
        Ok((Box::new(reader), Box::new(writer)))
    }

    #[cfg(windows)]
    async fn dial(endpoint: &str) -> std::io::Result<(Reader, Writer)> {
        let pipe = tokio::net::windows::named_pipe::ClientOptions::new().open(endpoint)?;
        let (reader, writer) = tokio::io::split(pipe);
        Ok((Box::new(reader), Box::new(writer)))
    }

    pub async fn write(&self, bytes: Bytes) -> Result<(), ChannelError> {
        if self.state() != TransportState::Connected {
            return Err(ChannelError::state("write on a transport that is not connected"));
        }
        let mut writer = self.inner.writer.lock().await;
        let Some(writer) = writer.as_mut() else {
            return Err(ChannelError::state("socket writer already released"));
        };
        if let Err(err) = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        }
        .await
        {
            self.fail(&err);
            return Err(err.into());
        }
        Ok(())
    }

    pub async fn recv(&self) -> Result<Option<Bytes>, ChannelError> {
        let mut reader = self.inner.reader.lock().await;
        let Some(inner) = reader.as_mut() else {
            return Ok(None);
        };
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        match inner.read_buf(&mut buf).await {
            Ok(0) => {
                drop(reader);
                self.close_state();
                Ok(None)
            }
            Ok(_) => Ok(Some(buf.freeze())),
            Err(err) => {
                drop(reader);
                self.fail(&err);
                Err(err.into())
            }
        }
    }

    /// Flush pending writes, then release the connection.
    pub async fn disconnect(&self) -> Result<(), ChannelError> {
        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            let _ = writer.flush().await;
            let _ = writer.shutdown().await;
        }
        self.inner.reader.lock().await.take();
        self.close_state();
        Ok(())
    }

    fn fail(&self, err: &std::io::Error) {
        *self.inner.state.lock() = TransportState::Error;
        self.inner
            .events
            .emit(&TransportEvent::Error(err.to_string()));
    }

    fn close_state(&self) {
        let mut state = self.inner.state.lock();
        if *state != TransportState::Closed {
            *state = TransportState::Closed;
            drop(state);
            self.inner.events.emit(&TransportEvent::Disconnected);
        }
    }
}

impl std::fmt::Debug for SocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketTransport")
            .field("endpoint", &self.inner.endpoint)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
