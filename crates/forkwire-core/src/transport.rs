//! Transport enum and backends.
//!
//! The public API is the [`Transport`] enum; each backend lives in its own
//! module under `transport/` as an `Arc`-shared handle. Backends expose the
//! same surface: an explicit `connect`/`disconnect` lifecycle, ordered
//! writes, a pull-based `recv`, and an event hub for state changes and
//! out-of-band diagnostics (the child's stderr).

use bytes::Bytes;

use crate::{ChannelError, EventHub};

mod server;
mod socket;
mod stdio;

pub use server::SocketServer;
pub use socket::SocketTransport;
pub use stdio::{CommandSpec, StdioTransport};

/// Connection lifecycle of a transport.
///
/// Transitions are linear within one life:
/// `Disconnected -> Connecting -> Connected -> Closed`, with any failure
/// detouring through `Error` before `Closed`. A reconnect begins a new life
/// from `Error`, `Closed`, or `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
    Error,
    Closed,
}

/// Out-of-band transport events.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    Error(String),
    /// One line from the child's stderr. Stdio transport only; stderr is
    /// never surfaced as channel data.
    Stderr(String),
}

/// A bidirectional byte stream between this process and a peer.
#[derive(Clone)]
pub enum Transport {
    /// Spawned child process, bytes over its stdin/stdout.
    Stdio(StdioTransport),
    /// Local-socket client (Unix socket or Windows named pipe), or an
    /// accepted server-side connection.
    Socket(SocketTransport),
}

impl Transport {
    /// Transport that will spawn `spec` as a child on connect.
    pub fn child(spec: CommandSpec) -> Self {
        Self::Stdio(StdioTransport::new(spec))
    }

    /// Transport that will connect to a local-socket endpoint.
    pub fn socket_client(endpoint: impl Into<String>) -> Self {
        Self::Socket(SocketTransport::client(endpoint))
    }

    /// Worker-side transport over this process's own stdin/stdout. The
    /// counterpart of [`Transport::child`] inside the spawned worker.
    pub fn worker_stdio() -> Self {
        Self::Socket(SocketTransport::from_stdio())
    }

    /// Connected in-memory pair, for tests and in-process wiring.
    pub fn socket_pair() -> (Self, Self) {
        let (a, b) = SocketTransport::pair();
        (Self::Socket(a), Self::Socket(b))
    }

    pub async fn connect(&self) -> Result<(), ChannelError> {
        match self {
            Self::Stdio(t) => t.connect().await,
            Self::Socket(t) => t.connect().await,
        }
    }

    /// Flush buffered writes best-effort, then release the endpoint.
    pub async fn disconnect(&self) -> Result<(), ChannelError> {
        match self {
            Self::Stdio(t) => t.disconnect().await,
            Self::Socket(t) => t.disconnect().await,
        }
    }

    /// Write `bytes` to the peer. Fails unless connected. Writes from one
    /// task are flushed in submission order.
    pub async fn write(&self, bytes: Bytes) -> Result<(), ChannelError> {
        match self {
            Self::Stdio(t) => t.write(bytes).await,
            Self::Socket(t) => t.write(bytes).await,
        }
    }

    /// Pull the next chunk of bytes. `Ok(None)` is a clean end of stream.
    pub async fn recv(&self) -> Result<Option<Bytes>, ChannelError> {
        match self {
            Self::Stdio(t) => t.recv().await,
            Self::Socket(t) => t.recv().await,
        }
    }

    pub fn state(&self) -> TransportState {
        match self {
            Self::Stdio(t) => t.state(),
            Self::Socket(t) => t.state(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == TransportState::Connected
    }

    pub fn events(&self) -> &EventHub<TransportEvent> {
        match self {
            Self::Stdio(t) => t.events(),
            Self::Socket(t) => t.events(),
        }
    }

    /// The stdio backend, when this transport wraps a child process.
    pub fn as_stdio(&self) -> Option<&StdioTransport> {
        match self {
            Self::Stdio(t) => Some(t),
            Self::Socket(_) => None,
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdio(_) => f.debug_struct("Transport::Stdio").finish_non_exhaustive(),
            Self::Socket(_) => f.debug_struct("Transport::Socket").finish_non_exhaustive(),
        }
    }
}
