use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::protocol::ErrorObject;

/// Errors surfaced by the channel stack.
///
/// Every variant maps to one failure domain: the byte stream, the frame
/// boundary, the codec, the envelope, a deadline, or an operation attempted
/// in the wrong state. Callers of [`crate::Channel::request`] observe
/// exactly one of these or a successful result; a pending request is never
/// silently dropped.
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    /// The byte stream failed to connect, read, or write.
    #[error("transport error: {0}")]
    Transport(String),

    /// A frame boundary could not be decoded, or a length prefix exceeded
    /// the configured cap.
    #[error("framing error: {0}")]
    Framing(String),

    /// Bytes did not round-trip under the configured codec.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The envelope parsed but is semantically invalid.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer answered with an error response.
    #[error("peer error {code}: {message}")]
    Peer {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    /// A deadline passed before the operation completed.
    #[error("{during} timed out after {after:?}")]
    Timeout { during: &'static str, after: Duration },

    /// An operation was attempted in a state that forbids it.
    #[error("invalid state: {0}")]
    State(String),

    /// The channel was closed while the operation was in flight.
    #[error("channel closed")]
    Closed,

    /// A shutdown flow could not complete within its budget.
    #[error("shutdown error: {0}")]
    Shutdown(String),
}

impl ChannelError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }

    pub fn framing(err: impl std::fmt::Display) -> Self {
        Self::Framing(err.to_string())
    }

    pub fn serialization(err: impl std::fmt::Display) -> Self {
        Self::Serialization(err.to_string())
    }

    pub fn protocol(err: impl std::fmt::Display) -> Self {
        Self::Protocol(err.to_string())
    }

    pub fn state(err: impl std::fmt::Display) -> Self {
        Self::State(err.to_string())
    }

    pub fn peer(error: ErrorObject) -> Self {
        Self::Peer {
            code: error.code,
            message: error.message,
            data: error.data,
        }
    }

    /// Whether this error is a request timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<std::io::Error> for ChannelError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<forkwire_wire::WireError> for ChannelError {
    fn from(err: forkwire_wire::WireError) -> Self {
        Self::Framing(err.to_string())
    }
}

impl From<serde_json::Error> for ChannelError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
