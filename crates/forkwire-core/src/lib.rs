//! Core channel stack for forkwire: transports, framing codecs, the
//! serialization and protocol seams, and the channel engine that composes
//! them into a request/response/notification pipe between two processes.
//!
//! The layering, bottom up:
//!
//! 1. [`Transport`] — a bidirectional byte stream (child stdio, local
//!    socket client, or an accepted server connection).
//! 2. [`FramingCodec`] — byte-frame boundaries for text envelopes
//!    (length-prefixed or delimiter-separated).
//! 3. [`Serializer`] — value <-> bytes. JSON ships; other codecs plug in.
//! 4. [`Protocol`] — the structured envelope (JSON-RPC 2.0 or the simple
//!    tagged shape).
//! 5. [`Channel`] — request correlation, timeouts, middleware, inbound
//!    limits, and graceful close.

mod channel;
mod codec;
mod endpoint;
mod error;
mod events;
mod framing;
mod middleware;
mod protocol;
mod transport;

pub use channel::*;
pub use codec::*;
pub use endpoint::*;
pub use error::*;
pub use events::*;
pub use framing::*;
pub use middleware::*;
pub use protocol::*;
pub use transport::*;
