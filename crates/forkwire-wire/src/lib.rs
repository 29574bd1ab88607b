//! Binary wire format for the forkwire data plane.
//!
//! A frame on the wire is an 11-byte big-endian header followed by
//! `payload_len` payload bytes. [`FrameHeader`] handles encode/decode and
//! validation, [`Reassembler`] turns arbitrary byte chunks back into frames,
//! either collected ([`Reassembler::push`]) or streamed through a
//! [`StreamSink`] without buffering whole payloads.

mod error;
mod flags;
mod frame;
mod header;
mod limits;
mod reassembler;

pub use error::*;
pub use flags::*;
pub use frame::*;
pub use header::*;
pub use limits::*;
pub use reassembler::*;
