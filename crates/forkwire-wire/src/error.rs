use thiserror::Error;

/// Errors produced by header decoding, validation, and frame reassembly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// Input was too short to contain a full header.
    #[error("truncated header: expected {expected} bytes, got {actual}")]
    TruncatedHeader { expected: usize, actual: usize },

    /// `method_id` 0 is reserved and never valid on the wire.
    #[error("method id 0 is reserved")]
    ReservedMethodId,

    /// Reserved flag bits (6-7) were set.
    #[error("reserved flag bits set: {bits:#04x}")]
    ReservedFlags { bits: u8 },

    /// Declared payload length exceeds the effective limit.
    #[error("payload too large: {len} bytes exceeds limit of {max}")]
    PayloadTooLarge { len: u32, max: u32 },

    /// A stream sink was installed while a partial frame was buffered.
    #[error("cannot install stream sink: partial frame buffered")]
    SinkRearm,
}
