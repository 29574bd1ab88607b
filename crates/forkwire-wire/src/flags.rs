use bitflags::bitflags;

bitflags! {
    /// Frame flag byte (header offset 2).
    ///
    /// Bits 6-7 are reserved and must be zero on the wire; see
    /// [`crate::FrameHeader::validate`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FrameFlags: u8 {
        /// Frame flows child -> parent.
        const TO_PARENT = 1 << 0;
        /// Frame is a reply to `request_id`.
        const RESPONSE = 1 << 1;
        /// Response carries an error payload.
        const ERROR = 1 << 2;
        /// Response is one chunk of a stream.
        const STREAM = 1 << 3;
        /// Terminal stream chunk.
        const STREAM_END = 1 << 4;
        /// Acknowledgement-only response.
        const ACK = 1 << 5;
    }
}

/// Mask of the reserved flag bits.
pub const RESERVED_FLAG_BITS: u8 = 0b1100_0000;
