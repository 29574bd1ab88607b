/// Default maximum payload size (1 GiB).
///
/// Can be lowered per reassembler or per validation call; see
/// [`crate::FrameHeader::validate`].
pub const DEFAULT_MAX_PAYLOAD: u32 = 1 << 30;

/// Absolute payload cap (`2^31 - 1` bytes).
///
/// Enforced regardless of any configured limit.
pub const ABSOLUTE_MAX_PAYLOAD: u32 = i32::MAX as u32;
