use bytes::{Buf, Bytes, BytesMut};

use crate::ChannelError;

/// Default cap on a length-prefixed frame (16 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const LENGTH_PREFIX_SIZE: usize = 4;

/// Byte-frame boundaries for text-envelope protocols.
///
/// Two variants: a 4-byte big-endian length prefix, or a trailing delimiter
/// byte (newline by default). Both buffer partial input across
/// [`decode`](FramingCodec::decode) calls until a boundary is seen.
#[derive(Debug)]
pub enum FramingCodec {
    LengthPrefixed {
        max_frame_len: usize,
        buf: BytesMut,
    },
    Delimited {
        delimiter: u8,
        buf: BytesMut,
    },
}

impl FramingCodec {
    /// Length-prefixed framing with the default cap.
    pub fn length_prefixed() -> Self {
        Self::length_prefixed_with_max(DEFAULT_MAX_FRAME_LEN)
    }

    pub fn length_prefixed_with_max(max_frame_len: usize) -> Self {
        Self::LengthPrefixed {
            max_frame_len,
            buf: BytesMut::new(),
        }
    }

    /// Newline-delimited framing.
    pub fn newline_delimited() -> Self {
        Self::delimited(b'\n')
    }

    pub fn delimited(delimiter: u8) -> Self {
        Self::Delimited {
            delimiter,
            buf: BytesMut::new(),
        }
    }

    /// Wrap one payload into its wire frame.
    ///
    /// The delimited variant does not append a second delimiter when the
    /// payload already ends with one.
    pub fn encode(&self, payload: &[u8]) -> Bytes {
        match self {
            Self::LengthPrefixed { .. } => {
                let mut out = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
                out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
                out.extend_from_slice(payload);
                out.freeze()
            }
            Self::Delimited { delimiter, .. } => {
                if payload.last() == Some(delimiter) {
                    Bytes::copy_from_slice(payload)
                } else {
                    let mut out = BytesMut::with_capacity(payload.len() + 1);
                    out.extend_from_slice(payload);
                    out.extend_from_slice(&[*delimiter]);
                    out.freeze()
                }
            }
        }
    }

    /// Absorb one input chunk and yield every payload completed by it.
    pub fn decode(&mut self, chunk: Bytes) -> Result<Vec<Bytes>, ChannelError> {
        match self {
            Self::LengthPrefixed { max_frame_len, buf } => {
                buf.extend_from_slice(&chunk);
                let mut payloads = Vec::new();
                loop {
                    if buf.len() < LENGTH_PREFIX_SIZE {
                        break;
                    }
                    let len =
                        u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
                    if len > *max_frame_len {
                        return Err(ChannelError::Framing(format!(
                            "frame length {len} exceeds cap of {max_frame_len}"
                        )));
                    }
                    if buf.len() < LENGTH_PREFIX_SIZE + len {
                        break;
                    }
                    buf.advance(LENGTH_PREFIX_SIZE);
                    payloads.push(buf.split_to(len).freeze());
                }
                Ok(payloads)
            }
            Self::Delimited { delimiter, buf } => {
                buf.extend_from_slice(&chunk);
                let mut payloads = Vec::new();
                while let Some(at) = buf.iter().position(|b| *b == *delimiter) {
                    let payload = buf.split_to(at).freeze();
                    buf.advance(1);
                    payloads.push(payload);
                }
                Ok(payloads)
            }
        }
    }

    /// Discard any buffered partial frame.
    pub fn reset(&mut self) {
        match self {
            Self::LengthPrefixed { buf, .. } | Self::Delimited { buf, .. } => buf.clear(),
        }
    }

    pub fn has_buffered_data(&self) -> bool {
        self.buffer_len() > 0
    }

    pub fn buffer_len(&self) -> usize {
        match self {
            Self::LengthPrefixed { buf, .. } | Self::Delimited { buf, .. } => buf.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_prefixed_round_trip() {
        let mut codec = FramingCodec::length_prefixed();
        let frame = codec.encode(b"hello");
        assert_eq!(&frame[..4], &5u32.to_be_bytes());
        let payloads = codec.decode(frame).unwrap();
        assert_eq!(payloads, vec![Bytes::from_static(b"hello")]);
    }

    #[test]
    fn length_prefixed_buffers_partial_input() {
        let mut codec = FramingCodec::length_prefixed();
        let frame = codec.encode(b"split me");

        assert!(codec.decode(frame.slice(0..3)).unwrap().is_empty());
        assert!(codec.has_buffered_data());
        assert_eq!(codec.buffer_len(), 3);

        let payloads = codec.decode(frame.slice(3..)).unwrap();
        assert_eq!(payloads, vec![Bytes::from_static(b"split me")]);
        assert!(!codec.has_buffered_data());
    }

    #[test]
    fn length_prefixed_yields_multiple_frames_per_chunk() {
        let mut codec = FramingCodec::length_prefixed();
        let mut wire = BytesMut::new();
        for payload in [b"one".as_slice(), b"two", b"three"] {
            wire.extend_from_slice(&codec.encode(payload));
        }
        let payloads = codec.decode(wire.freeze()).unwrap();
        assert_eq!(payloads.len(), 3);
        assert_eq!(payloads[2], Bytes::from_static(b"three"));
    }

    #[test]
    fn length_prefix_over_cap_is_rejected() {
        let mut codec = FramingCodec::length_prefixed_with_max(8);
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&9u32.to_be_bytes());
        wire.extend_from_slice(&[0u8; 9]);
        let err = codec.decode(wire.freeze()).unwrap_err();
        assert!(matches!(err, ChannelError::Framing(_)));
    }

    #[test]
    fn delimited_round_trip() {
        let mut codec = FramingCodec::newline_delimited();
        let frame = codec.encode(b"{\"a\":1}");
        assert_eq!(frame.last(), Some(&b'\n'));
        let payloads = codec.decode(frame).unwrap();
        assert_eq!(payloads, vec![Bytes::from_static(b"{\"a\":1}")]);
    }

    #[test]
    fn delimited_does_not_double_terminate() {
        let codec = FramingCodec::newline_delimited();
        let frame = codec.encode(b"line\n");
        assert_eq!(frame, Bytes::from_static(b"line\n"));
    }

    #[test]
    fn delimited_carries_tail_across_chunks() {
        let mut codec = FramingCodec::newline_delimited();
        let payloads = codec.decode(Bytes::from_static(b"first\nsec")).unwrap();
        assert_eq!(payloads, vec![Bytes::from_static(b"first")]);
        assert!(codec.has_buffered_data());

        let payloads = codec.decode(Bytes::from_static(b"ond\n")).unwrap();
        assert_eq!(payloads, vec![Bytes::from_static(b"second")]);
        assert_eq!(codec.buffer_len(), 0);
    }

    #[test]
    fn reset_discards_partial_frames() {
        let mut codec = FramingCodec::length_prefixed();
        let frame = codec.encode(b"abandoned");
        codec.decode(frame.slice(0..6)).unwrap();
        codec.reset();
        assert!(!codec.has_buffered_data());

        let frame = codec.encode(b"fresh");
        assert_eq!(
            codec.decode(frame).unwrap(),
            vec![Bytes::from_static(b"fresh")]
        );
    }
}
