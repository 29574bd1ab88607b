use bytes::{Bytes, BytesMut};

use crate::FrameHeader;

/// A complete frame: header plus payload.
///
/// The payload is held as the sequence of chunks it arrived in, so large
/// frames are never copied into one allocation unless a caller asks for a
/// contiguous view. Chunks are owned `Bytes`; once a frame is handed out the
/// reassembler keeps no reference to them.
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: FrameHeader,
    chunks: Vec<Bytes>,
}

impl Frame {
    /// Assemble a frame from already-collected payload chunks.
    pub fn new(header: FrameHeader, chunks: Vec<Bytes>) -> Self {
        Self { header, chunks }
    }

    /// Build a frame around a single contiguous payload, fixing up
    /// `payload_len` to match.
    pub fn from_payload(mut header: FrameHeader, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        header.payload_len = payload.len() as u32;
        let chunks = if payload.is_empty() {
            Vec::new()
        } else {
            vec![payload]
        };
        Self { header, chunks }
    }

    /// Zero-copy view of the payload chunks.
    pub fn payload_chunks(&self) -> &[Bytes] {
        &self.chunks
    }

    /// Total payload length in bytes.
    pub fn payload_len(&self) -> usize {
        self.chunks.iter().map(Bytes::len).sum()
    }

    /// Contiguous view of the payload.
    ///
    /// Concatenates on demand; when the payload is empty or held in exactly
    /// one chunk this is a reference-count bump, not a copy.
    pub fn payload_bytes(&self) -> Bytes {
        match self.chunks.len() {
            0 => Bytes::new(),
            1 => self.chunks[0].clone(),
            _ => {
                let mut buf = BytesMut::with_capacity(self.payload_len());
                for chunk in &self.chunks {
                    buf.extend_from_slice(chunk);
                }
                buf.freeze()
            }
        }
    }

    /// Consume the frame, yielding its payload chunks.
    pub fn into_chunks(self) -> Vec<Bytes> {
        self.chunks
    }

    /// Encode header and payload into a single wire buffer.
    pub fn to_wire(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FrameHeader::WIRE_SIZE + self.payload_len());
        buf.extend_from_slice(&self.header.encode());
        for chunk in &self.chunks {
            buf.extend_from_slice(chunk);
        }
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_chunk_payload_is_returned_unchanged() {
        let chunk = Bytes::from_static(b"hello");
        let frame = Frame::from_payload(FrameHeader::new(1, 1), chunk.clone());
        let payload = frame.payload_bytes();
        assert_eq!(payload, chunk);
        // Same backing storage, not a copy.
        assert_eq!(payload.as_ptr(), chunk.as_ptr());
    }

    #[test]
    fn multi_chunk_payload_concatenates() {
        let header = FrameHeader {
            payload_len: 6,
            ..FrameHeader::new(1, 1)
        };
        let frame = Frame::new(
            header,
            vec![Bytes::from_static(b"ab"), Bytes::from_static(b"cdef")],
        );
        assert_eq!(frame.payload_len(), 6);
        assert_eq!(frame.payload_bytes(), Bytes::from_static(b"abcdef"));
        assert_eq!(frame.payload_chunks().len(), 2);
    }

    #[test]
    fn from_payload_fixes_length() {
        let frame = Frame::from_payload(FrameHeader::new(9, 3), vec![0u8; 17]);
        assert_eq!(frame.header.payload_len, 17);
    }

    #[test]
    fn wire_encoding_prepends_header() {
        let frame = Frame::from_payload(FrameHeader::new(1, 2), Bytes::from_static(b"xy"));
        let wire = frame.to_wire();
        assert_eq!(wire.len(), FrameHeader::WIRE_SIZE + 2);
        assert_eq!(&wire[FrameHeader::WIRE_SIZE..], b"xy");
        let decoded = FrameHeader::decode(&wire).unwrap();
        assert_eq!(decoded, frame.header);
    }
}
