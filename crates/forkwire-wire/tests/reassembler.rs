//! Reassembler conformance tests.
//!
//! These drive the parser with adversarial chunk partitionings and verify
//! that frame boundaries, payload bytes, and callback ordering survive
//! regardless of how the input was sliced.

use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use forkwire_wire::{Frame, FrameFlags, FrameHeader, Reassembler, StreamSink, WireError};

/// Build a set of frames with distinctive payloads.
fn sample_frames() -> Vec<Frame> {
    let mut frames = Vec::new();
    for (i, len) in [0usize, 1, 11, 64, 1000].into_iter().enumerate() {
        let mut header = FrameHeader::new(i as u16 + 1, i as u32 + 100);
        if i % 2 == 0 {
            header.flags = FrameFlags::RESPONSE;
        }
        let payload: Vec<u8> = (0..len)
            .map(|b| (b as u8).wrapping_mul(i as u8 + 1))
            .collect();
        frames.push(Frame::from_payload(header, payload));
    }
    frames
}

fn wire_image(frames: &[Frame]) -> Bytes {
    let mut buf = BytesMut::new();
    for frame in frames {
        buf.extend_from_slice(&frame.to_wire());
    }
    buf.freeze()
}

/// Slice `wire` into chunks of the given repeating sizes.
fn partitions(wire: &Bytes, sizes: &[usize]) -> Vec<Bytes> {
    let mut chunks = Vec::new();
    let mut pos = 0;
    let mut i = 0;
    while pos < wire.len() {
        let take = sizes[i % sizes.len()].min(wire.len() - pos);
        chunks.push(wire.slice(pos..pos + take));
        pos += take;
        i += 1;
    }
    chunks
}

#[derive(Default)]
struct Recording {
    started: Vec<FrameHeader>,
    ended: Vec<FrameHeader>,
    payloads: Vec<BytesMut>,
    last_flags: Vec<bool>,
    errors: Vec<WireError>,
    max_chunk_len: usize,
}

/// Sink that records every callback into shared state.
#[derive(Clone, Default)]
struct RecordingSink {
    state: Arc<Mutex<Recording>>,
}

impl RecordingSink {
    fn take(&self) -> Recording {
        std::mem::take(&mut self.state.lock().unwrap())
    }
}

impl StreamSink for RecordingSink {
    fn on_frame_start(&mut self, header: &FrameHeader) {
        let mut state = self.state.lock().unwrap();
        state.started.push(*header);
        state.payloads.push(BytesMut::new());
    }

    fn on_payload_chunk(&mut self, chunk: Bytes, offset: u64, is_last: bool) {
        let mut state = self.state.lock().unwrap();
        let max_seen = state.max_chunk_len.max(chunk.len());
        state.max_chunk_len = max_seen;
        let current = state.payloads.last_mut().expect("chunk before frame start");
        assert_eq!(offset as usize, current.len(), "offsets must be contiguous");
        current.extend_from_slice(&chunk);
        state.last_flags.push(is_last);
    }

    fn on_frame_end(&mut self, header: &FrameHeader) {
        self.state.lock().unwrap().ended.push(*header);
    }

    fn on_error(&mut self, error: &WireError, _header: Option<&FrameHeader>) {
        self.state.lock().unwrap().errors.push(error.clone());
    }
}

#[test]
fn batch_mode_is_partition_invariant() {
    let frames = sample_frames();
    let wire = wire_image(&frames);

    for sizes in [
        vec![1],
        vec![2, 3],
        vec![7],
        vec![11],
        vec![64, 1],
        vec![wire.len()],
    ] {
        let mut reassembler = Reassembler::new();
        let mut out = Vec::new();
        for chunk in partitions(&wire, &sizes) {
            out.extend(reassembler.push(chunk).unwrap());
        }
        assert_eq!(out.len(), frames.len(), "partition {sizes:?}");
        for (got, want) in out.iter().zip(&frames) {
            assert_eq!(got.header, want.header, "partition {sizes:?}");
            assert_eq!(
                got.payload_bytes(),
                want.payload_bytes(),
                "partition {sizes:?}"
            );
        }
        assert!(!reassembler.has_partial_frame());
        assert_eq!(reassembler.frames_emitted(), frames.len() as u64);
    }
}

#[test]
fn streaming_mode_is_partition_invariant() {
    let frames = sample_frames();
    let wire = wire_image(&frames);

    for sizes in [vec![1], vec![5], vec![13, 1, 7], vec![wire.len()]] {
        let sink = RecordingSink::default();
        let mut reassembler = Reassembler::new();
        reassembler.set_stream_sink(Box::new(sink.clone())).unwrap();
        for chunk in partitions(&wire, &sizes) {
            // Streaming mode never yields frames from push.
            assert!(reassembler.push(chunk).unwrap().is_empty());
        }

        let recording = sink.take();
        assert_eq!(recording.started.len(), frames.len());
        assert_eq!(recording.ended.len(), frames.len());
        assert!(recording.errors.is_empty());
        for ((got, want), start) in recording
            .payloads
            .iter()
            .zip(&frames)
            .zip(&recording.started)
        {
            assert_eq!(start, &want.header);
            assert_eq!(got.as_ref(), want.payload_bytes().as_ref());
        }
    }
}

#[test]
fn streaming_oversize_header_reports_error_and_resynchronizes() {
    let sink = RecordingSink::default();
    let mut reassembler = Reassembler::with_max_payload(8);
    reassembler.set_stream_sink(Box::new(sink.clone())).unwrap();

    // Oversize frame followed by a valid one, delivered byte by byte.
    let mut oversize = FrameHeader::new(1, 1);
    oversize.payload_len = 9;
    let mut wire = BytesMut::new();
    wire.extend_from_slice(&oversize.encode());
    wire.extend_from_slice(&[0xAA; 9]);
    wire.extend_from_slice(&Frame::from_payload(FrameHeader::new(2, 2), vec![1, 2, 3]).to_wire());
    let wire = wire.freeze();

    for i in 0..wire.len() {
        reassembler.push(wire.slice(i..i + 1)).unwrap();
    }

    let recording = sink.take();
    assert_eq!(recording.errors.len(), 1);
    assert!(matches!(
        recording.errors[0],
        WireError::PayloadTooLarge { len: 9, max: 8 }
    ));
    // The valid frame after the discarded body still came through.
    assert_eq!(recording.started.len(), 1);
    assert_eq!(recording.started[0].method_id, 2);
    assert_eq!(recording.payloads[0].as_ref(), &[1, 2, 3]);
}

#[test]
fn streaming_large_frame_in_fixed_chunks() {
    // A single 1 MiB frame fed in 64 KiB pieces: exactly one start, chunks
    // concatenating to the full payload with is_last on the final one,
    // exactly one end, no errors.
    const PAYLOAD_LEN: usize = 1_048_576;
    const CHUNK: usize = 64 * 1024;

    let payload: Vec<u8> = (0..PAYLOAD_LEN).map(|i| (i % 251) as u8).collect();
    let mut header = FrameHeader::new(1, 1);
    header.payload_len = PAYLOAD_LEN as u32;
    let wire = Frame::new(header, vec![Bytes::from(payload.clone())]).to_wire();

    let sink = RecordingSink::default();
    let mut reassembler = Reassembler::new();
    reassembler.set_stream_sink(Box::new(sink.clone())).unwrap();
    for chunk in partitions(&wire, &[CHUNK]) {
        reassembler.push(chunk).unwrap();
    }

    let recording = sink.take();
    assert!(recording.errors.is_empty());
    assert_eq!(recording.started.len(), 1);
    assert_eq!(recording.ended.len(), 1);
    assert_eq!(recording.payloads[0].len(), PAYLOAD_LEN);
    assert_eq!(recording.payloads[0].as_ref(), payload.as_slice());
    assert_eq!(
        recording.last_flags.iter().filter(|last| **last).count(),
        1
    );
    assert_eq!(recording.last_flags.last(), Some(&true));
    // Streaming mode hands input through without buffering payloads, so no
    // callback ever saw more than one delivered input chunk.
    assert!(recording.max_chunk_len <= CHUNK);
}

#[test]
fn reset_clears_partial_state() {
    let mut reassembler = Reassembler::new();
    let frame = Frame::from_payload(FrameHeader::new(1, 1), vec![0u8; 32]);
    let wire = frame.to_wire();
    reassembler.push(wire.slice(0..20)).unwrap();
    assert!(reassembler.has_partial_frame());

    reassembler.reset();
    assert!(!reassembler.has_partial_frame());

    // A fresh session parses cleanly from a frame boundary.
    let frames = reassembler.push(wire.clone()).unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].payload_len(), 32);
}
