use bytes::Bytes;

use crate::{DEFAULT_MAX_PAYLOAD, Frame, FrameHeader, WireError};

/// Callbacks for streaming-mode consumption.
///
/// Payload bytes are handed over as they arrive; the reassembler never
/// buffers a full payload in this mode. Chunk boundaries in the callbacks may
/// differ from input boundaries, but the concatenation of all chunks for one
/// frame equals the original payload exactly.
pub trait StreamSink: Send {
    /// A validated header was parsed; payload chunks for it follow.
    fn on_frame_start(&mut self, header: &FrameHeader);

    /// One payload chunk, at `offset` within the payload. `is_last` marks
    /// the chunk that completes the frame. Never called for empty payloads.
    fn on_payload_chunk(&mut self, chunk: Bytes, offset: u64, is_last: bool);

    /// The frame that started with `header` is complete.
    fn on_frame_end(&mut self, header: &FrameHeader);

    /// Header validation failed. When `header` is present its declared body
    /// is discarded and parsing resumes at the next frame boundary.
    fn on_error(&mut self, error: &WireError, header: Option<&FrameHeader>);
}

enum Phase {
    /// Collecting header bytes into the 11-byte window.
    Header,
    /// Collecting `header.payload_len` payload bytes.
    Body {
        header: FrameHeader,
        received: u32,
        /// Accumulated chunks; unused in streaming mode.
        chunks: Vec<Bytes>,
    },
    /// Streaming mode only: discarding the body of a rejected header.
    Discard { remaining: u32 },
}

/// Incremental frame parser.
///
/// Feed arbitrary byte chunks with [`push`](Reassembler::push); complete
/// frames come out in order. Installing a [`StreamSink`] switches to
/// streaming mode, where `push` returns no frames and payload bytes flow
/// through the sink instead.
///
/// At most one frame is in assembly at a time, so retained memory is bounded
/// by the header window plus the in-flight frame (batch) or the header
/// window alone (streaming).
pub struct Reassembler {
    phase: Phase,
    header_window: [u8; FrameHeader::WIRE_SIZE],
    header_fill: usize,
    max_payload: u32,
    sink: Option<Box<dyn StreamSink>>,
    frames_emitted: u64,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reassembler {
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD)
    }

    pub fn with_max_payload(max_payload: u32) -> Self {
        Self {
            phase: Phase::Header,
            header_window: [0u8; FrameHeader::WIRE_SIZE],
            header_fill: 0,
            max_payload,
            sink: None,
            frames_emitted: 0,
        }
    }

    /// Switch to streaming mode.
    ///
    /// Fails with [`WireError::SinkRearm`] while a partial frame is
    /// buffered; callers must drain or [`reset`](Reassembler::reset) first.
    pub fn set_stream_sink(&mut self, sink: Box<dyn StreamSink>) -> Result<(), WireError> {
        if self.header_fill > 0 || !matches!(self.phase, Phase::Header) {
            return Err(WireError::SinkRearm);
        }
        self.sink = Some(sink);
        Ok(())
    }

    /// Drop the stream sink, returning to batch mode.
    pub fn clear_stream_sink(&mut self) -> Option<Box<dyn StreamSink>> {
        self.sink.take()
    }

    /// Whether a partial frame (header or body) is currently buffered.
    pub fn has_partial_frame(&self) -> bool {
        self.header_fill > 0 || !matches!(self.phase, Phase::Header)
    }

    /// Total complete frames emitted since construction or the last reset.
    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted
    }

    /// Clear all parse state. The stream sink, if any, stays installed.
    ///
    /// Callers own the contract of resetting between independent peer
    /// sessions.
    pub fn reset(&mut self) {
        self.phase = Phase::Header;
        self.header_fill = 0;
        self.frames_emitted = 0;
    }

    /// Consume one input chunk.
    ///
    /// Batch mode: returns every frame completed by this chunk, in order.
    /// Streaming mode: always returns an empty vec; output goes to the sink.
    ///
    /// In batch mode a header that fails validation is returned as the
    /// error and the rest of the input chunk is dropped; the reassembler
    /// must be [`reset`](Reassembler::reset) before reuse.
    pub fn push(&mut self, chunk: Bytes) -> Result<Vec<Frame>, WireError> {
        let mut completed = Vec::new();
        let mut pos = 0usize;

        while pos < chunk.len() {
            match &mut self.phase {
                Phase::Header => {
                    let need = FrameHeader::WIRE_SIZE - self.header_fill;
                    let take = need.min(chunk.len() - pos);
                    self.header_window[self.header_fill..self.header_fill + take]
                        .copy_from_slice(&chunk[pos..pos + take]);
                    self.header_fill += take;
                    pos += take;

                    if self.header_fill < FrameHeader::WIRE_SIZE {
                        break;
                    }
                    self.header_fill = 0;

                    // Window is full here, so decode cannot fail.
                    let header = FrameHeader::decode(&self.header_window)?;
                    if let Err(err) = header.validate(Some(self.max_payload)) {
                        match &mut self.sink {
                            Some(sink) => {
                                sink.on_error(&err, Some(&header));
                                self.phase = if header.payload_len > 0 {
                                    Phase::Discard {
                                        remaining: header.payload_len,
                                    }
                                } else {
                                    Phase::Header
                                };
                                continue;
                            }
                            None => {
                                self.reset();
                                return Err(err);
                            }
                        }
                    }

                    if let Some(sink) = &mut self.sink {
                        sink.on_frame_start(&header);
                        if header.payload_len == 0 {
                            sink.on_frame_end(&header);
                            self.frames_emitted += 1;
                            continue;
                        }
                    } else if header.payload_len == 0 {
                        completed.push(Frame::new(header, Vec::new()));
                        self.frames_emitted += 1;
                        continue;
                    }
                    self.phase = Phase::Body {
                        header,
                        received: 0,
                        chunks: Vec::new(),
                    };
                }
                Phase::Body {
                    header,
                    received,
                    chunks,
                } => {
                    let need = (header.payload_len - *received) as usize;
                    let take = need.min(chunk.len() - pos);
                    let piece = chunk.slice(pos..pos + take);
                    let offset = u64::from(*received);
                    *received += take as u32;
                    pos += take;
                    let done = *received == header.payload_len;

                    match &mut self.sink {
                        Some(sink) => {
                            sink.on_payload_chunk(piece, offset, done);
                            if done {
                                sink.on_frame_end(header);
                            }
                        }
                        None => chunks.push(piece),
                    }

                    if done {
                        if self.sink.is_none() {
                            let header = *header;
                            let chunks = std::mem::take(chunks);
                            completed.push(Frame::new(header, chunks));
                        }
                        self.frames_emitted += 1;
                        self.phase = Phase::Header;
                    }
                }
                Phase::Discard { remaining } => {
                    let take = (*remaining as usize).min(chunk.len() - pos);
                    *remaining -= take as u32;
                    pos += take;
                    if *remaining == 0 {
                        self.phase = Phase::Header;
                    }
                }
            }
        }

        Ok(completed)
    }
}
