//! Framing for the generation wire protocol.
//!
//! The body is a text stream of frames separated by a blank line. Each frame
//! carries one `data:` line with a single-line JSON payload tagged by `type`.
//! Chunks may split a frame (or a UTF-8 character) anywhere.

use hookline_core::frame::StreamFrame;

pub const FRAME_DELIMITER: &str = "\n\n";
const DATA_PREFIX: &str = "data:";

/// Incremental decoder from raw body chunks to frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: String,
    // Trailing bytes of an incomplete UTF-8 sequence from the last chunk.
    partial_utf8: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every frame it completed, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamFrame> {
        self.decode_utf8(chunk);

        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.find(FRAME_DELIMITER) {
            let block: String = self.buffer.drain(..pos + FRAME_DELIMITER.len()).collect();
            if let Some(frame) = parse_frame_block(&block[..pos]) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flush whatever is left at end of stream; a final frame without a
    /// trailing delimiter is still decoded.
    pub fn finish(&mut self) -> Vec<StreamFrame> {
        if !self.partial_utf8.is_empty() {
            let rest = std::mem::take(&mut self.partial_utf8);
            self.buffer.push_str(&String::from_utf8_lossy(&rest));
        }
        let remaining = std::mem::take(&mut self.buffer);
        parse_frame_block(&remaining).into_iter().collect()
    }

    /// Bytes received but not yet part of a complete frame.
    pub fn pending_len(&self) -> usize {
        self.buffer.len() + self.partial_utf8.len()
    }

    fn decode_utf8(&mut self, chunk: &[u8]) {
        let mut bytes = std::mem::take(&mut self.partial_utf8);
        bytes.extend_from_slice(chunk);

        let mut rest = bytes.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    self.buffer.push_str(text);
                    return;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    // valid_up_to guarantees this slice is UTF-8
                    self.buffer.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        // Incomplete sequence at the end: wait for the next chunk.
                        None => {
                            self.partial_utf8 = after.to_vec();
                            return;
                        }
                        Some(bad) => {
                            self.buffer.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                    }
                }
            }
        }
    }
}

/// Encode a frame the way the service sends it: one `data:` line plus the
/// blank-line delimiter.
pub fn encode_frame(frame: &StreamFrame) -> String {
    // StreamFrame only holds strings and plain structs; serializing cannot fail.
    let payload = serde_json::to_string(frame).unwrap_or_default();
    format!("{DATA_PREFIX} {payload}{FRAME_DELIMITER}")
}

/// Decode one frame block. Lines without a `data:` prefix are ignored, as are
/// payloads that are not a known frame type.
pub fn parse_frame_block(block: &str) -> Option<StreamFrame> {
    for line in block.lines() {
        let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
            continue;
        };
        let payload = payload.trim();
        if payload.is_empty() {
            continue;
        }
        match serde_json::from_str::<StreamFrame>(payload) {
            Ok(frame) => return Some(frame),
            Err(e) => tracing::debug!(error = %e, "ignoring undecodable frame payload"),
        }
    }
    None
}
