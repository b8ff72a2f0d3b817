//! Newline-delimited JSON framing.
//!
//! Encoding is one `serde_json` object plus `\n`. Decoding buffers partial
//! reads and yields every complete line; lines that do not parse into a
//! frame are dropped so a peer speaking a newer or older dialect never
//! tears the connection down.

use serde_json::Value;
use thiserror::Error;

use crate::logging::targets;

use super::Frame;

/// Upper bound on a single buffered line. Anything longer is discarded up to
/// the next newline.
pub const MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("blank line")]
    Blank,

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("frame has no string `type` field")]
    MissingType,

    #[error("invalid `{kind}` frame: {message}")]
    Shape { kind: String, message: String },

    #[error("line is not valid UTF-8")]
    Utf8,
}

/// Serialize a frame to its wire form, newline included.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, CodecError> {
    let mut bytes = serde_json::to_vec(frame)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Parse one line (without its terminator) into a frame.
///
/// Unknown discriminants decode to [`Frame::Unknown`]; a known discriminant
/// with missing or mistyped fields is an error.
pub fn decode_line(line: &str) -> Result<Frame, CodecError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(CodecError::Blank);
    }
    let value: Value = serde_json::from_str(trimmed)?;
    let obj = value.as_object().ok_or(CodecError::NotAnObject)?;
    let kind = match obj.get("type") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        _ => return Err(CodecError::MissingType),
    };
    serde_json::from_value(value).map_err(|e| CodecError::Shape {
        kind,
        message: e.to_string(),
    })
}

/// Accumulates raw bytes and splits them into frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    discarding: bool,
    dropped: u64,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes and return every frame completed by them, in order.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut rest = bytes;

        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            let (head, tail) = rest.split_at(pos);
            rest = &tail[1..];

            if self.discarding {
                self.discarding = false;
                self.buf.clear();
                continue;
            }

            if self.buf.len() + head.len() > MAX_LINE_BYTES {
                tracing::warn!(
                    target: targets::SESSION,
                    length = self.buf.len() + head.len(),
                    "frame line exceeds limit, dropped"
                );
                self.buf.clear();
                self.dropped += 1;
                continue;
            }

            self.buf.extend_from_slice(head);
            let line = std::mem::take(&mut self.buf);
            if let Some(frame) = self.decode_buffered(&line) {
                frames.push(frame);
            }
        }

        if !rest.is_empty() && !self.discarding {
            self.buf.extend_from_slice(rest);
            if self.buf.len() > MAX_LINE_BYTES {
                tracing::warn!(
                    target: targets::SESSION,
                    buffered = self.buf.len(),
                    "frame line exceeds limit, discarding until next newline"
                );
                self.buf.clear();
                self.discarding = true;
                self.dropped += 1;
            }
        }

        frames
    }

    /// Number of lines dropped so far (malformed, unusable, or oversized).
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Bytes currently held for an incomplete line.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    fn decode_buffered(&mut self, line: &[u8]) -> Option<Frame> {
        let text = match std::str::from_utf8(line) {
            Ok(t) => t,
            Err(_) => {
                self.dropped += 1;
                tracing::debug!(
                    target: targets::SESSION,
                    error = %CodecError::Utf8,
                    "dropping frame"
                );
                return None;
            }
        };
        match decode_line(text) {
            Ok(frame) => Some(frame),
            Err(CodecError::Blank) => None,
            Err(e) => {
                self.dropped += 1;
                tracing::debug!(target: targets::SESSION, error = %e, "dropping frame");
                None
            }
        }
    }
}
