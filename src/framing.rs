//! Packet framing for the serial sensor link.
//!
//! Devices emit ASCII packets of the form `!<id>:<KEY>:<VALUE>#`. Reads from the
//! link are arbitrarily chunked, so bytes accumulate in a [`FrameParser`] until a
//! terminator shows up. The pending tail is bounded by `max_frame_len`.

use bytes::{Buf, BytesMut};
use thiserror::Error;

pub const FRAME_START: u8 = b'!';
pub const FRAME_END: u8 = b'#';
pub const DEFAULT_MAX_FRAME_LEN: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    #[error("malformed packet {packet:?}")]
    Malformed { packet: String },

    #[error("truncated packet dropped ({dropped} bytes before resync)")]
    Truncated { dropped: usize },

    #[error("frame exceeded {max} bytes; dropped {dropped} bytes")]
    Overflow { dropped: usize, max: usize },
}

/// One decoded packet. `key` is uppercased, `value` may itself contain `:`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: String,
    pub key: String,
    pub value: String,
}

/// Decodes the body of a packet (the bytes between `!` and `#`).
pub fn decode_packet(body: &[u8]) -> Result<Frame, FramingError> {
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    let parts: Vec<&str> = text.split(':').collect();
    if parts.len() < 3 || parts[1].trim().is_empty() {
        return Err(FramingError::Malformed {
            packet: text.to_string(),
        });
    }

    Ok(Frame {
        id: parts[0].trim().to_string(),
        key: parts[1].trim().to_ascii_uppercase(),
        value: parts[2..].join(":").trim().to_string(),
    })
}

#[derive(Debug)]
pub struct FrameParser {
    buffer: BytesMut,
    max_frame_len: usize,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameParser {
    pub fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        let max_frame_len = max_frame_len.max(3);
        Self {
            buffer: BytesMut::with_capacity(max_frame_len),
            max_frame_len,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Extracts the next packet, or `None` when more input is needed.
    ///
    /// A packet runs from the last `!` before a `#` to that `#`. Any earlier `!`
    /// opened a packet the device never finished; those bytes are reported as
    /// [`FramingError::Truncated`] rather than decoded into the key.
    ///
    /// Errors are per packet: after an `Err` the parser has already skipped past
    /// the offending bytes and the next call continues with the rest of the buffer.
    pub fn next_frame(&mut self) -> Option<Result<Frame, FramingError>> {
        let Some(start) = self.buffer.iter().position(|b| *b == FRAME_START) else {
            self.buffer.clear();
            return None;
        };
        if start > 0 {
            self.buffer.advance(start);
        }

        let Some(end) = self.buffer.iter().position(|b| *b == FRAME_END) else {
            if self.buffer.len() <= self.max_frame_len {
                return None;
            }
            // Keep a trailing packet start that still fits inside the bound.
            let keep_from = self
                .buffer
                .iter()
                .rposition(|b| *b == FRAME_START)
                .filter(|at| *at > 0 && self.buffer.len() - at <= self.max_frame_len);
            let dropped = match keep_from {
                Some(at) => {
                    self.buffer.advance(at);
                    at
                }
                None => {
                    let len = self.buffer.len();
                    self.buffer.clear();
                    len
                }
            };
            return Some(Err(FramingError::Overflow {
                dropped,
                max: self.max_frame_len,
            }));
        };

        // A second `!` before the terminator means the device restarted mid-packet.
        let restart = self.buffer[..end]
            .iter()
            .rposition(|b| *b == FRAME_START)
            .unwrap_or(0);
        if restart > 0 {
            self.buffer.advance(restart);
            return Some(Err(FramingError::Truncated { dropped: restart }));
        }

        let packet = self.buffer.split_to(end + 1);
        if packet.len() > self.max_frame_len {
            return Some(Err(FramingError::Overflow {
                dropped: packet.len(),
                max: self.max_frame_len,
            }));
        }
        Some(decode_packet(&packet[1..end]))
    }

    /// Drains every complete packet currently buffered, in arrival order.
    pub fn frames(&mut self) -> Frames<'_> {
        Frames { parser: self }
    }
}

pub struct Frames<'a> {
    parser: &'a mut FrameParser,
}

impl Iterator for Frames<'_> {
    type Item = Result<Frame, FramingError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.parser.next_frame()
    }
}
