//! Stream framing: multiplexing control messages into the data stream.
//!
//! Application data and [`ControlMessage`]s share one TCP byte stream.  This
//! module is responsible for:
//! - Defining the decoded unit, [`Frame`].
//! - Serialising data payloads and control messages into bytes ready for
//!   transmission.
//! - Incrementally decoding an arbitrarily chunked byte stream back into
//!   frames, in order, regardless of how reads split it.
//!
//! No I/O happens here; this is pure data transformation.
//!
//! # Tagged wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Kind      |                 Body Length                   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |    (length)   |             Body ...                          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Header size: [`HEADER_LEN`] = 5 bytes, kind(1) + length(4).
//! Control bodies are JSON (see [`crate::control`]).
//!
//! The legacy inline-marker format lives in [`crate::marker`]; [`Codec`]
//! dispatches to whichever one the connection was configured with.

use std::collections::VecDeque;

use thiserror::Error;

use crate::control::ControlMessage;
use crate::marker::MarkerCodec;

/// Frame kind constants for the tagged header.
pub mod kind {
    /// Opaque application bytes.
    pub const DATA: u8 = 0x01;
    /// JSON-encoded [`super::ControlMessage`].
    pub const CONTROL: u8 = 0x02;
}

/// Byte length of the fixed-size tagged header.
pub const HEADER_LEN: usize = 5;

/// Largest body a tagged frame may declare.
pub const MAX_BODY_LEN: usize = 16 * 1024 * 1024;

const OFF_KIND: usize = 0;
const OFF_LEN: usize = 1;

/// One decoded unit of the multiplexed stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data(Vec<u8>),
    Control(ControlMessage),
}

/// Errors that make a stream undecodable.
///
/// Malformed control bodies are *not* errors; they are dropped and counted.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame declares {len} body bytes (max {max})")]
    FrameTooLarge { len: usize, max: usize },
    #[error("control message encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Which framing a connection speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum FramingMode {
    /// Kind + length prefixed frames.
    #[default]
    Tagged,
    /// `#CTRL#` + JSON + newline embedded in raw data.
    Marker,
}

// ---------------------------------------------------------------------------
// TaggedCodec
// ---------------------------------------------------------------------------

/// Incremental decoder/encoder for the tagged format.
#[derive(Debug, Default)]
pub struct TaggedCodec {
    buf: Vec<u8>,
    malformed: u64,
}

impl TaggedCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn encode_data(&self, payload: &[u8], dst: &mut Vec<u8>) {
        put_frame(kind::DATA, payload, dst);
    }

    pub fn encode_control(&self, msg: &ControlMessage, dst: &mut Vec<u8>) -> Result<(), CodecError> {
        let body = msg.to_json()?;
        put_frame(kind::CONTROL, &body, dst);
        Ok(())
    }

    /// Append `input` and push every complete frame onto `out`.
    ///
    /// Partial frames stay buffered until the rest arrives.
    pub fn decode(&mut self, input: &[u8], out: &mut VecDeque<Frame>) -> Result<(), CodecError> {
        self.buf.extend_from_slice(input);

        let mut pos = 0;
        while self.buf.len() - pos >= HEADER_LEN {
            let header = &self.buf[pos..pos + HEADER_LEN];
            let frame_kind = header[OFF_KIND];
            let len = u32::from_be_bytes([
                header[OFF_LEN],
                header[OFF_LEN + 1],
                header[OFF_LEN + 2],
                header[OFF_LEN + 3],
            ]) as usize;
            if len > MAX_BODY_LEN {
                return Err(CodecError::FrameTooLarge {
                    len,
                    max: MAX_BODY_LEN,
                });
            }
            let end = pos + HEADER_LEN + len;
            if self.buf.len() < end {
                break;
            }

            let body = &self.buf[pos + HEADER_LEN..end];
            match frame_kind {
                kind::DATA => out.push_back(Frame::Data(body.to_vec())),
                kind::CONTROL => match ControlMessage::from_json(body) {
                    Ok(msg) => out.push_back(Frame::Control(msg)),
                    Err(e) => {
                        self.malformed += 1;
                        log::debug!("[codec] discarding malformed control body: {e}");
                    }
                },
                other => {
                    self.malformed += 1;
                    log::debug!("[codec] discarding frame of unknown kind {other:#04x}");
                }
            }
            pos = end;
        }

        self.buf.drain(..pos);
        Ok(())
    }

    /// End of stream: a dangling partial frame can never complete.
    pub fn finish(&mut self, _out: &mut VecDeque<Frame>) {
        if !self.buf.is_empty() {
            log::debug!("[codec] discarding {} bytes of truncated frame", self.buf.len());
            self.malformed += 1;
            self.buf.clear();
        }
    }

    pub fn malformed(&self) -> u64 {
        self.malformed
    }
}

fn put_frame(frame_kind: u8, body: &[u8], dst: &mut Vec<u8>) {
    dst.reserve(HEADER_LEN + body.len());
    dst.push(frame_kind);
    dst.extend_from_slice(&(body.len() as u32).to_be_bytes());
    dst.extend_from_slice(body);
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Framing chosen per connection.
#[derive(Debug)]
pub enum Codec {
    Tagged(TaggedCodec),
    Marker(MarkerCodec),
}

impl Codec {
    pub fn new(mode: FramingMode) -> Self {
        match mode {
            FramingMode::Tagged => Self::Tagged(TaggedCodec::new()),
            FramingMode::Marker => Self::Marker(MarkerCodec::new()),
        }
    }

    pub fn encode_data(&self, payload: &[u8], dst: &mut Vec<u8>) {
        match self {
            Self::Tagged(c) => c.encode_data(payload, dst),
            Self::Marker(c) => c.encode_data(payload, dst),
        }
    }

    pub fn encode_control(&self, msg: &ControlMessage, dst: &mut Vec<u8>) -> Result<(), CodecError> {
        match self {
            Self::Tagged(c) => c.encode_control(msg, dst),
            Self::Marker(c) => c.encode_control(msg, dst),
        }
    }

    pub fn decode(&mut self, input: &[u8], out: &mut VecDeque<Frame>) -> Result<(), CodecError> {
        match self {
            Self::Tagged(c) => c.decode(input, out),
            Self::Marker(c) => {
                c.decode(input, out);
                Ok(())
            }
        }
    }

    pub fn finish(&mut self, out: &mut VecDeque<Frame>) {
        match self {
            Self::Tagged(c) => c.finish(out),
            Self::Marker(c) => c.finish(out),
        }
    }

    /// Frames discarded so far because they could not be parsed.
    pub fn malformed(&self) -> u64 {
        match self {
            Self::Tagged(c) => c.malformed(),
            Self::Marker(c) => c.malformed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::Level;

    fn status() -> ControlMessage {
        ControlMessage::BufferStatus {
            occupancy: 4096,
            level: Level::Fast,
        }
    }

    fn decode_all(codec: &mut TaggedCodec, bytes: &[u8]) -> Vec<Frame> {
        let mut out = VecDeque::new();
        codec.decode(bytes, &mut out).unwrap();
        out.into_iter().collect()
    }

    #[test]
    fn header_layout_is_kind_then_big_endian_length() {
        let mut bytes = Vec::new();
        TaggedCodec::new().encode_data(b"hello", &mut bytes);
        assert_eq!(bytes.len(), HEADER_LEN + 5);
        assert_eq!(bytes[OFF_KIND], kind::DATA);
        assert_eq!(&bytes[OFF_LEN..OFF_LEN + 4], &[0, 0, 0, 5]);
        assert_eq!(&bytes[HEADER_LEN..], b"hello");
    }

    #[test]
    fn data_and_control_interleave_in_order() {
        let mut bytes = Vec::new();
        let enc = TaggedCodec::new();
        enc.encode_data(b"one", &mut bytes);
        enc.encode_control(&status(), &mut bytes).unwrap();
        enc.encode_data(b"two", &mut bytes);

        let frames = decode_all(&mut TaggedCodec::new(), &bytes);
        assert_eq!(
            frames,
            vec![
                Frame::Data(b"one".to_vec()),
                Frame::Control(status()),
                Frame::Data(b"two".to_vec()),
            ]
        );
    }

    #[test]
    fn partial_frame_waits_for_rest() {
        let mut bytes = Vec::new();
        TaggedCodec::new().encode_control(&status(), &mut bytes).unwrap();

        let mut codec = TaggedCodec::new();
        assert!(decode_all(&mut codec, &bytes[..3]).is_empty());
        assert!(decode_all(&mut codec, &bytes[3..bytes.len() - 1]).is_empty());
        assert_eq!(
            decode_all(&mut codec, &bytes[bytes.len() - 1..]),
            vec![Frame::Control(status())]
        );
    }

    #[test]
    fn malformed_control_body_is_skipped_and_counted() {
        let mut bytes = Vec::new();
        put_frame(kind::CONTROL, b"{\"type\":", &mut bytes);
        put_frame(0x7f, b"??", &mut bytes);
        TaggedCodec::new().encode_data(b"after", &mut bytes);

        let mut codec = TaggedCodec::new();
        let frames = decode_all(&mut codec, &bytes);
        assert_eq!(frames, vec![Frame::Data(b"after".to_vec())]);
        assert_eq!(codec.malformed(), 2);
    }

    #[test]
    fn oversized_length_is_fatal() {
        let mut bytes = vec![kind::DATA];
        bytes.extend_from_slice(&u32::MAX.to_be_bytes());
        let mut out = VecDeque::new();
        assert!(matches!(
            TaggedCodec::new().decode(&bytes, &mut out),
            Err(CodecError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn truncated_frame_at_eof_is_counted() {
        let mut bytes = Vec::new();
        TaggedCodec::new().encode_data(b"lost", &mut bytes);
        let mut codec = TaggedCodec::new();
        let mut out = VecDeque::new();
        codec.decode(&bytes[..6], &mut out).unwrap();
        codec.finish(&mut out);
        assert!(out.is_empty());
        assert_eq!(codec.malformed(), 1);
    }

    #[test]
    fn empty_data_frame_is_delivered() {
        let mut bytes = Vec::new();
        TaggedCodec::new().encode_data(b"", &mut bytes);
        assert_eq!(
            decode_all(&mut TaggedCodec::new(), &bytes),
            vec![Frame::Data(Vec::new())]
        );
    }
}
