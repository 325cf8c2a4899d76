//! Legacy inline-marker framing.
//!
//! Control messages are written as `#CTRL#` + JSON + `\n` directly into the
//! data stream; everything else is application data.  Senders must never put
//! the marker inside their payload, since nothing here can tell the two apart.
//!
//! Decoding repeats until no further progress is possible:
//! 1. Locate the marker.  Bytes before it are flushed as data.
//! 2. No newline after the marker yet: wait for more input.  A pending line
//!    longer than [`MAX_BODY_LEN`] is counted as malformed and the rest of it
//!    is dropped up to its newline.
//! 3. Otherwise parse the body between marker and newline.  A body that does
//!    not parse is dropped and counted; the stream continues.
//!
//! Trailing bytes with no marker are flushed immediately, except for a suffix
//! that could be the start of a marker split across two reads.  That suffix
//! is held back until the next read completes or disproves it.

use std::collections::VecDeque;

use crate::codec::{CodecError, Frame, MAX_BODY_LEN};
use crate::control::ControlMessage;

/// Prefix that opens an inline control frame.
pub const MARKER: &[u8] = b"#CTRL#";

const TERMINATOR: u8 = b'\n';

#[derive(Debug, Default)]
pub struct MarkerCodec {
    buf: Vec<u8>,
    malformed: u64,
    /// Inside an oversized control line; input is dropped up to its newline.
    skipping: bool,
}

impl MarkerCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn encode_data(&self, payload: &[u8], dst: &mut Vec<u8>) {
        dst.extend_from_slice(payload);
    }

    pub fn encode_control(&self, msg: &ControlMessage, dst: &mut Vec<u8>) -> Result<(), CodecError> {
        let body = msg.to_json()?;
        dst.reserve(MARKER.len() + body.len() + 1);
        dst.extend_from_slice(MARKER);
        dst.extend_from_slice(&body);
        dst.push(TERMINATOR);
        Ok(())
    }

    pub fn decode(&mut self, input: &[u8], out: &mut VecDeque<Frame>) {
        let input = if self.skipping {
            match input.iter().position(|&b| b == TERMINATOR) {
                Some(nl) => {
                    self.skipping = false;
                    &input[nl + 1..]
                }
                None => return,
            }
        } else {
            input
        };
        self.buf.extend_from_slice(input);

        let mut pos = 0;
        loop {
            let rest = &self.buf[pos..];
            match find(rest, MARKER) {
                Some(at) => {
                    if at > 0 {
                        out.push_back(Frame::Data(rest[..at].to_vec()));
                    }
                    let body_start = at + MARKER.len();
                    let Some(nl) = rest[body_start..].iter().position(|&b| b == TERMINATOR) else {
                        if rest.len() - body_start > MAX_BODY_LEN {
                            self.malformed += 1;
                            self.skipping = true;
                            log::debug!("[codec] control line exceeds {MAX_BODY_LEN} bytes, skipping to newline");
                            pos = self.buf.len();
                        } else {
                            // Partial frame; keep it starting at the marker.
                            pos += at;
                        }
                        break;
                    };
                    let body = &rest[body_start..body_start + nl];
                    match ControlMessage::from_json(body) {
                        Ok(msg) => out.push_back(Frame::Control(msg)),
                        Err(e) => {
                            self.malformed += 1;
                            log::debug!("[codec] discarding malformed control line: {e}");
                        }
                    }
                    pos += body_start + nl + 1;
                }
                None => {
                    let held = marker_prefix_suffix(rest);
                    let flush = rest.len() - held;
                    if flush > 0 {
                        out.push_back(Frame::Data(rest[..flush].to_vec()));
                    }
                    pos += flush;
                    break;
                }
            }
        }

        self.buf.drain(..pos);
    }

    /// End of stream.  A withheld marker prefix turned out to be data; an
    /// unterminated control frame is dropped.
    pub fn finish(&mut self, out: &mut VecDeque<Frame>) {
        if self.buf.is_empty() {
            return;
        }
        if self.buf.starts_with(MARKER) {
            self.malformed += 1;
            log::debug!("[codec] discarding unterminated control line at EOF");
        } else {
            out.push_back(Frame::Data(std::mem::take(&mut self.buf)));
        }
        self.buf.clear();
    }

    pub fn malformed(&self) -> u64 {
        self.malformed
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Length of the longest suffix of `buf` that is a proper prefix of [`MARKER`].
fn marker_prefix_suffix(buf: &[u8]) -> usize {
    let max = (MARKER.len() - 1).min(buf.len());
    (1..=max)
        .rev()
        .find(|&n| buf[buf.len() - n..] == MARKER[..n])
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::Level;

    fn queue_status() -> ControlMessage {
        ControlMessage::QueueStatus {
            length: 300,
            level: Level::Ok,
        }
    }

    fn feed(codec: &mut MarkerCodec, bytes: &[u8]) -> Vec<Frame> {
        let mut out = VecDeque::new();
        codec.decode(bytes, &mut out);
        out.into_iter().collect()
    }

    #[test]
    fn encodes_marker_json_newline() {
        let mut bytes = Vec::new();
        MarkerCodec::new()
            .encode_control(&queue_status(), &mut bytes)
            .unwrap();
        assert!(bytes.starts_with(MARKER));
        assert_eq!(bytes.last(), Some(&b'\n'));
        assert_eq!(
            ControlMessage::from_json(&bytes[MARKER.len()..bytes.len() - 1]).unwrap(),
            queue_status()
        );
    }

    #[test]
    fn data_before_marker_is_flushed_first() {
        let mut codec = MarkerCodec::new();
        let frames = feed(
            &mut codec,
            b"abc#CTRL#{\"type\":\"queue\",\"qlen\":300,\"level\":\"OK\"}\ndef",
        );
        assert_eq!(
            frames,
            vec![
                Frame::Data(b"abc".to_vec()),
                Frame::Control(queue_status()),
                Frame::Data(b"def".to_vec()),
            ]
        );
    }

    #[test]
    fn multiple_frames_in_one_read() {
        let mut bytes = Vec::new();
        let codec = MarkerCodec::new();
        codec.encode_control(&queue_status(), &mut bytes).unwrap();
        codec.encode_control(&queue_status(), &mut bytes).unwrap();
        let frames = feed(&mut MarkerCodec::new(), &bytes);
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn frame_without_newline_waits() {
        let mut codec = MarkerCodec::new();
        assert_eq!(
            feed(&mut codec, b"xy#CTRL#{\"type\":\"queue\""),
            vec![Frame::Data(b"xy".to_vec())]
        );
        assert_eq!(
            feed(&mut codec, b",\"qlen\":300,\"level\":\"OK\"}\n"),
            vec![Frame::Control(queue_status())]
        );
    }

    #[test]
    fn marker_split_across_reads_is_not_flushed_as_data() {
        let mut codec = MarkerCodec::new();
        assert_eq!(feed(&mut codec, b"payload#CT"), vec![Frame::Data(b"payload".to_vec())]);
        assert_eq!(
            feed(&mut codec, b"RL#{\"type\":\"queue\",\"qlen\":300,\"level\":\"OK\"}\n"),
            vec![Frame::Control(queue_status())]
        );
    }

    #[test]
    fn disproved_prefix_is_released_as_data() {
        let mut codec = MarkerCodec::new();
        assert_eq!(feed(&mut codec, b"ab#C"), vec![Frame::Data(b"ab".to_vec())]);
        assert_eq!(feed(&mut codec, b"at"), vec![Frame::Data(b"#Cat".to_vec())]);
    }

    #[test]
    fn withheld_prefix_flushes_at_eof() {
        let mut codec = MarkerCodec::new();
        feed(&mut codec, b"tail#");
        let mut out = VecDeque::new();
        codec.finish(&mut out);
        assert_eq!(out.into_iter().collect::<Vec<_>>(), vec![Frame::Data(b"#".to_vec())]);
    }

    #[test]
    fn malformed_line_is_dropped_and_stream_continues() {
        let mut codec = MarkerCodec::new();
        let frames = feed(&mut codec, b"#CTRL#{oops\nrest");
        assert_eq!(frames, vec![Frame::Data(b"rest".to_vec())]);
        assert_eq!(codec.malformed(), 1);
    }

    #[test]
    fn oversized_control_line_is_skipped() {
        let mut c = MarkerCodec::new();
        let mut out = feed(&mut c, b"head");
        out.extend(feed(&mut c, MARKER));
        let junk = vec![b'x'; 1024 * 1024];
        for _ in 0..=MAX_BODY_LEN / junk.len() {
            out.extend(feed(&mut c, &junk));
        }
        assert_eq!(c.malformed(), 1);
        assert!(c.buf.len() <= junk.len() + MARKER.len());

        // Still inside the oversized line: nothing is kept.
        out.extend(feed(&mut c, &junk));
        assert!(c.buf.is_empty());

        out.extend(feed(&mut c, b"xx\ntail"));
        let mut end = VecDeque::new();
        c.finish(&mut end);
        out.extend(end);
        assert_eq!(
            out,
            vec![Frame::Data(b"head".to_vec()), Frame::Data(b"tail".to_vec())]
        );
        assert_eq!(c.malformed(), 1);
    }

    #[test]
    fn prefix_suffix_lengths() {
        assert_eq!(marker_prefix_suffix(b""), 0);
        assert_eq!(marker_prefix_suffix(b"abc"), 0);
        assert_eq!(marker_prefix_suffix(b"abc#"), 1);
        assert_eq!(marker_prefix_suffix(b"abc#CTRL"), 5);
        assert_eq!(marker_prefix_suffix(b"#C#CT"), 3);
    }
}
