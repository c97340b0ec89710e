//! Incremental frame codec for use against a streaming read buffer
//!
//! [`FrameCodec`] implements the `tokio_util` codec traits over the framing
//! primitives in [`crate::frame`]. The decoder is a two-state machine
//! (header block, then body) and consumes exactly one frame's bytes on a
//! decode failure, so a malformed frame costs one frame and never desyncs
//! state: the next call picks up at the following header block.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::{self, HEADER_LEN};
use crate::types::{CommError, Message};

#[derive(Debug)]
enum DecodeState {
    Header,
    Body { length: usize, subject: String },
}

/// Stateful encoder/decoder for commlink wire frames.
#[derive(Debug)]
pub struct FrameCodec {
    state: DecodeState,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            state: DecodeState::Header,
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = CommError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, CommError> {
        loop {
            match &self.state {
                DecodeState::Header => {
                    if src.len() < HEADER_LEN {
                        return Ok(None);
                    }
                    let block = src.split_to(HEADER_LEN);
                    // On error the block is already consumed; the stream
                    // resumes at the next header boundary.
                    let (length, subject) = frame::decode_header(&block)?;
                    src.reserve(length.saturating_sub(src.len()));
                    self.state = DecodeState::Body { length, subject };
                }
                DecodeState::Body { length, subject } => {
                    if src.len() < *length {
                        return Ok(None);
                    }
                    let length = *length;
                    let subject = subject.clone();
                    self.state = DecodeState::Header;

                    let body = src.split_to(length);
                    let message = frame::decode_body(&subject, &body)?;
                    return Ok(Some(message));
                }
            }
        }
    }
}

impl Encoder<&Message> for FrameCodec {
    type Error = CommError;

    fn encode(&mut self, item: &Message, dst: &mut BytesMut) -> Result<(), CommError> {
        let wire = frame::encode_frame(item)?;
        dst.put_slice(&wire);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Payload;
    use serde_json::json;

    fn message(subject: &str, key: &str, value: &str) -> Message {
        let mut payload = Payload::new();
        payload.insert(key.into(), json!(value));
        Message::new(subject, payload)
    }

    #[test]
    fn decode_single_frame() {
        let msg = message("ping", "seq", "1");
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(&msg, &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(msg));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_across_partial_feeds() {
        let msg = message("ping", "seq", "2");
        let mut full = BytesMut::new();
        FrameCodec::new().encode(&msg, &mut full).unwrap();

        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        let mut decoded = None;
        for chunk in full.chunks(7) {
            buf.extend_from_slice(chunk);
            if let Some(m) = codec.decode(&mut buf).unwrap() {
                decoded = Some(m);
            }
        }
        assert_eq!(decoded, Some(msg));
    }

    #[test]
    fn decode_two_frames_from_one_buffer() {
        let first = message("a", "n", "1");
        let second = message("b", "n", "2");
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(&first, &mut buf).unwrap();
        codec.encode(&second, &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(first));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(second));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn malformed_header_consumes_one_block_and_recovers() {
        let good = message("after", "ok", "yes");
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_slice(&[b'!'; HEADER_LEN]);
        codec.encode(&good, &mut buf).unwrap();

        assert!(matches!(
            codec.decode(&mut buf),
            Err(CommError::MalformedHeader(_))
        ));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(good));
    }

    #[test]
    fn malformed_body_consumes_its_bytes_and_recovers() {
        let good = message("after", "ok", "yes");
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        let bad_body = b"{broken";
        buf.put_slice(&frame::encode_header("bad", bad_body.len()).unwrap());
        buf.put_slice(bad_body);
        codec.encode(&good, &mut buf).unwrap();

        assert!(matches!(
            codec.decode(&mut buf),
            Err(CommError::MalformedBody(_))
        ));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(good));
    }

    #[test]
    fn encoder_emits_header_block_then_body() {
        let msg = message("subject", "k", "v");
        let mut buf = BytesMut::new();
        FrameCodec::new().encode(&msg, &mut buf).unwrap();

        let (length, subject) = frame::decode_header(&buf[..HEADER_LEN]).unwrap();
        assert_eq!(subject, "subject");
        assert_eq!(buf.len(), HEADER_LEN + length);
    }
}
