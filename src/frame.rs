//! Wire framing: a fixed 64-byte JSON header followed by a JSON body
//!
//! Header block: `{"length": <body bytes>, "subject": <subject>}` encoded as
//! UTF-8 JSON and right-padded with NUL bytes to exactly [`HEADER_LEN`]
//! bytes. Body: exactly `length` bytes of UTF-8 JSON (the payload map).
//! There is no compression and no checksum; framing integrity rides on TCP's
//! in-order reliable delivery.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::types::{CommError, Message};

/// Fixed size of the frame header block.
pub const HEADER_LEN: usize = 64;

/// Upper bound on a single socket read while filling a frame body.
pub const CHUNK_SIZE: usize = 2048;

/// Decode-side cap on the advertised body length. A header past this is
/// treated as malformed rather than honored.
pub const MAX_BODY_LEN: usize = 16 * 1024 * 1024;

#[derive(Serialize, Deserialize)]
struct FrameHeader {
    length: usize,
    subject: String,
}

/// Encode a message into a complete wire frame (header block + body).
///
/// Fails with [`CommError::HeaderOverflow`] when the header JSON does not fit
/// the fixed block, which bounds the subject length.
pub fn encode_frame(message: &Message) -> Result<Bytes, CommError> {
    let body = serde_json::to_vec(message.payload())
        .map_err(|e| CommError::MalformedBody(e.to_string()))?;
    let header = encode_header(message.subject(), body.len())?;

    let mut frame = BytesMut::with_capacity(HEADER_LEN + body.len());
    frame.put_slice(&header);
    frame.put_slice(&body);
    Ok(frame.freeze())
}

/// Encode just the NUL-padded header block for a body of `length` bytes.
pub fn encode_header(subject: &str, length: usize) -> Result<[u8; HEADER_LEN], CommError> {
    let header = FrameHeader {
        length,
        subject: subject.to_string(),
    };
    let raw = serde_json::to_vec(&header).map_err(|e| CommError::MalformedHeader(e.to_string()))?;
    if raw.len() > HEADER_LEN {
        return Err(CommError::HeaderOverflow(raw.len()));
    }

    let mut block = [0u8; HEADER_LEN];
    block[..raw.len()].copy_from_slice(&raw);
    Ok(block)
}

/// Decode a header block into `(body length, subject)`.
///
/// Trailing NUL padding is stripped before the JSON parse. Any parse failure,
/// a short block, or a body length past [`MAX_BODY_LEN`] is
/// [`CommError::MalformedHeader`].
pub fn decode_header(raw: &[u8]) -> Result<(usize, String), CommError> {
    if raw.len() != HEADER_LEN {
        return Err(CommError::MalformedHeader(format!(
            "header block is {} bytes, expected {HEADER_LEN}",
            raw.len()
        )));
    }
    let end = raw
        .iter()
        .rposition(|&b| b != 0)
        .map(|pos| pos + 1)
        .unwrap_or(0);
    let header: FrameHeader = serde_json::from_slice(&raw[..end])
        .map_err(|e| CommError::MalformedHeader(e.to_string()))?;
    if header.length > MAX_BODY_LEN {
        return Err(CommError::MalformedHeader(format!(
            "advertised body length {} exceeds cap {MAX_BODY_LEN}",
            header.length
        )));
    }
    Ok((header.length, header.subject))
}

/// Decode a frame body into a [`Message`] under the subject recovered from
/// its header.
pub fn decode_body(subject: &str, raw: &[u8]) -> Result<Message, CommError> {
    let payload = serde_json::from_slice(raw).map_err(|e| CommError::MalformedBody(e.to_string()))?;
    Ok(Message::new(subject, payload))
}
