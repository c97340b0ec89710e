//! Core types shared across the commlink protocol stack

use serde_json::{Map, Value};
use thiserror::Error;

use crate::frame::HEADER_LEN;

/// Subject of the identity-negotiation message a client must send first on
/// every connection and reconnection. Payload: `{"id": <client id>}`.
pub const SUBJECT_NEGOTIATION: &str = "negotiation";

/// Subject signalling orderly teardown, valid in either direction.
pub const SUBJECT_SHUTDOWN: &str = "shutdown";

/// Message payload: a flat JSON object. Values are by convention strings,
/// numbers, or booleans.
pub type Payload = Map<String, Value>;

/// A single application message: a subject string plus a JSON payload map.
///
/// The subject travels only in the frame header; the payload is the frame
/// body. Messages are immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    subject: String,
    payload: Payload,
}

impl Message {
    pub fn new(subject: impl Into<String>, payload: Payload) -> Self {
        Self {
            subject: subject.into(),
            payload,
        }
    }

    /// The negotiation handshake message carrying a client identity.
    pub fn negotiation(client_id: &str) -> Self {
        let mut payload = Payload::new();
        payload.insert("id".to_string(), Value::String(client_id.to_string()));
        Self::new(SUBJECT_NEGOTIATION, payload)
    }

    /// The orderly-teardown message. Carries an empty payload.
    pub fn shutdown() -> Self {
        Self::new(SUBJECT_SHUTDOWN, Payload::new())
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Convenience accessor for a string-valued payload entry.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// Error type for every fallible commlink operation.
#[derive(Debug, Error)]
pub enum CommError {
    /// The padded frame header would not fit its fixed 64-byte block.
    /// Fatal for that send operation only.
    #[error("frame header of {0} bytes exceeds the {HEADER_LEN}-byte header block")]
    HeaderOverflow(usize),

    /// A received header block did not parse. The frame is dropped and the
    /// stream continues.
    #[error("malformed frame header: {0}")]
    MalformedHeader(String),

    /// A received frame body did not parse. The frame is dropped and the
    /// stream continues.
    #[error("malformed frame body: {0}")]
    MalformedBody(String),

    /// A required field is missing or invalid. Rejected before any I/O.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The operation is not valid in the component's current state.
    #[error("invalid state transition: {0}")]
    InvalidStateTransition(String),

    /// `subscribe` was called with a verb outside the known event set.
    #[error("unknown event verb: {0}")]
    UnknownEvent(String),

    /// A socket or handshake deadline expired.
    #[error("connection timed out")]
    Timeout,

    /// The peer actively refused the connection.
    #[error("connection refused")]
    Refused,

    /// The peer dropped an established connection.
    #[error("connection lost")]
    ConnectionLost,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
