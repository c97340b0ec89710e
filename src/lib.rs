//! # Commlink
//!
//! A bidirectional messaging layer between a set of named clients and a
//! central server over TCP:
//!
//! * **Named identities**: every client negotiates a persistent id right
//!   after connecting
//! * **Typed messages**: a subject string plus a flat JSON payload map
//! * **Length-framed**: fixed 64-byte header, variable body, no ambiguity
//! * **Self-healing**: clients reconnect automatically with exponential
//!   backoff, and the server reopens a known client's handler in place so
//!   queued messages survive the reconnect
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use commlink::{Client, Message, Payload, Server};
//!
//! # async fn example() -> Result<(), commlink::CommError> {
//! // Server side
//! let server = Server::new();
//! server.set_interface("*")?;
//! server.set_port(30000)?;
//! server.start().await?;
//!
//! // Client side
//! let client = Client::new(true);
//! client.set_address("127.0.0.1")?;
//! client.set_port(30000)?;
//! client.set_client_id(Client::generate_new_id())?;
//! client.subscribe("message", |event| println!("{event:?}"))?;
//! client.connect().await?;
//!
//! // Broadcast to every registered client
//! server.send("*", Message::new("echo", Payload::new()));
//! # Ok(())
//! # }
//! ```
//!
//! ## Wire Format
//!
//! Every message travels as one frame:
//!
//! - HEADER (64B): UTF-8 JSON `{"length": <body bytes>, "subject": <subject>}`,
//!   right-padded with NUL bytes
//! - BODY (`length` B): UTF-8 JSON encoding of the payload map
//!
//! The subject travels only in the header. A header that does not fit its
//! 64-byte block is a hard encode error; a received frame that does not
//! decode is dropped and the stream continues. There is no compression and
//! no checksum; framing integrity rides on TCP.
//!
//! ## Reserved Subjects
//!
//! | Subject       | Direction       | Description                           |
//! |---------------|-----------------|---------------------------------------|
//! | `negotiation` | Client → Server | Identity handshake; must be the first |
//! |               |                 | message on every (re)connection       |
//! | `shutdown`    | Both            | Orderly teardown                      |

pub mod client;
pub mod codec;
pub mod connection;
pub mod frame;
pub mod server;
pub mod types;

// Re-export main types for convenience
pub use types::{CommError, Message, Payload, SUBJECT_NEGOTIATION, SUBJECT_SHUTDOWN};

pub use client::{Client, ClientEvent, ClientStatus, ConnectionPhase, EventKind};
pub use codec::FrameCodec;
pub use connection::ConnectionHandler;
pub use frame::{decode_body, decode_header, encode_frame, CHUNK_SIZE, HEADER_LEN};
pub use server::{Server, StateUpdateCallback};
