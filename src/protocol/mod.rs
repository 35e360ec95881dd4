//! Client-server communication protocol.
//!
//! This module defines the messages exchanged between Sift clients and the server and
//! the framing used to carry them over a TCP byte stream.
//!
//! # Key Components
//!
//! - [`Message`]: Typed envelope `{kind, payload}` sent in either direction.
//! - [`Value`]: Self-describing payload value, including raw bytes for plot images.
//! - [`ProtocolTransport`]: Reads and writes framed messages over any `Read + Write` stream.
//!
//! # Binary Format
//!
//! - Each frame starts with a 4 byte, big-endian, unsigned body length.
//! - The body is the bincode encoding (big-endian, fixed-width integers) of the tuple
//!   `(kind: String, payload: Map<String, Value>)`.
//! - Byte strings are written with an explicit length, so arbitrary binary round-trips.
//!
//! A declared length above the configured cap is rejected before any body byte is read.
//! Inside a body, `List`/`Map` nesting deeper than [`MAX_NESTING_DEPTH`] is a decode error.
//! Framing errors are never recovered from: the connection is closed.
//!
//! # See Also
//!
//! - [`server`](crate::server): Handles decoded messages per connection.
mod message;
mod transport;

pub use message::{
    MAX_NESTING_DEPTH, Message, MessageKind, Payload, STATUS_ERROR, STATUS_OK, Value,
    payload_to_json,
};
pub use transport::{
    DEFAULT_MAX_MESSAGE_SIZE, MAX_MESSAGE_SIZE_LIMIT, ProtocolTransport, Received,
    TransportError, decode_body, encode,
};
