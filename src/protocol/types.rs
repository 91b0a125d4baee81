//! Proto Header Framing Types
//!
//! Every message exchanged with a server node is framed by a fixed 8-byte
//! proto header followed by a body of the declared length.
//!
//! ## Header Format
//!
//! The header is a single big-endian 64-bit word:
//!
//! ```text
//!  63      56 55      48 47                                             0
//! ┌──────────┬──────────┬────────────────────────────────────────────────┐
//! │ version  │   type   │                body size (48 bits)             │
//! └──────────┴──────────┴────────────────────────────────────────────────┘
//! ```
//!
//! ## Examples
//!
//! Admin message with a 16-byte body: `02 02 00 00 00 00 00 10`
//! Data message with a 22-byte body:   `02 03 00 00 00 00 00 16`

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Protocol version written into and expected in every header.
pub const PROTO_VERSION: u8 = 2;

/// Size of the proto header preceding every body.
pub const PROTO_HEADER_SIZE: usize = 8;

/// Size of a data-message header. A body of exactly this size carries no
/// records and is how streaming responses mark their last block.
pub const MSG_HEADER_SIZE: usize = 22;

/// Largest body size accepted from a server (128 MiB).
pub const MAX_PROTO_BODY_SIZE: u64 = 128 * 1024 * 1024;

/// Offset of the return code inside an authentication response body.
/// Byte 0 of the admin header is reserved.
pub const AUTH_RESULT_CODE_OFFSET: usize = 1;

/// Largest value the 48-bit size field can hold.
pub const PROTO_SIZE_MASK: u64 = 0xFFFF_FFFF_FFFF;

/// Message type discriminants
pub mod message_type {
    pub const INFO: u8 = 1;
    pub const ADMIN: u8 = 2;
    pub const MESSAGE: u8 = 3;
    pub const COMPRESSED: u8 = 4;
}

/// The kind of message a header frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Textual info request/response.
    Info,
    /// Administrative message; authentication uses this type.
    Admin,
    /// Data command request/response.
    Message,
    /// Compressed data message; the body is handed to the parser untouched.
    Compressed,
}

impl MessageType {
    /// Returns the wire discriminant.
    pub fn as_u8(self) -> u8 {
        match self {
            MessageType::Info => message_type::INFO,
            MessageType::Admin => message_type::ADMIN,
            MessageType::Message => message_type::MESSAGE,
            MessageType::Compressed => message_type::COMPRESSED,
        }
    }

    /// Maps a wire discriminant back to a message type.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            message_type::INFO => Some(MessageType::Info),
            message_type::ADMIN => Some(MessageType::Admin),
            message_type::MESSAGE => Some(MessageType::Message),
            message_type::COMPRESSED => Some(MessageType::Compressed),
            _ => None,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Info => write!(f, "info"),
            MessageType::Admin => write!(f, "admin"),
            MessageType::Message => write!(f, "message"),
            MessageType::Compressed => write!(f, "compressed"),
        }
    }
}

/// A decoded proto header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtoHeader {
    /// Protocol version (always [`PROTO_VERSION`] for accepted headers)
    pub version: u8,
    /// What the body contains
    pub msg_type: MessageType,
    /// Number of body bytes following the header
    pub size: u64,
}

impl ProtoHeader {
    /// Creates a header for the current protocol version.
    pub fn new(msg_type: MessageType, size: u64) -> Self {
        Self {
            version: PROTO_VERSION,
            msg_type,
            size,
        }
    }

    /// Encodes the header into its 8-byte wire form.
    pub fn encode(&self) -> [u8; PROTO_HEADER_SIZE] {
        let word = (u64::from(self.version) << 56)
            | (u64::from(self.msg_type.as_u8()) << 48)
            | (self.size & PROTO_SIZE_MASK);
        word.to_be_bytes()
    }

    /// Appends the encoded header to a buffer.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.encode());
    }

    /// Body size as a buffer length.
    pub fn body_len(&self) -> usize {
        self.size as usize
    }
}

/// Frames a body with a proto header, producing a complete wire message.
///
/// # Example
/// ```
/// use flashclient::protocol::{frame, MessageType, PROTO_HEADER_SIZE};
/// let msg = frame(MessageType::Message, b"abc");
/// assert_eq!(msg.len(), PROTO_HEADER_SIZE + 3);
/// assert_eq!(&msg[..2], &[2, 3]);
/// ```
pub fn frame(msg_type: MessageType, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(PROTO_HEADER_SIZE + body.len());
    ProtoHeader::new(msg_type, body.len() as u64).encode_into(&mut buf);
    buf.put_slice(body);
    buf.freeze()
}
