//! Proto Header Decoder
//!
//! Headers arrive in pieces over a non-blocking socket, so decoding is only
//! attempted once all [`PROTO_HEADER_SIZE`] bytes are in the read buffer.
//! The decoder validates the header and tells the command how large a body
//! buffer it needs.
//!
//! ## Validation
//!
//! 1. **Length**: fewer than 8 bytes is a caller bug and reported as truncated.
//! 2. **Version**: anything but [`PROTO_VERSION`] means the peer speaks
//!    something else, which is never retried.
//! 3. **Type**: unknown discriminants are rejected.
//! 4. **Size**: bodies above [`MAX_PROTO_BODY_SIZE`] are rejected before any
//!    buffer is allocated for them.

use crate::protocol::types::{
    MessageType, ProtoHeader, MAX_PROTO_BODY_SIZE, PROTO_HEADER_SIZE, PROTO_SIZE_MASK,
    PROTO_VERSION,
};
use bytes::Buf;
use thiserror::Error;

/// Errors that can occur while decoding a proto header.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtoError {
    /// Not enough bytes to hold a header
    #[error("truncated proto header: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    /// Header carries a protocol version this client does not speak
    #[error("unsupported proto version: {0}")]
    UnsupportedVersion(u8),

    /// Header carries an unknown message type
    #[error("unknown proto message type: {0}")]
    UnknownMessageType(u8),

    /// Declared body exceeds the sane bound
    #[error("proto body too large: {size} bytes (max: {max})")]
    BodyTooLarge { size: u64, max: u64 },
}

/// Result type for decoding operations.
pub type ParseResult<T> = Result<T, ProtoError>;

impl ProtoHeader {
    /// Decodes and validates a header from the first 8 bytes of `buf`.
    ///
    /// # Example
    ///
    /// ```
    /// use flashclient::protocol::{MessageType, ProtoHeader};
    ///
    /// let header = ProtoHeader::decode(&[2, 3, 0, 0, 0, 0, 0, 20]).unwrap();
    /// assert_eq!(header.msg_type, MessageType::Message);
    /// assert_eq!(header.size, 20);
    /// ```
    pub fn decode(mut buf: &[u8]) -> ParseResult<Self> {
        if buf.len() < PROTO_HEADER_SIZE {
            return Err(ProtoError::Truncated {
                needed: PROTO_HEADER_SIZE,
                got: buf.len(),
            });
        }

        let word = buf.get_u64();
        let version = (word >> 56) as u8;
        let type_byte = (word >> 48) as u8;
        let size = word & PROTO_SIZE_MASK;

        if version != PROTO_VERSION {
            return Err(ProtoError::UnsupportedVersion(version));
        }

        let msg_type =
            MessageType::from_u8(type_byte).ok_or(ProtoError::UnknownMessageType(type_byte))?;

        if size > MAX_PROTO_BODY_SIZE {
            return Err(ProtoError::BodyTooLarge {
                size,
                max: MAX_PROTO_BODY_SIZE,
            });
        }

        Ok(Self {
            version,
            msg_type,
            size,
        })
    }
}
