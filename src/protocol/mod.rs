//! Wire Framing
//!
//! Every request and response exchanged with a node is a proto header
//! followed by a body of the declared length. The engine only understands
//! this framing; body contents belong to the command's response handler.
//!
//! ## Modules
//!
//! - `types`: `ProtoHeader`, `MessageType`, framing constants and `frame()`
//! - `parser`: header decoding and validation
//!
//! ## Example
//!
//! ```
//! use flashclient::protocol::{frame, MessageType, ProtoHeader, PROTO_HEADER_SIZE};
//!
//! let msg = frame(MessageType::Message, b"payload");
//! let header = ProtoHeader::decode(&msg[..PROTO_HEADER_SIZE]).unwrap();
//! assert_eq!(header.body_len(), 7);
//! ```

pub mod parser;
pub mod types;

// Re-export commonly used types for convenience
pub use parser::{ParseResult, ProtoError};
pub use types::{
    frame, MessageType, ProtoHeader, AUTH_RESULT_CODE_OFFSET, MAX_PROTO_BODY_SIZE,
    MSG_HEADER_SIZE, PROTO_HEADER_SIZE, PROTO_VERSION,
};
