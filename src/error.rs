//! Client Error Types
//!
//! Every command ends in exactly one terminal callback carrying either a
//! value or a [`ClientError`]. Errors are structured as a kind, a numeric
//! result code and a message, plus an `in_doubt` flag telling the caller
//! whether the request may have reached the server.
//!
//! ## Taxonomy
//!
//! | Kind                | Retried here | Typical cause                              |
//! |---------------------|--------------|--------------------------------------------|
//! | `Transport`         | yes          | connect failure, reset, peer closed        |
//! | `Tls`               | yes          | handshake failure, fatal TLS record error  |
//! | `Timeout`           | yes          | socket period or total deadline expired    |
//! | `Protocol`          | no           | bad header version/type, oversized body    |
//! | `Authentication`    | no           | non-zero auth return code                  |
//! | `ResourceExhausted` | no           | pool at capacity, submission queue full    |
//! | `Cancelled`         | no           | command cancellation token fired           |
//! | `Closed`            | no           | event loop closed, command abandoned       |
//! | `Client`            | no           | invalid arguments, impossible states       |

use std::fmt;

use crate::protocol::ProtoError;

/// Numeric result codes surfaced with every [`ClientError`].
///
/// Negative codes are raised by the client itself; positive codes come from
/// the server (authentication failures carry the server's return code).
pub mod result_code {
    pub const OK: i32 = 0;
    pub const CLIENT_ERROR: i32 = -1;
    pub const CLIENT_ABORT: i32 = -5;
    pub const ASYNC_CONNECTION: i32 = -6;
    pub const NO_MORE_CONNECTIONS: i32 = -7;
    pub const INVALID_NODE: i32 = -8;
    pub const TLS_ERROR: i32 = -9;
    pub const CONNECTION: i32 = -10;
    pub const ASYNC_QUEUE_FULL: i32 = -11;
    pub const TIMEOUT: i32 = 9;
}

/// Broad classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transport,
    Protocol,
    Tls,
    Timeout,
    ResourceExhausted,
    Authentication,
    Cancelled,
    Closed,
    Client,
}

impl ErrorKind {
    /// Returns true if failures of this kind may succeed on another attempt.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transport | ErrorKind::Tls | ErrorKind::Timeout)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Tls => "tls",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ResourceExhausted => "resource exhausted",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Closed => "closed",
            ErrorKind::Client => "client",
        };
        f.write_str(name)
    }
}

/// Which deadline expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// No read activity during a whole socket timeout period.
    Socket,
    /// The deadline spanning every attempt of the command passed.
    Total,
}

/// The error delivered to a command's terminal callback.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} error {code}: {message}")]
pub struct ClientError {
    kind: ErrorKind,
    code: i32,
    message: String,
    in_doubt: bool,
}

impl ClientError {
    /// Creates an error from its parts.
    pub fn new(kind: ErrorKind, code: i32, message: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
            in_doubt: false,
        }
    }

    /// Socket-level failure on an established or connecting connection.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, result_code::ASYNC_CONNECTION, message)
    }

    /// Socket-level failure with the underlying I/O error appended.
    pub fn io(context: &str, err: &std::io::Error) -> Self {
        Self::connection(format!("{}: {}", context, err))
    }

    pub fn tls(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Tls, result_code::TLS_ERROR, message)
    }

    pub fn timeout(which: TimeoutKind) -> Self {
        let message = match which {
            TimeoutKind::Socket => "socket timeout",
            TimeoutKind::Total => "total timeout",
        };
        Self::new(ErrorKind::Timeout, result_code::TIMEOUT, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, result_code::CLIENT_ERROR, message)
    }

    /// Authentication rejected by the server with the given return code.
    pub fn authentication(code: u8) -> Self {
        Self::new(
            ErrorKind::Authentication,
            i32::from(code),
            format!("Authentication failed: return code {}", code),
        )
    }

    /// Node connection limit reached on this event loop.
    pub fn no_more_connections(node: &str, max: usize) -> Self {
        Self::new(
            ErrorKind::ResourceExhausted,
            result_code::NO_MORE_CONNECTIONS,
            format!("Max node {} async connections would be exceeded: {}", node, max),
        )
    }

    pub fn queue_full(max: usize) -> Self {
        Self::new(
            ErrorKind::ResourceExhausted,
            result_code::ASYNC_QUEUE_FULL,
            format!("Async submission queue full: {}", max),
        )
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, result_code::CLIENT_ABORT, "command cancelled")
    }

    pub fn closed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Closed, result_code::CLIENT_ABORT, message)
    }

    pub fn client(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Client, result_code::CLIENT_ERROR, message)
    }

    /// Marks whether the request may have been applied by the server.
    pub fn set_in_doubt(mut self, in_doubt: bool) -> Self {
        self.in_doubt = in_doubt;
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// True when some request bytes were written before the failure, so the
    /// server may have applied the command.
    pub fn in_doubt(&self) -> bool {
        self.in_doubt
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == ErrorKind::Timeout
    }
}

impl From<ProtoError> for ClientError {
    fn from(err: ProtoError) -> Self {
        ClientError::protocol(err.to_string())
    }
}

/// Result alias used across the crate.
pub type ClientResult<T> = Result<T, ClientError>;
