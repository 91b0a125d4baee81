//! Non-Blocking Socket Primitive
//!
//! The state machine never awaits a socket. It calls a step function that
//! moves as many bytes as the socket accepts right now and reports one of
//! four outcomes:
//!
//! ```text
//!   code   IoStatus          meaning
//!   ────   ───────────────   ─────────────────────────────────────────────
//!    > 0   Done(n)           n bytes transferred
//!     -1   NeedRead          wait for read readiness before retrying
//!     -2   NeedWrite         wait for write readiness before retrying
//!      0   Closed            peer closed the connection
//!   < -2   Failed(err)       fatal error
//! ```
//!
//! On a plain socket, `NeedRead` only comes from reads and `NeedWrite` only
//! from writes. A TLS session can redirect either way: a write may need the
//! peer's handshake bytes first, and a read may need to flush an alert or
//! key update. Keeping the redirection visible lets the caller subscribe to
//! the right readiness event instead of spinning.

use std::io;
use tokio::net::TcpStream;

use crate::connection::tls::TlsSocket;

/// Outcome of one non-blocking transfer attempt.
#[derive(Debug)]
pub enum IoStatus {
    /// Bytes were transferred. `Done(0)` is only returned by operations that
    /// had nothing left to do (flush, finished handshake).
    Done(usize),
    /// No progress until the socket becomes readable.
    NeedRead,
    /// No progress until the socket becomes writable.
    NeedWrite,
    /// The peer closed the connection.
    Closed,
    /// Fatal socket or TLS error.
    Failed(io::Error),
}

impl IoStatus {
    /// Signed result code: bytes, `-1`, `-2`, `0` on close, `-3` on failure.
    pub fn code(&self) -> isize {
        match self {
            IoStatus::Done(n) => *n as isize,
            IoStatus::NeedRead => -1,
            IoStatus::NeedWrite => -2,
            IoStatus::Closed => 0,
            IoStatus::Failed(_) => -3,
        }
    }

    /// Maps a std I/O result onto the four-way signal. Zero bytes on a
    /// non-empty transfer means the peer is gone.
    pub fn from_io(result: io::Result<usize>, would_block: IoStatus) -> IoStatus {
        match result {
            Ok(0) => IoStatus::Closed,
            Ok(n) => IoStatus::Done(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => would_block,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => would_block,
            Err(e) => IoStatus::Failed(e),
        }
    }
}

/// A byte transport the command state machine can drive.
///
/// Implementations must never block: every method either makes progress or
/// reports what it is waiting for.
pub trait Transport {
    /// Reads into `buf`, which is never empty.
    fn read_once(&mut self, buf: &mut [u8]) -> IoStatus;

    /// Writes from `buf`, which is never empty.
    fn write_once(&mut self, buf: &[u8]) -> IoStatus;

    /// Pushes out bytes buffered below the caller (TLS records).
    fn flush_once(&mut self) -> IoStatus {
        IoStatus::Done(0)
    }

    /// Advances a TLS handshake. `Done` once the session is established.
    fn handshake_once(&mut self) -> IoStatus {
        IoStatus::Done(0)
    }

    /// True when data is already buffered above the socket, so a read will
    /// make progress without another readiness event.
    fn has_pending(&mut self) -> bool {
        false
    }

    fn is_tls(&self) -> bool {
        false
    }

    /// Checks that an idle connection is still usable: not closed by the
    /// peer and without unsolicited bytes waiting.
    fn is_reusable(&mut self) -> bool;
}

/// A plain non-blocking TCP socket.
#[derive(Debug)]
pub struct PlainSocket {
    stream: TcpStream,
}

impl PlainSocket {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }
}

impl Transport for PlainSocket {
    fn read_once(&mut self, buf: &mut [u8]) -> IoStatus {
        IoStatus::from_io(self.stream.try_read(buf), IoStatus::NeedRead)
    }

    fn write_once(&mut self, buf: &[u8]) -> IoStatus {
        IoStatus::from_io(self.stream.try_write(buf), IoStatus::NeedWrite)
    }

    fn is_reusable(&mut self) -> bool {
        let mut probe = [0u8; 1];
        match self.stream.try_read(&mut probe) {
            Err(e) => e.kind() == io::ErrorKind::WouldBlock,
            // Closed by peer, or the server sent bytes nobody asked for.
            Ok(_) => false,
        }
    }
}

/// A connected socket, plain or TLS-wrapped. The variant is fixed when the
/// connection is established.
#[derive(Debug)]
pub enum Socket {
    Plain(PlainSocket),
    Tls(Box<TlsSocket>),
}

impl Socket {
    /// The underlying TCP stream, for readiness registration.
    pub fn stream(&self) -> &TcpStream {
        match self {
            Socket::Plain(s) => s.stream(),
            Socket::Tls(s) => s.stream(),
        }
    }
}

impl Transport for Socket {
    fn read_once(&mut self, buf: &mut [u8]) -> IoStatus {
        match self {
            Socket::Plain(s) => s.read_once(buf),
            Socket::Tls(s) => s.read_once(buf),
        }
    }

    fn write_once(&mut self, buf: &[u8]) -> IoStatus {
        match self {
            Socket::Plain(s) => s.write_once(buf),
            Socket::Tls(s) => s.write_once(buf),
        }
    }

    fn flush_once(&mut self) -> IoStatus {
        match self {
            Socket::Plain(s) => s.flush_once(),
            Socket::Tls(s) => s.flush_once(),
        }
    }

    fn handshake_once(&mut self) -> IoStatus {
        match self {
            Socket::Plain(s) => s.handshake_once(),
            Socket::Tls(s) => s.handshake_once(),
        }
    }

    fn has_pending(&mut self) -> bool {
        match self {
            Socket::Plain(s) => s.has_pending(),
            Socket::Tls(s) => s.has_pending(),
        }
    }

    fn is_tls(&self) -> bool {
        matches!(self, Socket::Tls(_))
    }

    fn is_reusable(&mut self) -> bool {
        match self {
            Socket::Plain(s) => s.is_reusable(),
            Socket::Tls(s) => s.is_reusable(),
        }
    }
}
