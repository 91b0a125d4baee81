//! TLS Session over a Non-Blocking Socket
//!
//! A rustls `ClientConnection` is a pure state machine: it never touches the
//! network itself. `TlsSocket` pumps ciphertext between the session and a
//! tokio `TcpStream` using `try_read`/`try_write`, so every call stays
//! non-blocking and readiness is cleared correctly on `WouldBlock`.
//!
//! ```text
//!   plaintext                       ciphertext
//!   ─────────►  writer() ──► session ──► write_tls ──► socket
//!   ◄─────────  reader() ◄── session ◄── read_tls  ◄── socket
//!                               │
//!                      process_new_packets
//! ```
//!
//! Because the session buffers decrypted records, a read can return data
//! without the socket being readable. [`Transport::has_pending`] exposes that
//! so the state machine keeps reading instead of waiting for an event that
//! will never arrive.

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::trace;

use crate::connection::socket::{IoStatus, Transport};
use crate::error::{ClientError, ClientResult};

/// Adapts a shared `TcpStream` to blocking-style `Read`/`Write` that report
/// `WouldBlock` instead of blocking.
struct SyncIo<'a>(&'a TcpStream);

impl Read for SyncIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.try_read(buf)
    }
}

impl Write for SyncIo<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.try_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A client TLS session bound to one socket.
pub struct TlsSocket {
    stream: TcpStream,
    session: ClientConnection,
}

impl TlsSocket {
    /// Starts a client session. No bytes are exchanged until the handshake
    /// is driven with [`Transport::handshake_once`].
    ///
    /// `tls_name` is used for SNI and certificate verification; without one
    /// the peer's IP address is verified instead.
    pub fn new(
        stream: TcpStream,
        config: Arc<ClientConfig>,
        tls_name: Option<&str>,
        peer: IpAddr,
    ) -> ClientResult<Self> {
        let server_name = match tls_name {
            Some(name) => ServerName::try_from(name.to_owned())
                .map_err(|e| ClientError::tls(format!("Invalid TLS name {}: {}", name, e)))?,
            None => ServerName::from(peer),
        };

        let session = ClientConnection::new(config, server_name)
            .map_err(|e| ClientError::tls(format!("TLS session setup failed: {}", e)))?;

        Ok(Self { stream, session })
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn is_handshaking(&self) -> bool {
        self.session.is_handshaking()
    }

    /// Writes buffered ciphertext until the session is drained or the
    /// socket would block.
    fn write_tls(&mut self) -> IoStatus {
        while self.session.wants_write() {
            match self.session.write_tls(&mut SyncIo(&self.stream)) {
                Ok(0) => return IoStatus::Closed,
                Ok(n) => trace!(bytes = n, "Wrote TLS records"),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return IoStatus::NeedWrite,
                Err(e) => return IoStatus::Failed(e),
            }
        }
        IoStatus::Done(0)
    }

    /// Reads available ciphertext into the session and decrypts it.
    fn read_tls(&mut self) -> IoStatus {
        match self.session.read_tls(&mut SyncIo(&self.stream)) {
            Ok(0) => IoStatus::Closed,
            Ok(n) => {
                trace!(bytes = n, "Read TLS records");
                if let Err(e) = self.session.process_new_packets() {
                    // Best effort: let the peer see the alert.
                    let _ = self.write_tls();
                    return IoStatus::Failed(io::Error::new(io::ErrorKind::InvalidData, e));
                }
                IoStatus::Done(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => IoStatus::NeedRead,
            Err(e) => IoStatus::Failed(e),
        }
    }
}

impl Transport for TlsSocket {
    fn read_once(&mut self, buf: &mut [u8]) -> IoStatus {
        loop {
            match self.session.reader().read(buf) {
                Ok(0) => return IoStatus::Closed,
                Ok(n) => return IoStatus::Done(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return IoStatus::Closed,
                Err(e) => return IoStatus::Failed(e),
            }

            // Session records (alerts, key updates) must leave before more
            // application data can arrive.
            match self.write_tls() {
                IoStatus::Done(_) => {}
                other => return other,
            }

            match self.read_tls() {
                IoStatus::Done(_) => continue,
                other => return other,
            }
        }
    }

    fn write_once(&mut self, buf: &[u8]) -> IoStatus {
        let accepted = match self.session.writer().write(buf) {
            Ok(n) => n,
            Err(e) => return IoStatus::Failed(e),
        };

        match self.write_tls() {
            IoStatus::Done(_) | IoStatus::NeedWrite if accepted > 0 => IoStatus::Done(accepted),
            IoStatus::Done(_) => IoStatus::NeedWrite,
            other => other,
        }
    }

    fn flush_once(&mut self) -> IoStatus {
        self.write_tls()
    }

    fn handshake_once(&mut self) -> IoStatus {
        loop {
            if self.session.wants_write() {
                match self.write_tls() {
                    IoStatus::Done(_) => {}
                    other => return other,
                }
            }

            if !self.session.is_handshaking() {
                return IoStatus::Done(0);
            }

            if !self.session.wants_read() {
                return IoStatus::NeedRead;
            }

            match self.read_tls() {
                IoStatus::Done(_) => continue,
                other => return other,
            }
        }
    }

    fn has_pending(&mut self) -> bool {
        match self.session.process_new_packets() {
            Ok(state) => state.plaintext_bytes_to_read() > 0,
            Err(_) => false,
        }
    }

    fn is_tls(&self) -> bool {
        true
    }

    fn is_reusable(&mut self) -> bool {
        if self.has_pending() {
            return false;
        }
        match self.session.read_tls(&mut SyncIo(&self.stream)) {
            Err(e) => e.kind() == io::ErrorKind::WouldBlock,
            Ok(_) => false,
        }
    }
}

impl fmt::Debug for TlsSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsSocket")
            .field("peer", &self.stream.peer_addr().ok())
            .field("handshaking", &self.session.is_handshaking())
            .finish()
    }
}
