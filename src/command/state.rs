//! Command States
//!
//! ```text
//!   Queued ─► Connecting ─► TlsConnect ─► AuthWrite ─► AuthReadHeader ─► AuthReadBody
//!                                                                             │
//!        ┌────────────────────────────────────────────────────────────────────┘
//!        ▼
//!   CommandWrite ─► CommandReadHeader ─► CommandReadBody ─► Done
//!                          ▲                    │
//!                          └── more blocks ─────┘
//! ```
//!
//! States only move forward, with two exceptions: a multi-block response
//! loops from `CommandReadBody` back to `CommandReadHeader`, and a retry
//! resets the command to `Queued` for its next attempt.

use std::fmt;

/// Where a command is in its request/response exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CommandState {
    /// Waiting in a submission queue or pipeline queue
    Queued,
    /// Waiting for a connection to be opened
    Connecting,
    /// Driving the TLS handshake on a new connection
    TlsConnect,
    /// Writing the authentication request
    AuthWrite,
    /// Reading the authentication response header
    AuthReadHeader,
    /// Reading the authentication response body
    AuthReadBody,
    /// Writing the command request
    CommandWrite,
    /// Reading a response block header
    CommandReadHeader,
    /// Reading a response block body
    CommandReadBody,
    /// Response fully parsed
    Done,
}

impl CommandState {
    /// Returns true if moving from `self` to `next` is allowed.
    pub fn can_transition_to(self, next: CommandState) -> bool {
        next > self
            || next == self
            || (self == CommandState::CommandReadBody && next == CommandState::CommandReadHeader)
            || next == CommandState::Queued
    }

    /// States in which bytes already buffered inside the transport can move
    /// the command forward without a readiness event.
    pub fn reads_buffered_data(self) -> bool {
        matches!(
            self,
            CommandState::TlsConnect
                | CommandState::AuthReadHeader
                | CommandState::AuthReadBody
                | CommandState::CommandReadHeader
                | CommandState::CommandReadBody
        )
    }

    /// True once any part of the connection setup or request is in progress.
    pub fn is_on_connection(self) -> bool {
        self >= CommandState::TlsConnect && self < CommandState::Done
    }
}

impl fmt::Display for CommandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandState::Queued => "QUEUED",
            CommandState::Connecting => "CONNECTING",
            CommandState::TlsConnect => "TLS_CONNECT",
            CommandState::AuthWrite => "AUTH_WRITE",
            CommandState::AuthReadHeader => "AUTH_READ_HEADER",
            CommandState::AuthReadBody => "AUTH_READ_BODY",
            CommandState::CommandWrite => "COMMAND_WRITE",
            CommandState::CommandReadHeader => "COMMAND_READ_HEADER",
            CommandState::CommandReadBody => "COMMAND_READ_BODY",
            CommandState::Done => "DONE",
        };
        f.write_str(name)
    }
}
