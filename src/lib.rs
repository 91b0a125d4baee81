//! # FlashClient - Asynchronous Command Engine for a Database Client
//!
//! FlashClient drives binary request/response commands against cluster
//! nodes over non-blocking sockets. Each command is a small state machine
//! that survives partial reads and writes, TLS handshakes that want to read
//! while the command wants to write, authentication, retries and timeouts.
//!
//! ## Features
//!
//! - **Per-thread event loops**: each loop owns its sockets; other threads
//!   only talk to it through a submission queue
//! - **Connection pooling**: idle connections per node, validated on reuse
//! - **Pipelining**: many commands on one connection, responses matched in
//!   order
//! - **TLS**: rustls sessions driven over the same non-blocking sockets
//! - **Retries and timeouts**: socket and total deadlines, pluggable retry
//!   policy, per-command cancellation
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                             FlashClient                                 │
//! │                                                                         │
//! │  application ──submit──► ┌──────────────────┐                           │
//! │  threads                 │ SubmissionQueue  │ (mutex + wakeup)          │
//! │                          └────────┬─────────┘                           │
//! │                                   ▼                                     │
//! │  ┌──────────────────────────────────────────────────────────────────┐   │
//! │  │ EventLoop thread (one of N)                                      │   │
//! │  │                                                                  │   │
//! │  │   LoopContext ── retry policy ── per-node ConnectionPool        │   │
//! │  │        │                          per-node Pipelines            │   │
//! │  │        ▼                                                         │   │
//! │  │   driver: select!(ready, deadline, cancel)                      │   │
//! │  │        │                                                         │   │
//! │  │        ▼                                                         │   │
//! │  │   dispatch: TLS_CONNECT → AUTH_* → COMMAND_WRITE →               │   │
//! │  │             COMMAND_READ_HEADER ⇄ COMMAND_READ_BODY → DONE       │   │
//! │  └──────────────────────────────────────────────────────────────────┘   │
//! │                                   │                                     │
//! │                                   ▼                                     │
//! │               ResponseHandler::on_success / on_error (exactly once)     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use flashclient::{Collector, EngineConfig, EventLoops, Node};
//! use flashclient::protocol::{frame, MessageType};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let loops = EventLoops::with_config(EngineConfig::default())?;
//!     let node = Arc::new(Node::new("A1", vec!["127.0.0.1:3000".parse()?])?);
//!
//!     let (collector, rx) = Collector::single();
//!     let cmd = loops.command(node, frame(MessageType::Message, b"request"), Box::new(collector));
//!     loops.submit(cmd);
//!
//!     match rx.await? {
//!         Ok(response) => println!("{} bytes", response.body().len()),
//!         Err(err) if err.in_doubt() => println!("may have been applied: {}", err),
//!         Err(err) => println!("not applied: {}", err),
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`protocol`]: proto header framing
//! - [`cluster`]: the `Node` a command targets
//! - [`command`]: the command state machine and step functions
//! - [`connection`]: sockets, TLS, pooling and pipelining
//! - [`event`]: event loop threads, submission queue and drivers
//! - [`config`]: engine configuration and command policies
//! - [`error`]: the error type delivered to callbacks
//!
//! ## Design Highlights
//!
//! ### Single Ownership
//!
//! A command is boxed on submission and moved, never shared. A connection
//! and its pool belong to one loop thread. Neither needs a lock.
//!
//! ### Explicit Continuations
//!
//! Step functions return `Progress::Pending`, `Done` or `Failed` instead of
//! calling back into the loop, so every suspension point is visible and the
//! whole state machine runs against a scripted transport in tests.
//!
//! ### In-Doubt Errors
//!
//! Once any request byte has been written, a failure is reported as in
//! doubt: the server may have applied the command.

pub mod cluster;
pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod protocol;

#[cfg(test)]
mod testing;

// Re-export commonly used types for convenience
pub use cluster::{AuthToken, Node};
pub use command::{Collector, Command, Response, ResponseHandler, RetryPolicy};
pub use config::{CommandPolicy, EngineConfig, TlsConfig};
pub use error::{ClientError, ClientResult, ErrorKind};
pub use event::{EventLoop, EventLoops, LoopContext};
pub use protocol::{MessageType, ProtoHeader};

/// Version of FlashClient
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
