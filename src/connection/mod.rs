//! Connection Module
//!
//! Everything between a command and the wire: opening sockets to a node,
//! wrapping them in TLS, reading and writing without blocking, and keeping
//! connections around for reuse.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Event loop                            │
//! └──────────────┬──────────────────────────────┬───────────────┘
//!                │ plain commands               │ pipelined commands
//!                ▼                              ▼
//!      ┌───────────────────┐          ┌───────────────────┐
//!      │  ConnectionPool   │          │     Pipeline      │
//!      │  (idle LIFO)      │          │  writer + readers │
//!      └─────────┬─────────┘          └─────────┬─────────┘
//!                │ acquire / open               │
//!                ▼                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Connection<Socket>                         │
//! │                                                             │
//! │   Socket::Plain ── TcpStream                                │
//! │   Socket::Tls   ── TcpStream + rustls ClientConnection      │
//! │                                                             │
//! │   read_once / write_once ──► IoStatus                       │
//! │     Done(n) | NeedRead | NeedWrite | Closed | Failed(err)   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - `socket`: the `Transport` trait, `IoStatus` and the plain socket
//! - `tls`: a rustls session driven over a non-blocking socket
//! - `connect`: opening a connection to a node, trying each address
//! - `handler`: the `Connection` wrapper and per-loop `LoopStats`
//! - `pool`: the per-node idle connection pool
//! - `pipeline`: many commands multiplexed over one connection

pub mod connect;
pub mod handler;
pub mod pipeline;
pub mod pool;
pub mod socket;
pub mod tls;

pub use connect::open;
pub use handler::{Connection, LoopStats};
pub use pipeline::{Finished, Pipeline};
pub use pool::{ConnectionPool, PoolError, PooledConnection, Release};
pub use socket::{IoStatus, PlainSocket, Socket, Transport};
pub use tls::TlsSocket;
