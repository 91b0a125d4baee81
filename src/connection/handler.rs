//! Connection Handle
//!
//! A `Connection` owns one transport plus the bookkeeping the event loop
//! needs around it: which readiness events it is subscribed to, whether the
//! TLS handshake and authentication have already been done, and when it
//! was last used.
//!
//! ## Connection Lifecycle
//!
//! ```text
//! 1. connect::open()          (new socket, TLS session not started)
//!        │
//!        ▼
//! 2. first command            TLS_CONNECT → AUTH_* → COMMAND_*
//!        │                    marks `secured` / `authenticated`
//!        ▼
//! 3. ┌──────────────────────────────┐
//!    │  plain: back to the pool     │◄──── acquire: validate, reuse
//!    │  pipelined: stays with pipe  │      (starts at COMMAND_WRITE)
//!    └──────────────┬───────────────┘
//!                   │ error / pool full / idle too long / node removed
//!                   ▼
//! 4. dropped (socket closed, live count decremented)
//! ```
//!
//! ## Watch State
//!
//! Re-subscribing to the readiness set the connection already watches is a
//! no-op. [`Connection::watch`] reports whether anything changed and counts
//! real changes, so tests can assert that the state machine does not churn
//! its subscriptions.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{Interest, Ready};
use tokio::time::{Duration, Instant};

use crate::connection::pool::PooledConnection;
use crate::connection::socket::{Socket, Transport};

/// Per-loop statistics, shared with the owning [`EventLoop`](crate::event::EventLoop).
#[derive(Debug, Default)]
pub struct LoopStats {
    /// Commands accepted by the loop
    pub submitted: AtomicU64,
    /// Commands completed successfully
    pub completed: AtomicU64,
    /// Commands completed with an error
    pub failed: AtomicU64,
    /// Retry attempts scheduled
    pub retries: AtomicU64,
    /// Commands that failed with a timeout
    pub timeouts: AtomicU64,
    /// Sockets opened
    pub connections_opened: AtomicU64,
    /// Sockets closed
    pub connections_closed: AtomicU64,
    /// Failed connection attempts
    pub connect_failures: AtomicU64,
    /// Failed connection attempts since the last successful connect
    pub consecutive_connect_errors: AtomicU64,
}

impl LoopStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn command_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_failed(&self, timeout: bool) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.timeouts.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn command_retried(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
        self.consecutive_connect_errors.store(0, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connect_failed(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
        self.consecutive_connect_errors
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Connections currently open on the loop.
    pub fn open_connections(&self) -> u64 {
        self.connections_opened
            .load(Ordering::Relaxed)
            .saturating_sub(self.connections_closed.load(Ordering::Relaxed))
    }
}

/// One connection to a node, owned by a single event loop.
#[derive(Debug)]
pub struct Connection<T> {
    id: u64,
    transport: T,
    watching: Option<Interest>,
    rearms: u64,
    secured: bool,
    authenticated: bool,
    last_used: Instant,
}

impl<T: Transport> Connection<T> {
    /// Wraps a freshly connected transport. TLS transports start unsecured.
    pub fn new(id: u64, transport: T) -> Self {
        let secured = !transport.is_tls();
        Self {
            id,
            transport,
            watching: None,
            rearms: 0,
            secured,
            authenticated: false,
            last_used: Instant::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn transport(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Subscribes to `interest`. Returns false, changing nothing, when the
    /// connection already watches exactly that set.
    pub fn watch(&mut self, interest: Interest) -> bool {
        if self.watching == Some(interest) {
            return false;
        }
        self.watching = Some(interest);
        self.rearms += 1;
        true
    }

    /// Drops the readiness subscription.
    pub fn unwatch(&mut self) {
        self.watching = None;
    }

    pub fn watching(&self) -> Option<Interest> {
        self.watching
    }

    /// Number of real subscription changes over the connection's life.
    pub fn rearms(&self) -> u64 {
        self.rearms
    }

    /// True once the TLS handshake completed (always true for plain sockets).
    pub fn is_secured(&self) -> bool {
        self.secured
    }

    pub fn set_secured(&mut self) {
        self.secured = true;
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn set_authenticated(&mut self) {
        self.authenticated = true;
    }

    /// Records that the connection just finished serving a command.
    pub fn touch(&mut self) {
        self.last_used = Instant::now();
        self.watching = None;
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }
}

impl Connection<Socket> {
    /// Waits until the socket is ready for `interest`.
    pub async fn ready(&self, interest: Interest) -> io::Result<Ready> {
        self.transport.stream().ready(interest).await
    }
}

impl<T: Transport> PooledConnection for Connection<T> {
    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used)
    }

    fn validate(&mut self) -> bool {
        self.transport.is_reusable()
    }
}
