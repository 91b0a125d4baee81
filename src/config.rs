//! Engine Configuration
//!
//! Plain structs with public fields and sensible defaults. Build one with
//! struct update syntax:
//!
//! ```
//! use flashclient::config::{CommandPolicy, EngineConfig};
//! use std::time::Duration;
//!
//! let config = EngineConfig {
//!     event_loops: 4,
//!     pipelining: true,
//!     policy: CommandPolicy {
//!         total_timeout: Some(Duration::from_millis(500)),
//!         ..CommandPolicy::default()
//!     },
//!     ..EngineConfig::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use rustls::ClientConfig;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ClientError, ClientResult};

/// Timeouts and retry limits applied to a command.
#[derive(Debug, Clone)]
pub struct CommandPolicy {
    /// Longest period without read activity on an attempt (default: 30s).
    /// `None` disables the socket timer.
    pub socket_timeout: Option<Duration>,

    /// Deadline spanning every attempt of the command (default: 1s).
    /// `None` means no overall deadline.
    pub total_timeout: Option<Duration>,

    /// Retries allowed after the first attempt (default: 2)
    pub max_retries: u32,

    /// Delay before each retry (default: none)
    pub sleep_between_retries: Duration,
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self {
            socket_timeout: Some(Duration::from_secs(30)),
            total_timeout: Some(Duration::from_secs(1)),
            max_retries: 2,
            sleep_between_retries: Duration::ZERO,
        }
    }
}

/// TLS settings. Certificates and verification are configured by the caller
/// on the rustls `ClientConfig`; the node's TLS name is used for SNI.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub client_config: Arc<ClientConfig>,
}

impl TlsConfig {
    pub fn new(client_config: Arc<ClientConfig>) -> Self {
        Self { client_config }
    }
}

/// Configuration for a set of event loops.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of event loop threads (default: 1)
    pub event_loops: usize,

    /// Connection limit per node, per event loop (default: 100)
    pub max_conns_per_node: usize,

    /// Idle connections kept per node, per event loop (default: 100)
    pub max_idle_per_node: usize,

    /// Idle connections older than this are closed instead of reused
    /// (default: 55s). `None` keeps them forever.
    pub max_socket_idle: Option<Duration>,

    /// Multiplex commands over pipelined connections (default: false)
    pub pipelining: bool,

    /// Submission queue bound per loop; 0 means unbounded (default: 0)
    pub max_queue_size: usize,

    /// SO_SNDBUF for new sockets (default: OS default)
    pub send_buffer_size: Option<u32>,

    /// SO_RCVBUF for new sockets (default: OS default)
    pub recv_buffer_size: Option<u32>,

    /// Wrap every connection in TLS (default: plain TCP)
    pub tls: Option<TlsConfig>,

    /// Default command policy
    pub policy: CommandPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_loops: 1,
            max_conns_per_node: 100,
            max_idle_per_node: 100,
            max_socket_idle: Some(Duration::from_secs(55)),
            pipelining: false,
            max_queue_size: 0,
            send_buffer_size: None,
            recv_buffer_size: None,
            tls: None,
            policy: CommandPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Rejects configurations the engine cannot run with.
    pub fn validate(&self) -> ClientResult<()> {
        if self.event_loops == 0 {
            return Err(ClientError::client("event_loops must be at least 1"));
        }
        if self.max_conns_per_node == 0 {
            return Err(ClientError::client("max_conns_per_node must be at least 1"));
        }
        if self.max_idle_per_node > self.max_conns_per_node {
            return Err(ClientError::client(format!(
                "max_idle_per_node ({}) exceeds max_conns_per_node ({})",
                self.max_idle_per_node, self.max_conns_per_node
            )));
        }
        Ok(())
    }
}
