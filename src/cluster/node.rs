//! Server Node
//!
//! A `Node` is the engine's view of one cluster member: a stable name, the
//! addresses it can be reached on, an optional TLS identity and an optional
//! authentication request. Topology maintenance lives elsewhere; the engine
//! only reads a node and reports connection failures back to it.
//!
//! ## Address Order
//!
//! Addresses are stored IPv4 first, then IPv6. The node remembers the index
//! of the last address that accepted a connection and connection attempts
//! start there:
//!
//! ```text
//!            IPv4                 IPv6
//!   ┌─────┬─────┬─────┐     ┌─────┬─────┐
//!   │  0  │  1  │  2  │     │  3  │  4  │
//!   └─────┴─────┴─────┘     └─────┴─────┘
//!            ▲
//!          hint = 1
//!
//!   attempt order: 1, 2, 0, 3, 4
//! ```
//!
//! The hint is shared by every event loop and updated with relaxed stores.
//! Two loops racing to update it is harmless: the last writer wins and the
//! next connect simply starts from that address.

use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use tracing::debug;

use crate::error::{result_code, ClientError, ClientResult, ErrorKind};

/// Pre-built authentication request for a node that requires a user.
///
/// `request` is the complete framed admin message written before the first
/// command on every new connection.
#[derive(Debug, Clone)]
pub struct AuthToken {
    pub user: String,
    pub request: Bytes,
}

impl AuthToken {
    pub fn new(user: impl Into<String>, request: Bytes) -> Self {
        Self {
            user: user.into(),
            request,
        }
    }
}

/// A cluster member the engine can open connections to.
#[derive(Debug)]
pub struct Node {
    name: String,
    /// IPv4 addresses first, then IPv6
    addresses: Vec<SocketAddr>,
    v4_count: usize,
    /// Index of the last address that accepted a connection
    address_index: AtomicUsize,
    tls_name: Option<String>,
    auth: Option<AuthToken>,
    /// Connection attempts that failed since the last success
    failures: AtomicU32,
}

impl Node {
    /// Creates a node from its candidate addresses.
    ///
    /// Addresses are reordered IPv4 first; relative order within a family is
    /// preserved. An empty address list is rejected.
    pub fn new(name: impl Into<String>, addresses: Vec<SocketAddr>) -> ClientResult<Self> {
        let name = name.into();
        if addresses.is_empty() {
            return Err(ClientError::new(
                ErrorKind::Client,
                result_code::INVALID_NODE,
                format!("Node {} has no addresses", name),
            ));
        }

        let (mut ordered, v6): (Vec<SocketAddr>, Vec<SocketAddr>) =
            addresses.into_iter().partition(|a| a.is_ipv4());
        let v4_count = ordered.len();
        ordered.extend(v6);

        Ok(Self {
            name,
            addresses: ordered,
            v4_count,
            address_index: AtomicUsize::new(0),
            tls_name: None,
            auth: None,
            failures: AtomicU32::new(0),
        })
    }

    /// Sets the name presented for TLS server name indication and
    /// certificate verification.
    pub fn with_tls_name(mut self, tls_name: impl Into<String>) -> Self {
        self.tls_name = Some(tls_name.into());
        self
    }

    /// Requires every new connection to authenticate with `auth` first.
    pub fn with_auth(mut self, auth: AuthToken) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addresses(&self) -> &[SocketAddr] {
        &self.addresses
    }

    pub fn tls_name(&self) -> Option<&str> {
        self.tls_name.as_deref()
    }

    pub fn auth(&self) -> Option<&AuthToken> {
        self.auth.as_ref()
    }

    /// Returns true if connections must authenticate before commands.
    pub fn requires_auth(&self) -> bool {
        self.auth.is_some()
    }

    /// The current "last good" address index.
    pub fn address_index(&self) -> usize {
        self.address_index.load(Ordering::Relaxed) % self.addresses.len()
    }

    /// The address a connection attempt starts with.
    pub fn primary_address(&self) -> SocketAddr {
        self.addresses[self.address_index()]
    }

    /// Records that `index` accepted a connection. Best effort only.
    pub fn set_address_index(&self, index: usize) {
        if index < self.addresses.len() {
            self.address_index.store(index, Ordering::Relaxed);
            debug!(
                node = %self.name,
                address = %self.addresses[index],
                "Switched primary address"
            );
        }
    }

    /// Address indices in the order a connect should try them: the hint,
    /// the rest of the hint's family (wrapping), then the other family.
    pub fn connect_order(&self) -> Vec<usize> {
        let len = self.addresses.len();
        let primary = self.address_index();

        let (begin, end, other) = if primary < self.v4_count {
            (0, self.v4_count, self.v4_count..len)
        } else {
            (self.v4_count, len, 0..self.v4_count)
        };

        let mut order = Vec::with_capacity(len);
        order.extend(primary..end);
        order.extend(begin..primary);
        order.extend(other);
        order
    }

    /// Counts a failed connection attempt and returns the new total.
    pub fn record_failure(&self) -> u32 {
        self.failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn reset_failures(&self) {
        self.failures.store(0, Ordering::Relaxed);
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.primary_address())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs(list: &[&str]) -> Vec<SocketAddr> {
        list.iter().map(|a| a.parse().unwrap()).collect()
    }

    fn mixed_node() -> Node {
        // Deliberately interleaved: the node sorts IPv4 first.
        Node::new(
            "A1",
            addrs(&[
                "10.0.0.1:3000",
                "[::1]:3000",
                "10.0.0.2:3000",
                "[::2]:3000",
                "10.0.0.3:3000",
            ]),
        )
        .unwrap()
    }

    #[test]
    fn test_addresses_ipv4_first() {
        let node = mixed_node();
        let a = node.addresses();
        assert!(a[..3].iter().all(|a| a.is_ipv4()));
        assert!(a[3..].iter().all(|a| a.is_ipv6()));
        assert_eq!(a[1], "10.0.0.2:3000".parse().unwrap());
    }

    #[test]
    fn test_connect_order_from_ipv4_hint() {
        let node = mixed_node();
        assert_eq!(node.connect_order(), vec![0, 1, 2, 3, 4]);

        node.set_address_index(1);
        assert_eq!(node.connect_order(), vec![1, 2, 0, 3, 4]);
    }

    #[test]
    fn test_connect_order_from_ipv6_hint() {
        let node = mixed_node();
        node.set_address_index(4);
        assert_eq!(node.connect_order(), vec![4, 3, 0, 1, 2]);
        node.set_address_index(3);
        assert_eq!(node.connect_order(), vec![3, 4, 0, 1, 2]);
    }

    #[test]
    fn test_set_address_index_out_of_range_ignored() {
        let node = mixed_node();
        node.set_address_index(2);
        node.set_address_index(99);
        assert_eq!(node.address_index(), 2);
    }

    #[test]
    fn test_empty_addresses_rejected() {
        let err = Node::new("A1", Vec::new()).unwrap_err();
        assert_eq!(err.code(), result_code::INVALID_NODE);
    }

    #[test]
    fn test_failure_counter() {
        let node = mixed_node();
        assert_eq!(node.record_failure(), 1);
        assert_eq!(node.record_failure(), 2);
        node.reset_failures();
        assert_eq!(node.failures(), 0);
    }

    #[test]
    fn test_display_uses_primary_address() {
        let node = mixed_node();
        node.set_address_index(2);
        assert_eq!(node.to_string(), "A1 10.0.0.3:3000");
    }

    #[test]
    fn test_builders() {
        let node = mixed_node()
            .with_tls_name("db.example.com")
            .with_auth(AuthToken::new("admin", Bytes::from_static(b"auth")));
        assert_eq!(node.tls_name(), Some("db.example.com"));
        assert!(node.requires_auth());
        assert_eq!(node.auth().unwrap().user, "admin");
    }
}
