//! Cluster Collaborators
//!
//! The engine does not discover or maintain cluster topology. It is handed
//! [`Node`] values and only consumes what it needs to reach them: addresses,
//! a TLS identity and an optional authentication request.

pub mod node;

pub use node::{AuthToken, Node};
