//! Connection Establishment
//!
//! Opens a socket to a node, trying its addresses in the node's connect
//! order, and wraps it in TLS when the engine is configured for it. The
//! TLS handshake itself is not performed here: it is the first state of the
//! command that uses the connection.

use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpSocket, TcpStream};
use tracing::{debug, trace, warn};

use crate::cluster::Node;
use crate::config::EngineConfig;
use crate::connection::socket::{PlainSocket, Socket};
use crate::connection::tls::TlsSocket;
use crate::error::{ClientError, ClientResult};

/// Opens a new socket to `node`.
///
/// The first address that accepts wins. If it is not the node's current
/// primary, the node's hint is moved to it. When every address fails the
/// error names the node and its primary address.
pub async fn open(node: &Node, config: &EngineConfig) -> ClientResult<Socket> {
    let primary = node.address_index();

    for index in node.connect_order() {
        let addr = node.addresses()[index];
        match connect_addr(addr, config).await {
            Ok(stream) => {
                if index != primary {
                    node.set_address_index(index);
                }
                trace!(node = %node.name(), address = %addr, "Socket connected");
                return wrap(stream, node, addr, config);
            }
            Err(e) => {
                debug!(node = %node.name(), address = %addr, error = %e, "Connect attempt failed");
            }
        }
    }

    warn!(node = %node, "All node addresses failed");
    Err(ClientError::connection(format!("Failed to connect: {}", node)))
}

/// Creates a socket for the address family, applies buffer sizes and
/// TCP_NODELAY, and connects.
async fn connect_addr(addr: SocketAddr, config: &EngineConfig) -> io::Result<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };

    if let Some(size) = config.send_buffer_size {
        socket.set_send_buffer_size(size)?;
    }
    if let Some(size) = config.recv_buffer_size {
        socket.set_recv_buffer_size(size)?;
    }
    socket.set_nodelay(true)?;

    socket.connect(addr).await
}

fn wrap(
    stream: TcpStream,
    node: &Node,
    addr: SocketAddr,
    config: &EngineConfig,
) -> ClientResult<Socket> {
    match &config.tls {
        Some(tls) => {
            let session = TlsSocket::new(
                stream,
                tls.client_config.clone(),
                node.tls_name(),
                addr.ip(),
            )?;
            Ok(Socket::Tls(Box::new(session)))
        }
        None => Ok(Socket::Plain(PlainSocket::new(stream))),
    }
}
