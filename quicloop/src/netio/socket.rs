//! UDP socket creation and deadline-bounded receive.
//!
//! Sockets are built with socket2 for option control and then handed out as
//! plain `std::net::UdpSocket`s. Both sessions block in [`recv_with_deadline`]
//! and nowhere else.

use crate::netio::config::NetIoConfig;
use socket2::{Domain, Protocol, Socket as Socket2, Type};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::time::Duration;

/// Create the server's listening socket.
pub fn create_udp_socket(bind_addr: SocketAddr, config: &NetIoConfig) -> io::Result<UdpSocket> {
    let socket = new_socket(bind_addr, config)?;

    if config.reuse_address {
        socket.set_reuse_address(true)?;
    }

    // For IPv6, accept v4-mapped traffic only on the unspecified address
    if let SocketAddr::V6(addr) = bind_addr {
        socket.set_only_v6(!addr.ip().is_unspecified())?;
    }

    socket.bind(&bind_addr.into())?;
    Ok(socket.into())
}

/// Create a client socket on an ephemeral port of `remote`'s family and
/// connect it, so only datagrams from the server are delivered.
pub fn create_client_socket(remote: SocketAddr, config: &NetIoConfig) -> io::Result<UdpSocket> {
    let local: SocketAddr = match remote {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = new_socket(local, config)?;
    socket.bind(&local.into())?;
    socket.connect(&remote.into())?;
    Ok(socket.into())
}

fn new_socket(addr: SocketAddr, config: &NetIoConfig) -> io::Result<Socket2> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket2::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

    if let Some(size) = config.socket_recv_buffer_size {
        if let Err(e) = socket.set_recv_buffer_size(size) {
            tracing::warn!(size, error = %e, "Failed to set SO_RCVBUF");
        }
    }
    if let Some(size) = config.socket_send_buffer_size {
        if let Err(e) = socket.set_send_buffer_size(size) {
            tracing::warn!(size, error = %e, "Failed to set SO_SNDBUF");
        }
    }
    Ok(socket)
}

/// Receive one datagram, waiting at most `wait` (forever when `None`).
///
/// Returns `Ok(None)` when the wait elapsed. A zero `wait` is not
/// representable as a socket timeout and must be clamped by the caller.
pub fn recv_with_deadline(
    socket: &UdpSocket,
    buf: &mut [u8],
    wait: Option<Duration>,
) -> io::Result<Option<(usize, SocketAddr)>> {
    socket.set_read_timeout(wait)?;
    match socket.recv_from(buf) {
        Ok(received) => Ok(Some(received)),
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => Ok(None),
        Err(e) => Err(e),
    }
}
