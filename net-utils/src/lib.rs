//! Socket plumbing shared by the peerlink transports.
//!
//! Everything here is synchronous and allocation-light: it creates and
//! configures sockets and hands them back as `std::net` types. Callers decide
//! whether to convert them into non-blocking `mio` sources.

pub mod interfaces;
pub mod multicast;

use {
    log::*,
    nix::errno::Errno,
    socket2::{Domain, Protocol, SockAddr, Socket, Type},
    std::{
        io,
        net::{IpAddr, SocketAddr, TcpListener},
    },
};

pub use {
    interfaces::local_interface_addresses,
    multicast::{bind_multicast_socket, leave_multicast_group, MulticastSocketConfig},
};

/// Pending-connection backlog passed to `listen(2)`.
pub const LISTEN_BACKLOG: i32 = 128;

/// An inclusive range of TCP/UDP ports, `(start, end)`.
pub type PortRange = (u16, u16);

/// Returns `true` when `range` is non-empty and does not contain port 0.
pub fn is_valid_port_range(range: PortRange) -> bool {
    range.0 != 0 && range.0 <= range.1
}

/// Bind a TCP listener on exactly `ip:port`.
///
/// A `port` of 0 lets the OS choose an ephemeral port. The listener is left
/// in blocking mode.
pub fn bind_tcp_listener(ip: IpAddr, port: u16) -> io::Result<TcpListener> {
    let addr = SocketAddr::new(ip, port);
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    // Lets a restarted node rebind its advertised port while old connections
    // linger in TIME_WAIT. Linux still refuses to share a port with a live
    // listener.
    socket.set_reuse_address(true)?;
    socket.bind(&SockAddr::from(addr))?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket.into())
}

/// Bind a TCP listener on the first free port of `range` (inclusive).
///
/// Returns the chosen port together with the listener.
pub fn bind_tcp_listener_in_range(ip: IpAddr, range: PortRange) -> io::Result<(u16, TcpListener)> {
    let (start, end) = range;
    if !is_valid_port_range(range) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid port range {start}..={end}"),
        ));
    }

    let mut last_error = None;
    for port in start..=end {
        match bind_tcp_listener(ip, port) {
            Ok(listener) => {
                debug!("bound tcp listener on {ip}:{port}");
                return Ok((port, listener));
            }
            Err(err) => {
                trace!("port {port} unavailable: {err}");
                last_error = Some(err);
            }
        }
    }

    let reason = last_error
        .map(|err| err.to_string())
        .unwrap_or_else(|| "no ports tried".to_string());
    Err(io::Error::new(
        io::ErrorKind::AddrInUse,
        format!("no free port in {start}..={end} on {ip}: {reason}"),
    ))
}

/// Whether an `accept(2)` failure leaves the listening socket usable.
///
/// Aborted handshakes, signal interruptions and descriptor/buffer exhaustion
/// are per-attempt failures; anything else means the listener itself broke.
pub fn is_transient_accept_error(err: &io::Error) -> bool {
    match err.kind() {
        io::ErrorKind::WouldBlock
        | io::ErrorKind::Interrupted
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset => return true,
        _ => {}
    }
    err.raw_os_error().is_some_and(|code| {
        [
            Errno::EMFILE,
            Errno::ENFILE,
            Errno::ENOBUFS,
            Errno::ENOMEM,
            Errno::EPROTO,
            Errno::EPERM,
        ]
        .contains(&Errno::from_raw(code))
    })
}
