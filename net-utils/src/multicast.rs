//! IPv4 multicast socket construction.

use {
    socket2::{Domain, Protocol, SockAddr, SockRef, Socket, Type},
    std::{
        io,
        net::{Ipv4Addr, SocketAddr, UdpSocket},
        time::Duration,
    },
};

/// Options for [`bind_multicast_socket`].
#[derive(Debug, Clone)]
pub struct MulticastSocketConfig {
    /// Multicast group to join.
    pub group: Ipv4Addr,
    /// Port shared by every member of the group.
    pub port: u16,
    /// Local interface used for membership and outbound datagrams.
    /// `UNSPECIFIED` lets the kernel pick.
    pub interface: Ipv4Addr,
    /// Hop limit for outbound datagrams.
    pub ttl: u32,
    /// Whether our own datagrams are looped back to local members.
    pub loopback: bool,
    /// Socket read timeout; bounds how long a receive call can block.
    pub read_timeout: Option<Duration>,
}

/// Create a UDP socket bound to `0.0.0.0:port` that is a member of `group`.
///
/// The socket sets `SO_REUSEADDR` so several peers on one host can share the
/// group port.
pub fn bind_multicast_socket(config: &MulticastSocketConfig) -> io::Result<UdpSocket> {
    if !config.group.is_multicast() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is not a multicast group address", config.group),
        ));
    }

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
    socket.bind(&SockAddr::from(bind_addr))?;
    socket.join_multicast_v4(&config.group, &config.interface)?;
    if !config.interface.is_unspecified() {
        socket.set_multicast_if_v4(&config.interface)?;
    }
    socket.set_multicast_loop_v4(config.loopback)?;
    socket.set_multicast_ttl_v4(config.ttl)?;
    socket.set_read_timeout(config.read_timeout)?;
    Ok(socket.into())
}

/// Drop membership of `group` on `socket`.
pub fn leave_multicast_group(
    socket: &UdpSocket,
    group: Ipv4Addr,
    interface: Ipv4Addr,
) -> io::Result<()> {
    SockRef::from(socket).leave_multicast_v4(&group, &interface)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_unicast_group() {
        let config = MulticastSocketConfig {
            group: Ipv4Addr::new(10, 0, 0, 1),
            port: 0,
            interface: Ipv4Addr::UNSPECIFIED,
            ttl: 1,
            loopback: true,
            read_timeout: None,
        };
        let err = bind_multicast_socket(&config).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
