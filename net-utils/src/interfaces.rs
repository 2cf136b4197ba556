//! Local network interface enumeration.

use {
    nix::{ifaddrs::getifaddrs, net::if_::InterfaceFlags},
    std::{
        io,
        net::{IpAddr, Ipv6Addr},
    },
};

fn is_unicast_link_local(addr: &Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xffc0) == 0xfe80
}

/// Every address assigned to an interface that is up.
///
/// IPv6 link-local addresses are skipped because they are meaningless
/// without a scope id. The result is de-duplicated and keeps IPv4 addresses
/// ahead of IPv6 ones, each group in enumeration order.
pub fn local_interface_addresses() -> io::Result<Vec<IpAddr>> {
    let mut v4 = Vec::new();
    let mut v6 = Vec::new();

    for ifaddr in getifaddrs().map_err(io::Error::from)? {
        if !ifaddr.flags.contains(InterfaceFlags::IFF_UP) {
            continue;
        }
        let Some(address) = ifaddr.address else {
            continue;
        };
        if let Some(sin) = address.as_sockaddr_in() {
            let ip = IpAddr::V4(sin.ip());
            if !v4.contains(&ip) {
                v4.push(ip);
            }
        } else if let Some(sin6) = address.as_sockaddr_in6() {
            let ip6 = sin6.ip();
            if is_unicast_link_local(&ip6) {
                continue;
            }
            let ip = IpAddr::V6(ip6);
            if !v6.contains(&ip) {
                v6.push(ip);
            }
        }
    }

    v4.extend(v6);
    Ok(v4)
}
