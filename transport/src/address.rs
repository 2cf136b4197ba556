//! Transport addresses and the local address computation.

use {
    crate::{
        config::TransportConfig,
        error::{Result, TransportError},
    },
    peerlink_net_utils::local_interface_addresses,
    std::{
        fmt,
        net::{IpAddr, Ipv4Addr, SocketAddr},
        str::FromStr,
    },
};

/// Protocol name used for TCP transport addresses.
pub const TCP_PROTOCOL: &str = "tcp";

/// A `protocol://host:port` address this node can be reached at.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransportAddress {
    pub protocol: String,
    pub host: String,
    pub port: u16,
}

impl TransportAddress {
    pub fn new(protocol: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            protocol: protocol.into(),
            host: host.into(),
            port,
        }
    }

    /// A TCP address for `host:port`.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::new(TCP_PROTOCOL, host, port)
    }

    pub fn from_socket_addr(protocol: impl Into<String>, addr: SocketAddr) -> Self {
        Self::new(protocol, addr.ip().to_string(), addr.port())
    }

    /// The socket address, if the host is a literal IP.
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        self.host
            .parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, self.port))
    }
}

impl fmt::Display for TransportAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", self.protocol, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", self.protocol, self.host, self.port)
        }
    }
}

impl FromStr for TransportAddress {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || TransportError::InvalidAddress(s.to_string());
        let (protocol, rest) = s.split_once("://").ok_or_else(bad)?;
        let (host, port) = rest.rsplit_once(':').ok_or_else(bad)?;
        let host = match host.strip_prefix('[') {
            Some(inner) => inner.strip_suffix(']').ok_or_else(bad)?,
            None if host.contains(':') => return Err(bad()),
            None => host,
        };
        if protocol.is_empty() || host.is_empty() {
            return Err(bad());
        }
        let port = port.parse::<u16>().map_err(|_| bad())?;
        Ok(Self::new(protocol, host, port))
    }
}

/// The addresses a started transport advertises.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAddresses {
    /// The address identifying this node to peers.
    pub public: TransportAddress,
    /// Every equivalent address, `public` included.
    pub all: Vec<TransportAddress>,
}

/// Compute the advertised addresses for a listener bound on `port`.
///
/// `interfaces` is the host's interface address list, used only when the
/// configured interface is the unspecified address. Loopback addresses are
/// advertised only if nothing else is available.
pub fn resolve_addresses(
    config: &TransportConfig,
    port: u16,
    interfaces: &[IpAddr],
) -> ResolvedAddresses {
    let ips: Vec<IpAddr> = if config.interface_address.is_unspecified() {
        let routable: Vec<IpAddr> = interfaces
            .iter()
            .copied()
            .filter(|ip| !ip.is_loopback() && !ip.is_unspecified())
            .collect();
        if !routable.is_empty() {
            routable
        } else {
            let loopback: Vec<IpAddr> = interfaces
                .iter()
                .copied()
                .filter(IpAddr::is_loopback)
                .collect();
            if loopback.is_empty() {
                vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]
            } else {
                loopback
            }
        }
    } else {
        vec![config.interface_address]
    };

    let mut all: Vec<TransportAddress> = Vec::with_capacity(ips.len().saturating_add(1));
    for ip in ips {
        let addr = TransportAddress::tcp(ip.to_string(), port);
        if !all.contains(&addr) {
            all.push(addr);
        }
    }

    match config.server_name.as_deref() {
        Some(name) => {
            let public = TransportAddress::tcp(name, port);
            if config.public_address_only {
                all = vec![public.clone()];
            } else {
                all.retain(|a| a != &public);
                all.insert(0, public.clone());
            }
            ResolvedAddresses { public, all }
        }
        None => {
            // `ips` is never empty, so neither is `all`.
            let public = all
                .first()
                .cloned()
                .unwrap_or_else(|| TransportAddress::tcp(Ipv4Addr::LOCALHOST.to_string(), port));
            ResolvedAddresses { public, all }
        }
    }
}

/// [`resolve_addresses`] against the host's live interfaces.
pub fn resolve_local_addresses(config: &TransportConfig, port: u16) -> Result<ResolvedAddresses> {
    let interfaces = if config.interface_address.is_unspecified() {
        local_interface_addresses()?
    } else {
        Vec::new()
    };
    Ok(resolve_addresses(config, port, &interfaces))
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use {
        super::*,
        assert_matches::assert_matches,
        std::net::Ipv6Addr,
    };

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_display_and_parse() {
        let v4 = TransportAddress::tcp("10.0.0.1", 9701);
        assert_eq!(v4.to_string(), "tcp://10.0.0.1:9701");
        assert_eq!("tcp://10.0.0.1:9701".parse::<TransportAddress>().unwrap(), v4);

        let v6 = TransportAddress::from_socket_addr(
            "tcp",
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 80),
        );
        assert_eq!(v6.to_string(), "tcp://[::1]:80");
        assert_eq!(v6.to_string().parse::<TransportAddress>().unwrap(), v6);
        assert_eq!(v6.to_socket_addr(), Some("[::1]:80".parse().unwrap()));

        let named = TransportAddress::tcp("peer.example.org", 1);
        assert_eq!(named.to_socket_addr(), None);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in ["10.0.0.1:1", "tcp://10.0.0.1", "tcp://::1:80", "tcp://:80", "tcp://h:99999"] {
            assert_matches!(
                bad.parse::<TransportAddress>(),
                Err(TransportError::InvalidAddress(_)),
                "{bad}"
            );
        }
    }

    #[test]
    fn test_unspecified_interface_prefers_routable() {
        let config = TransportConfig::default();
        let resolved = resolve_addresses(
            &config,
            9701,
            &[ip("127.0.0.1"), ip("192.168.1.7"), ip("10.1.1.1"), ip("192.168.1.7")],
        );
        assert_eq!(resolved.public, TransportAddress::tcp("192.168.1.7", 9701));
        assert_eq!(
            resolved.all,
            vec![
                TransportAddress::tcp("192.168.1.7", 9701),
                TransportAddress::tcp("10.1.1.1", 9701),
            ]
        );
    }

    #[test]
    fn test_loopback_only_host() {
        let config = TransportConfig::default();
        let resolved = resolve_addresses(&config, 9701, &[ip("127.0.0.1")]);
        assert_eq!(resolved.all, vec![TransportAddress::tcp("127.0.0.1", 9701)]);

        let resolved = resolve_addresses(&config, 9701, &[]);
        assert_eq!(resolved.public, TransportAddress::tcp("127.0.0.1", 9701));
    }

    #[test]
    fn test_configured_interface_is_used_alone() {
        let config = TransportConfig {
            interface_address: ip("10.1.1.1"),
            ..TransportConfig::default()
        };
        let resolved = resolve_addresses(&config, 9000, &[ip("192.168.1.7")]);
        assert_eq!(resolved.all, vec![TransportAddress::tcp("10.1.1.1", 9000)]);
    }

    #[test]
    fn test_server_name() {
        let mut config = TransportConfig {
            interface_address: ip("10.1.1.1"),
            server_name: Some("node.example.org".to_string()),
            ..TransportConfig::default()
        };
        let resolved = resolve_addresses(&config, 9000, &[]);
        assert_eq!(resolved.public, TransportAddress::tcp("node.example.org", 9000));
        assert_eq!(
            resolved.all,
            vec![
                TransportAddress::tcp("node.example.org", 9000),
                TransportAddress::tcp("10.1.1.1", 9000),
            ]
        );

        config.public_address_only = true;
        let resolved = resolve_addresses(&config, 9000, &[]);
        assert_eq!(resolved.all, vec![resolved.public.clone()]);
    }

    #[test]
    fn test_resolve_local_addresses() {
        let resolved = resolve_local_addresses(&TransportConfig::default(), 9701).unwrap();
        assert!(!resolved.all.is_empty());
        assert!(resolved.all.contains(&resolved.public));
    }
}
