//! Configuration for the TCP and multicast transports.
//!
//! Loading is the embedding application's job; these structs derive serde so
//! any loader can populate them, and [`TransportConfig::validate`] is the
//! single place ranges are checked.

use {
    crate::{
        error::{Result, TransportError},
        frame::MIN_FRAME_LEN,
    },
    peerlink_net_utils::{is_valid_port_range, PortRange},
    serde::{Deserialize, Serialize},
    std::{
        net::{IpAddr, Ipv4Addr},
        time::Duration,
    },
};

/// Default TCP port advertised to peers.
pub const DEFAULT_TCP_PORT: u16 = 9701;

/// Default fallback range searched when the preferred port is taken.
pub const DEFAULT_PORT_RANGE: PortRange = (9701, 9799);

/// Default number of write multiplexers kept in the write resource pool.
pub const DEFAULT_WRITE_POOL_CAPACITY: usize = 20;

/// Default multicast group for local discovery traffic.
pub const DEFAULT_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 1, 85);

/// Default multicast port.
pub const DEFAULT_MULTICAST_PORT: u32 = 1234;

/// Default maximum multicast datagram size in bytes.
pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 16_384;

/// Default soft cap on multicast worker threads.
pub const DEFAULT_MULTICAST_MAX_WORKERS: usize = 5;

/// Highest multicast port accepted by [`MulticastConfig::validate`].
pub const MAX_MULTICAST_PORT: u32 = 65_536;

/// Configuration for the TCP transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Interface to listen on. The unspecified address means "every
    /// interface", and addresses are then enumerated from the OS.
    pub interface_address: IpAddr,

    /// Port to try first. 0 means unset.
    pub preferred_port: u16,

    /// Inclusive range searched when the preferred port cannot be bound.
    pub port_range: Option<PortRange>,

    /// Host name advertised as the public address instead of an interface
    /// address.
    pub server_name: Option<String>,

    /// Advertise only the public address, not every interface address.
    pub public_address_only: bool,

    /// Whether to accept inbound connections at all.
    pub inbound_enabled: bool,

    /// Connect timeout, and the per-attempt wait of the write pool (ms).
    pub connection_timeout_ms: u64,

    /// Number of write multiplexers created at construction.
    pub write_pool_capacity: usize,

    /// Multicast settings.
    pub multicast: MulticastConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            interface_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            preferred_port: DEFAULT_TCP_PORT,
            port_range: Some(DEFAULT_PORT_RANGE),
            server_name: None,
            public_address_only: false,
            inbound_enabled: true,
            connection_timeout_ms: 15_000,
            write_pool_capacity: DEFAULT_WRITE_POOL_CAPACITY,
            multicast: MulticastConfig::default(),
        }
    }
}

impl TransportConfig {
    /// Loopback listener on an ephemeral port with multicast disabled.
    #[cfg(any(test, feature = "dev-context-only-utils"))]
    pub fn dev_default() -> Self {
        Self {
            interface_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            preferred_port: 0,
            port_range: None,
            server_name: None,
            public_address_only: false,
            inbound_enabled: true,
            connection_timeout_ms: 1_000,
            write_pool_capacity: 4,
            multicast: MulticastConfig {
                enabled: false,
                ..MulticastConfig::default()
            },
        }
    }

    /// Connect / write-pool timeout as a [`Duration`].
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Check every value for consistency.
    pub fn validate(&self) -> Result<()> {
        if let Some(range) = self.port_range {
            if !is_valid_port_range(range) {
                return Err(TransportError::InvalidConfig(format!(
                    "port range {}..={} is empty or contains port 0",
                    range.0, range.1
                )));
            }
        }
        if self.connection_timeout_ms == 0 {
            return Err(TransportError::InvalidConfig(
                "connection timeout must be positive".to_string(),
            ));
        }
        if self.write_pool_capacity == 0 {
            return Err(TransportError::InvalidConfig(
                "write pool capacity must be positive".to_string(),
            ));
        }
        if self.public_address_only && self.server_name.is_none() {
            return Err(TransportError::InvalidConfig(
                "public_address_only requires a server name".to_string(),
            ));
        }
        if self.multicast.enabled {
            self.multicast.validate()?;
        }
        Ok(())
    }
}

/// Configuration for the multicast channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MulticastConfig {
    /// Whether the multicast channel is started.
    pub enabled: bool,

    /// Group address joined for sends and receives.
    pub group: Ipv4Addr,

    /// Group port. Wider than `u16` so out-of-range values from a loader
    /// reach [`MulticastConfig::validate`] instead of failing to parse.
    pub port: u32,

    /// Local interface for membership; unspecified lets the kernel choose.
    pub interface: Ipv4Addr,

    /// Largest datagram sent or received, in bytes.
    pub max_datagram_size: usize,

    /// Soft cap on multicast worker threads. The pool may grow to twice this
    /// under sustained load.
    pub max_workers: usize,

    /// Hop limit for outbound datagrams.
    pub ttl: u32,

    /// Receive timeout used as the shutdown check interval (ms).
    pub receive_timeout_ms: u64,
}

impl Default for MulticastConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            group: DEFAULT_MULTICAST_GROUP,
            port: DEFAULT_MULTICAST_PORT,
            interface: Ipv4Addr::UNSPECIFIED,
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
            max_workers: DEFAULT_MULTICAST_MAX_WORKERS,
            ttl: 1,
            receive_timeout_ms: 500,
        }
    }
}

impl MulticastConfig {
    /// Check the multicast values.
    ///
    /// The port check accepts `1..=65536`; a port of 65536 passes here and is
    /// refused when the socket is bound.
    pub fn validate(&self) -> Result<()> {
        if !self.group.is_multicast() {
            return Err(TransportError::InvalidConfig(format!(
                "{} is not a multicast group",
                self.group
            )));
        }
        if self.port == 0 || self.port > MAX_MULTICAST_PORT {
            return Err(TransportError::InvalidConfig(format!(
                "multicast port {} out of range",
                self.port
            )));
        }
        if self.max_datagram_size < MIN_FRAME_LEN {
            return Err(TransportError::InvalidConfig(format!(
                "max datagram size {} is below the minimum frame size {}",
                self.max_datagram_size, MIN_FRAME_LEN
            )));
        }
        if self.max_workers == 0 {
            return Err(TransportError::InvalidConfig(
                "multicast max_workers must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// The validated group port as a socket port.
    pub fn socket_port(&self) -> Result<u16> {
        u16::try_from(self.port).map_err(|_| {
            TransportError::InvalidConfig(format!("multicast port {} cannot be bound", self.port))
        })
    }

    /// Receive timeout as a [`Duration`].
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
