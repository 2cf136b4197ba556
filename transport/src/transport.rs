//! Transport lifecycle.
//!
//! [`TcpTransport`] ties the acceptor, reactor, write pool and multicast
//! channel together, computes the advertised addresses, and registers with
//! the router.

use {
    crate::{
        acceptor::ConnectionAcceptor,
        address::{resolve_local_addresses, TransportAddress, TCP_PROTOCOL},
        config::TransportConfig,
        connection::{EndpointRouter, Messenger, MessengerFactory, TransportInfo},
        context::TransportContext,
        error::{Result, TransportError},
        message::Message,
        multicast::MulticastChannel,
        reactor::ReadMultiplexer,
        stats::{TransportStats, TransportStatsSnapshot},
        worker_pool::TaskExecutor,
        write_pool::new_write_pool,
    },
    log::*,
    parking_lot::Mutex,
    std::{
        net::{SocketAddr, TcpStream, ToSocketAddrs},
        sync::Arc,
    },
};

struct Running {
    acceptor: Option<ConnectionAcceptor>,
    multicast: Option<MulticastChannel>,
    info: TransportInfo,
}

enum Lifecycle {
    Created,
    Started(Running),
    Stopped,
}

/// A TCP transport with an optional multicast channel.
pub struct TcpTransport {
    config: TransportConfig,
    executor: Arc<dyn TaskExecutor>,
    factory: Arc<dyn MessengerFactory>,
    router: Arc<dyn EndpointRouter>,
    stats: Arc<TransportStats>,
    reactor: ReadMultiplexer,
    context: TransportContext,
    state: Mutex<Lifecycle>,
}

impl TcpTransport {
    /// Validate `config` and build the write pool and reactor. Nothing
    /// listens until [`TcpTransport::start`].
    ///
    /// `executor` runs connection builds and read tasks.
    pub fn new(
        config: TransportConfig,
        executor: Arc<dyn TaskExecutor>,
        factory: Arc<dyn MessengerFactory>,
        router: Arc<dyn EndpointRouter>,
    ) -> Result<Self> {
        config.validate()?;
        let stats = Arc::new(TransportStats::new());
        let write_pool = new_write_pool(config.write_pool_capacity)?;
        let reactor = ReadMultiplexer::new(executor.clone())?;
        let context = TransportContext::new(
            reactor.handle(),
            write_pool,
            stats.clone(),
            config.connection_timeout(),
        );

        Ok(Self {
            config,
            executor,
            factory,
            router,
            stats,
            reactor,
            context,
            state: Mutex::new(Lifecycle::Created),
        })
    }

    /// Bind, start every component and register with the router.
    ///
    /// On failure everything already started is stopped again. A failure
    /// after the reactor started leaves the transport stopped for good.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            Lifecycle::Created => {}
            Lifecycle::Started(_) => return Err(TransportError::AlreadyStarted),
            Lifecycle::Stopped => return Err(TransportError::Stopped),
        }

        let acceptor = if self.config.inbound_enabled {
            Some(ConnectionAcceptor::new(
                self.config.interface_address,
                self.config.preferred_port,
                self.config.port_range,
                self.executor.clone(),
                self.factory.clone(),
                self.context.clone(),
            )?)
        } else {
            None
        };
        let port = acceptor
            .as_ref()
            .map(|a| a.binding().bound_address.port())
            .unwrap_or(self.config.preferred_port);
        let addresses = resolve_local_addresses(&self.config, port)?;

        if let Some(acceptor) = &acceptor {
            acceptor.start()?;
        }

        let multicast = if self.config.multicast.enabled {
            let channel = MulticastChannel::bind(
                self.config.multicast.clone(),
                self.router.clone(),
                self.stats.clone(),
            )?;
            channel.start()?;
            Some(channel)
        } else {
            None
        };

        self.reactor.start()?;

        let info = TransportInfo {
            protocol: TCP_PROTOCOL.to_string(),
            public_address: addresses.public,
            addresses: addresses.all,
        };
        if !self.router.add_transport(&info) {
            warn!("router refused transport {}", info.public_address);
            if let Some(multicast) = &multicast {
                multicast.stop();
            }
            if let Some(acceptor) = &acceptor {
                acceptor.stop();
            }
            self.reactor.stop();
            *state = Lifecycle::Stopped;
            return Err(TransportError::RouterRefused);
        }

        info!(
            "transport started, public address {}, {} addresses",
            info.public_address,
            info.addresses.len()
        );
        *state = Lifecycle::Started(Running {
            acceptor,
            multicast,
            info,
        });
        Ok(())
    }

    /// Stop everything and unregister from the router. Idempotent.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, Lifecycle::Stopped) {
            Lifecycle::Started(running) => {
                if let Some(multicast) = &running.multicast {
                    multicast.stop();
                }
                if let Some(acceptor) = &running.acceptor {
                    acceptor.stop();
                }
                self.reactor.stop();
                self.router.remove_transport(&running.info);
                info!("transport {} stopped", running.info.public_address);
            }
            Lifecycle::Created => self.reactor.stop(),
            Lifecycle::Stopped => {}
        }
    }

    pub fn is_started(&self) -> bool {
        matches!(*self.state.lock(), Lifecycle::Started(_))
    }

    /// Open an outbound connection and attach a messenger to it.
    pub fn connect(&self, destination: &TransportAddress) -> Result<Arc<dyn Messenger>> {
        if !self.is_started() {
            return Err(TransportError::NotStarted);
        }
        if destination.protocol != TCP_PROTOCOL {
            return Err(TransportError::InvalidAddress(destination.to_string()));
        }
        let peer = match destination.to_socket_addr() {
            Some(addr) => addr,
            None => (destination.host.as_str(), destination.port)
                .to_socket_addrs()?
                .next()
                .ok_or_else(|| TransportError::InvalidAddress(destination.to_string()))?,
        };

        let timeout = self.config.connection_timeout();
        let stream = TcpStream::connect_timeout(&peer, timeout).map_err(|err| {
            if err.kind() == std::io::ErrorKind::TimedOut {
                TransportError::Timeout(timeout)
            } else {
                TransportError::Io(err)
            }
        })?;
        debug!("connected to {}", peer);
        self.context.attach(stream, peer, self.factory.as_ref())
    }

    /// Send `message` to the multicast group.
    pub fn propagate(&self, message: &Message) -> Result<()> {
        let state = self.state.lock();
        let Lifecycle::Started(running) = &*state else {
            return Err(TransportError::NotStarted);
        };
        running
            .multicast
            .as_ref()
            .ok_or(TransportError::MulticastDisabled)?
            .send(message)
    }

    /// The address advertised to peers while started.
    pub fn public_address(&self) -> Option<TransportAddress> {
        self.info().map(|info| info.public_address)
    }

    /// Every advertised address while started.
    pub fn addresses(&self) -> Vec<TransportAddress> {
        self.info().map(|info| info.addresses).unwrap_or_default()
    }

    /// What was registered with the router.
    pub fn info(&self) -> Option<TransportInfo> {
        match &*self.state.lock() {
            Lifecycle::Started(running) => Some(running.info.clone()),
            _ => None,
        }
    }

    /// The listening address while accepting.
    pub fn local_address(&self) -> Option<SocketAddr> {
        match &*self.state.lock() {
            Lifecycle::Started(running) => running.acceptor.as_ref()?.local_address(),
            _ => None,
        }
    }

    pub fn stats(&self) -> TransportStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn context(&self) -> &TransportContext {
        &self.context
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Connections currently armed in the reactor.
    pub fn registered_connections(&self) -> usize {
        self.reactor.registered_count()
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.stop();
    }
}
