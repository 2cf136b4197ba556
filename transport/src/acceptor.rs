//! The connection acceptor.
//!
//! Owns the listening socket and one accept thread blocked on its own
//! `mio::Poll`. Every accepted connection becomes a build task on the shared
//! executor; the accept thread itself never touches a messenger.

use {
    crate::{
        connection::MessengerFactory,
        context::TransportContext,
        error::{Result, TransportError},
        worker_pool::TaskExecutor,
    },
    log::*,
    mio::{net::TcpListener, Events, Interest, Poll, Token, Waker},
    parking_lot::{Mutex, RwLock},
    peerlink_net_utils::{
        bind_tcp_listener, bind_tcp_listener_in_range, is_transient_accept_error, PortRange,
    },
    std::{
        io,
        net::{self, IpAddr, SocketAddr},
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread::{self, JoinHandle},
    },
};

const LISTENER_TOKEN: Token = Token(0);
const WAKE_TOKEN: Token = Token(1);

/// Where the listener ended up and what it was asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerBinding {
    pub bound_address: SocketAddr,
    pub preferred_port: u16,
    pub port_range: Option<PortRange>,
}

/// Bind a listener on `interface`.
///
/// A nonzero `preferred_port` is tried first. If that fails the range is
/// searched, or the bind fails when there is no range. A zero preference
/// searches the range, or takes an ephemeral port when there is none.
pub fn bind_listener(
    interface: IpAddr,
    preferred_port: u16,
    port_range: Option<PortRange>,
) -> Result<(ListenerBinding, net::TcpListener)> {
    let bind_error = |source: io::Error| TransportError::Bind {
        interface,
        port: preferred_port,
        range: port_range,
        source,
    };

    let listener = if preferred_port != 0 {
        match bind_tcp_listener(interface, preferred_port) {
            Ok(listener) => listener,
            Err(err) => match port_range {
                Some(range) => {
                    warn!(
                        "cannot bind {}:{} ({}), searching {}..={}",
                        interface, preferred_port, err, range.0, range.1
                    );
                    bind_tcp_listener_in_range(interface, range)
                        .map_err(bind_error)?
                        .1
                }
                None => return Err(bind_error(err)),
            },
        }
    } else {
        match port_range {
            Some(range) => bind_tcp_listener_in_range(interface, range).map_err(bind_error)?.1,
            None => bind_tcp_listener(interface, 0).map_err(bind_error)?,
        }
    };

    let bound_address = listener.local_addr()?;
    Ok((
        ListenerBinding {
            bound_address,
            preferred_port,
            port_range,
        },
        listener,
    ))
}

/// See the module docs.
pub struct ConnectionAcceptor {
    interface: IpAddr,
    binding: ListenerBinding,
    listener: Mutex<Option<net::TcpListener>>,
    local_address: Arc<RwLock<Option<SocketAddr>>>,
    exit: Arc<AtomicBool>,
    waker: Mutex<Option<Arc<Waker>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    executor: Arc<dyn TaskExecutor>,
    factory: Arc<dyn MessengerFactory>,
    context: TransportContext,
}

impl ConnectionAcceptor {
    /// Bind the listening socket. Accepting starts with [`Self::start`].
    pub fn new(
        interface: IpAddr,
        preferred_port: u16,
        port_range: Option<PortRange>,
        executor: Arc<dyn TaskExecutor>,
        factory: Arc<dyn MessengerFactory>,
        context: TransportContext,
    ) -> Result<Self> {
        let (binding, listener) = bind_listener(interface, preferred_port, port_range)?;
        info!("listening on {}", binding.bound_address);
        Ok(Self {
            interface,
            binding,
            listener: Mutex::new(Some(listener)),
            local_address: Arc::new(RwLock::new(Some(binding.bound_address))),
            exit: Arc::new(AtomicBool::new(false)),
            waker: Mutex::new(None),
            thread: Mutex::new(None),
            executor,
            factory,
            context,
        })
    }

    /// The binding made at construction.
    pub fn binding(&self) -> ListenerBinding {
        self.binding
    }

    /// The current listening address, `None` once stopped.
    pub fn local_address(&self) -> Option<SocketAddr> {
        *self.local_address.read()
    }

    pub fn is_running(&self) -> bool {
        self.thread.lock().is_some() && !self.exit.load(Ordering::Relaxed)
    }

    /// Start the accept thread.
    pub fn start(&self) -> Result<()> {
        let mut thread_slot = self.thread.lock();
        if thread_slot.is_some() {
            return Err(TransportError::AlreadyStarted);
        }
        let listener = self
            .listener
            .lock()
            .take()
            .ok_or(TransportError::ListenerClosed)?;

        listener.set_nonblocking(true)?;
        let mut listener = TcpListener::from_std(listener);
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);

        let accept_loop = AcceptLoop {
            poll,
            listener: Some(listener),
            interface: self.interface,
            port_range: self.binding.port_range,
            exit: self.exit.clone(),
            local_address: self.local_address.clone(),
            executor: self.executor.clone(),
            factory: self.factory.clone(),
            context: self.context.clone(),
        };
        let handle = thread::Builder::new()
            .name("plAcceptor".to_string())
            .spawn(move || accept_loop.run())?;
        *self.waker.lock() = Some(waker);
        *thread_slot = Some(handle);
        Ok(())
    }

    /// Interrupt the accept loop and close the listener. Idempotent.
    pub fn stop(&self) {
        self.exit.store(true, Ordering::Relaxed);
        // The waker must outlive the join: closing its fd drops a pending wake.
        let waker = self.waker.lock().clone();
        if let Some(waker) = &waker {
            if let Err(err) = waker.wake() {
                debug!("failed to wake acceptor: {}", err);
            }
        }
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                error!("acceptor thread panicked");
            }
        }
        drop(waker);
        self.waker.lock().take();
        // Never started.
        drop(self.listener.lock().take());
        *self.local_address.write() = None;
    }
}

impl Drop for ConnectionAcceptor {
    fn drop(&mut self) {
        self.stop();
    }
}

struct AcceptLoop {
    poll: Poll,
    /// `None` only between dropping a dead listener and binding its successor.
    listener: Option<TcpListener>,
    interface: IpAddr,
    port_range: Option<PortRange>,
    exit: Arc<AtomicBool>,
    local_address: Arc<RwLock<Option<SocketAddr>>>,
    executor: Arc<dyn TaskExecutor>,
    factory: Arc<dyn MessengerFactory>,
    context: TransportContext,
}

impl AcceptLoop {
    fn run(mut self) {
        let mut events = Events::with_capacity(16);
        while !self.exit.load(Ordering::Relaxed) {
            if let Err(err) = self.poll.poll(&mut events, None) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("acceptor poll failed: {}", err);
                break;
            }
            if self.exit.load(Ordering::Relaxed) {
                break;
            }
            let acceptable = events.iter().any(|e| e.token() == LISTENER_TOKEN);
            if acceptable && !self.accept_pending() {
                break;
            }
        }

        if let Some(listener) = self.listener.as_mut() {
            if let Err(err) = self.poll.registry().deregister(listener) {
                debug!("listener deregister failed: {}", err);
            }
        }
        *self.local_address.write() = None;
        info!("acceptor stopped");
    }

    /// Accept until the backlog is empty. `false` ends the loop.
    fn accept_pending(&mut self) -> bool {
        loop {
            let accepted = match &self.listener {
                Some(listener) => listener.accept(),
                None => return self.rebuild(),
            };
            match accepted {
                Ok((stream, peer)) => self.submit_build(net::TcpStream::from(stream), peer),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return true,
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::Interrupted
                            | io::ErrorKind::ConnectionAborted
                            | io::ErrorKind::ConnectionReset
                    ) =>
                {
                    debug!("accept: {}", err);
                }
                Err(err) if is_transient_accept_error(&err) => {
                    warn!("accept failed: {}", err);
                    return true;
                }
                Err(err) => {
                    if self.exit.load(Ordering::Relaxed) {
                        return false;
                    }
                    warn!("listener failed: {}, rebuilding", err);
                    return self.rebuild();
                }
            }
        }
    }

    fn submit_build(&self, stream: net::TcpStream, peer: SocketAddr) {
        let factory = self.factory.clone();
        let context = self.context.clone();
        let task = Box::new(move || {
            context.stats().connections_accepted.inc();
            if let Err(err) = context.attach(stream, peer, factory.as_ref()) {
                warn!("failed to set up connection from {}: {}", peer, err);
            }
        });
        if let Err(err) = self.executor.execute(task) {
            // The rejected task owned the stream; dropping it closed the socket.
            warn!("dropping connection from {}: {}", peer, err);
        }
    }

    /// Replace the listener, on the same port when it can be had again.
    fn rebuild(&mut self) -> bool {
        if let Some(mut dead) = self.listener.take() {
            if let Err(err) = self.poll.registry().deregister(&mut dead) {
                debug!("dead listener deregister failed: {}", err);
            }
        }
        let preferred_port = self
            .local_address
            .read()
            .map(|addr| addr.port())
            .unwrap_or_default();

        let rebuilt = bind_listener(self.interface, preferred_port, self.port_range).and_then(
            |(binding, listener)| {
                listener.set_nonblocking(true)?;
                let mut listener = TcpListener::from_std(listener);
                self.poll
                    .registry()
                    .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
                Ok((binding, listener))
            },
        );
        match rebuilt {
            Ok((binding, listener)) => {
                info!("listener rebuilt on {}", binding.bound_address);
                self.listener = Some(listener);
                *self.local_address.write() = Some(binding.bound_address);
                true
            }
            Err(err) => {
                error!("failed to rebuild listener: {}", err);
                false
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            connection::{ConnectionHandle, Messenger},
            reactor::ReadMultiplexer,
            stats::TransportStats,
            worker_pool::{WorkerPool, WorkerPoolConfig},
            write_pool::new_write_pool,
        },
        assert_matches::assert_matches,
        crossbeam_channel::{bounded, Sender},
        std::{
            io::Read,
            net::Ipv4Addr,
            time::{Duration, Instant},
        },
    };

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    struct RefusingFactory;

    impl MessengerFactory for RefusingFactory {
        fn new_messenger(
            &self,
            _connection: ConnectionHandle,
            _context: &TransportContext,
        ) -> Result<Arc<dyn Messenger>> {
            Err(TransportError::InvalidConfig("no messengers here".to_string()))
        }
    }

    fn context(executor: &Arc<dyn TaskExecutor>) -> (ReadMultiplexer, TransportContext) {
        let reactor = ReadMultiplexer::new(executor.clone()).unwrap();
        let context = TransportContext::new(
            reactor.handle(),
            new_write_pool(1).unwrap(),
            Arc::new(TransportStats::new()),
            Duration::from_millis(100),
        );
        (reactor, context)
    }

    fn acceptor_with(executor: Arc<dyn TaskExecutor>) -> (ReadMultiplexer, ConnectionAcceptor) {
        let (reactor, context) = context(&executor);
        let acceptor = ConnectionAcceptor::new(
            LOCALHOST,
            0,
            None,
            executor,
            Arc::new(RefusingFactory),
            context,
        )
        .unwrap();
        (reactor, acceptor)
    }

    fn acceptor() -> (ReadMultiplexer, ConnectionAcceptor) {
        acceptor_with(Arc::new(WorkerPool::new(WorkerPoolConfig::fixed("plTestAcc", 1, 8))))
    }

    /// A one-worker pool with no queue, its only worker parked until the
    /// returned sender is dropped or signalled.
    fn saturated_executor() -> (Arc<WorkerPool>, Sender<()>) {
        let pool = Arc::new(WorkerPool::new(WorkerPoolConfig::fixed("plTestSat", 1, 0)));
        let (release, gate) = bounded::<()>(1);
        pool.execute(Box::new(move || {
            let _ = gate.recv();
        }))
        .unwrap();
        (pool, release)
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(5) {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_start_stop_contract() {
        let (_reactor, acceptor) = acceptor();
        let addr = acceptor.local_address().unwrap();
        acceptor.start().unwrap();
        assert_matches!(acceptor.start(), Err(TransportError::AlreadyStarted));

        // Accepted and counted even though no messenger is built.
        let _client = net::TcpStream::connect(addr).unwrap();
        assert!(wait_for(|| acceptor.context.stats().connections_accepted.get() == 1));
        assert_eq!(acceptor.context.live_connections(), 0);

        acceptor.stop();
        acceptor.stop();
        assert_eq!(acceptor.local_address(), None);
        assert!(!acceptor.is_running());
    }

    #[test]
    fn test_stop_after_accept_never_hangs() {
        for _ in 0..20 {
            let (_reactor, acceptor) = acceptor();
            let addr = acceptor.local_address().unwrap();
            acceptor.start().unwrap();
            let _client = net::TcpStream::connect(addr).unwrap();
            assert!(wait_for(|| acceptor.context.stats().connections_accepted.get() == 1));
            acceptor.stop();
            assert!(!acceptor.is_running());
        }
    }

    #[test]
    fn test_rejected_build_drops_connection() {
        let (pool, release) = saturated_executor();
        let (_reactor, acceptor) = acceptor_with(pool.clone());
        let addr = acceptor.local_address().unwrap();
        acceptor.start().unwrap();

        let mut client = net::TcpStream::connect(addr).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = [0u8; 8];
        match client.read(&mut buf) {
            Ok(n) => assert_eq!(n, 0),
            Err(err) => assert_eq!(err.kind(), io::ErrorKind::ConnectionReset),
        }
        assert_eq!(acceptor.context.stats().connections_accepted.get(), 0);
        assert!(acceptor.is_running());

        release.send(()).unwrap();
        acceptor.stop();
        pool.shutdown_and_join();
    }

    #[test]
    fn test_rebuild_rebinds_same_port() {
        let executor: Arc<dyn TaskExecutor> =
            Arc::new(WorkerPool::new(WorkerPoolConfig::fixed("plTestReb", 1, 8)));
        let (_reactor, context) = context(&executor);
        let (binding, listener) = bind_listener(LOCALHOST, 0, None).unwrap();
        listener.set_nonblocking(true).unwrap();
        let mut listener = TcpListener::from_std(listener);
        let poll = Poll::new().unwrap();
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .unwrap();

        let mut accept_loop = AcceptLoop {
            poll,
            listener: Some(listener),
            interface: LOCALHOST,
            port_range: None,
            exit: Arc::new(AtomicBool::new(false)),
            local_address: Arc::new(RwLock::new(Some(binding.bound_address))),
            executor,
            factory: Arc::new(RefusingFactory),
            context: context.clone(),
        };
        assert!(accept_loop.rebuild());
        assert_eq!(*accept_loop.local_address.read(), Some(binding.bound_address));

        // The successor is registered and accepting.
        let _client = net::TcpStream::connect(binding.bound_address).unwrap();
        assert!(wait_for(|| {
            accept_loop.accept_pending();
            context.stats().connections_accepted.get() == 1
        }));
    }

    #[test]
    fn test_start_after_stop_reports_closed_listener() {
        let (_reactor, acceptor) = acceptor();
        acceptor.stop();
        assert_matches!(acceptor.start(), Err(TransportError::ListenerClosed));
    }

    #[test]
    fn test_bind_ephemeral() {
        let (binding, listener) = bind_listener(LOCALHOST, 0, None).unwrap();
        assert_ne!(binding.bound_address.port(), 0);
        assert_eq!(listener.local_addr().unwrap(), binding.bound_address);
    }

    #[test]
    fn test_bind_preferred_port_taken_without_range() {
        let (taken, _listener) = bind_listener(LOCALHOST, 0, None).unwrap();
        let port = taken.bound_address.port();
        assert_matches!(
            bind_listener(LOCALHOST, port, None),
            Err(TransportError::Bind { port: p, range: None, .. }) if p == port
        );
    }

    #[test]
    fn test_bind_exact_preferred_port() {
        let port = {
            let (binding, _listener) = bind_listener(LOCALHOST, 0, None).unwrap();
            binding.bound_address.port()
        };
        let (binding, _listener) = bind_listener(LOCALHOST, port, None).unwrap();
        assert_eq!(binding.bound_address.port(), port);
        assert_eq!(binding.preferred_port, port);
    }
}
