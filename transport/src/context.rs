//! What a [`Messenger`](crate::connection::Messenger) gets to talk back to
//! the transport: read-interest registration, the blocking write path,
//! counters and the live-connection map.

use {
    crate::{
        connection::{ConnectionHandle, ConnectionId, Messenger, MessengerFactory},
        error::{Result, TransportError},
        reactor::{LiveConnections, ReactorHandle},
        stats::TransportStats,
        write_pool::WriteResourcePool,
    },
    log::*,
    mio::{unix::SourceFd, Events, Interest, Token},
    std::{
        io::{self, Write},
        net::{SocketAddr, TcpStream},
        os::fd::AsRawFd,
        sync::{
            atomic::{AtomicU64, Ordering},
            Arc,
        },
        time::Duration,
    },
};

const WRITE_TOKEN: Token = Token(0);

struct ContextInner {
    reactor: ReactorHandle,
    write_pool: WriteResourcePool,
    stats: Arc<TransportStats>,
    next_connection_id: AtomicU64,
    connection_timeout: Duration,
}

/// Shared, cheap-to-clone transport services.
#[derive(Clone)]
pub struct TransportContext {
    inner: Arc<ContextInner>,
}

impl TransportContext {
    pub fn new(
        reactor: ReactorHandle,
        write_pool: WriteResourcePool,
        stats: Arc<TransportStats>,
        connection_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                reactor,
                write_pool,
                stats,
                next_connection_id: AtomicU64::new(1),
                connection_timeout,
            }),
        }
    }

    /// Wrap a freshly accepted or connected stream.
    pub(crate) fn new_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> io::Result<ConnectionHandle> {
        let id = ConnectionId(self.inner.next_connection_id.fetch_add(1, Ordering::Relaxed));
        ConnectionHandle::new(id, stream, peer)
    }

    /// Wrap `stream`, build its messenger and arm it for reads.
    pub(crate) fn attach(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        factory: &dyn MessengerFactory,
    ) -> Result<Arc<dyn Messenger>> {
        let connection = self.new_connection(stream, peer)?;
        let messenger = factory.new_messenger(connection.clone(), self)?;
        if !self.register_for_read(&connection, messenger.clone()) {
            messenger.close();
            return Err(TransportError::Stopped);
        }
        debug!("{} attached to {}", connection.id(), peer);
        Ok(messenger)
    }

    /// Ask the reactor for the next read-readiness event on `connection`.
    ///
    /// Returns `false` when the reactor is stopped.
    pub fn register_for_read(
        &self,
        connection: &ConnectionHandle,
        messenger: Arc<dyn Messenger>,
    ) -> bool {
        self.connections()
            .entry(connection.id())
            .or_insert_with(|| connection.clone());
        let registered = self.inner.reactor.register_for_read(connection, messenger);
        if !registered {
            self.connections().remove(&connection.id());
        }
        registered
    }

    /// Forget `connection`: no more read events, dropped from the live map.
    pub fn unregister(&self, connection: &ConnectionHandle) {
        self.connections().remove(&connection.id());
        self.inner.reactor.unregister(connection);
    }

    pub fn connection(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.connections().get(&id).map(|c| c.value().clone())
    }

    fn connections(&self) -> &LiveConnections {
        self.inner.reactor.live_connections()
    }

    pub fn live_connections(&self) -> usize {
        self.connections().len()
    }

    pub fn stats(&self) -> &TransportStats {
        &self.inner.stats
    }

    pub fn connection_timeout(&self) -> Duration {
        self.inner.connection_timeout
    }

    /// Write all of `bytes` to `connection`, blocking the caller.
    ///
    /// A write multiplexer is borrowed from the pool for the duration and
    /// returned on every path. Each stall may last at most the connection
    /// timeout.
    pub fn write_blocking(&self, connection: &ConnectionHandle, bytes: &[u8]) -> Result<()> {
        let timeout = self.inner.connection_timeout;
        let mut poll = self
            .inner
            .write_pool
            .acquire(timeout)
            .ok_or(TransportError::WritePoolExhausted)?;

        let fd = connection.as_raw_fd();
        let registered = poll
            .registry()
            .register(&mut SourceFd(&fd), WRITE_TOKEN, Interest::WRITABLE);
        let result = match registered {
            Ok(()) => {
                let result = write_all(&mut poll, connection, bytes, timeout);
                if let Err(err) = poll.registry().deregister(&mut SourceFd(&fd)) {
                    trace!("write deregister of {} failed: {}", connection.id(), err);
                }
                result
            }
            Err(err) => Err(err.into()),
        };
        self.inner.write_pool.release(poll);

        match &result {
            Ok(()) => self.inner.stats.record_sent(bytes.len()),
            Err(err) => debug!("write to {} failed: {}", connection.id(), err),
        }
        result
    }
}

fn write_all(
    poll: &mut mio::Poll,
    connection: &ConnectionHandle,
    mut bytes: &[u8],
    timeout: Duration,
) -> Result<()> {
    let mut events = Events::with_capacity(4);
    let mut stream = connection.stream();
    while !bytes.is_empty() {
        match stream.write(bytes) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
            Ok(n) => bytes = &bytes[n..],
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                match poll.poll(&mut events, Some(timeout)) {
                    Ok(()) if events.is_empty() => return Err(TransportError::Timeout(timeout)),
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                    Err(err) => return Err(err.into()),
                }
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            reactor::ReadMultiplexer,
            worker_pool::{WorkerPool, WorkerPoolConfig},
            write_pool::new_write_pool,
        },
        assert_matches::assert_matches,
        std::{io::Read, net::TcpListener, thread},
    };

    fn context(pool_capacity: usize, timeout: Duration) -> (ReadMultiplexer, TransportContext) {
        let executor = Arc::new(WorkerPool::new(WorkerPoolConfig::fixed("plTestCtx", 2, 16)));
        let reactor = ReadMultiplexer::new(executor).unwrap();
        let context = TransportContext::new(
            reactor.handle(),
            new_write_pool(pool_capacity).unwrap(),
            Arc::new(TransportStats::new()),
            timeout,
        );
        (reactor, context)
    }

    fn pair(context: &TransportContext) -> (TcpStream, ConnectionHandle) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        (client, context.new_connection(server, peer).unwrap())
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let (_reactor, context) = context(1, Duration::from_millis(100));
        let (_c1, a) = pair(&context);
        let (_c2, b) = pair(&context);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_write_blocking_large_payload() {
        let (_reactor, context) = context(2, Duration::from_secs(5));
        let (mut client, connection) = pair(&context);

        let payload: Vec<u8> = (0..4 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
        let expected = payload.len();
        let reader = thread::spawn(move || {
            let mut got = Vec::with_capacity(expected);
            client.read_to_end(&mut got).unwrap();
            got
        });

        context.write_blocking(&connection, &payload).unwrap();
        connection.shutdown();
        assert_eq!(reader.join().unwrap(), payload);

        let stats = context.stats().snapshot();
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.bytes_sent, expected as u64);
    }

    #[test]
    fn test_write_blocking_times_out_on_stalled_peer() {
        let (_reactor, context) = context(1, Duration::from_millis(100));
        let (_client, connection) = pair(&context);

        // The peer never reads, so the socket buffers eventually fill.
        let payload = vec![0u8; 64 * 1024 * 1024];
        assert_matches!(
            context.write_blocking(&connection, &payload),
            Err(TransportError::Timeout(_))
        );
        assert_eq!(context.stats().snapshot().messages_sent, 0);
    }

    #[test]
    fn test_write_pool_is_returned_after_failure() {
        let (_reactor, context) = context(1, Duration::from_millis(50));
        let (_client, connection) = pair(&context);
        let _ = context.write_blocking(&connection, &vec![0u8; 64 * 1024 * 1024]);
        // The single multiplexer is available again.
        let (mut client, other) = pair(&context);
        context.write_blocking(&other, b"ok").unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ok");
    }
}
