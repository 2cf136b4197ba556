//! Connection handles and the interfaces the transport consumes.
//!
//! The transport owns sockets and read-readiness scheduling only. Reading
//! and writing application messages belongs to a [`Messenger`], built by a
//! [`MessengerFactory`] supplied by the embedding node. Decoded multicast
//! messages and transport registration go to an [`EndpointRouter`].

use {
    crate::{address::TransportAddress, context::TransportContext, error::Result, message::Message},
    std::{
        fmt,
        io,
        net::{Shutdown, SocketAddr, TcpStream},
        os::fd::{AsRawFd, RawFd},
        sync::Arc,
    },
};

/// Process-unique identifier of one live TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

struct ConnectionInner {
    id: ConnectionId,
    peer: SocketAddr,
    stream: TcpStream,
}

/// Cheap-to-clone handle naming one live TCP connection.
///
/// The socket is non-blocking. It closes when the last handle is dropped.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<ConnectionInner>,
}

impl ConnectionHandle {
    /// Wrap an already-connected stream, switching it to non-blocking mode.
    pub fn new(id: ConnectionId, stream: TcpStream, peer: SocketAddr) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(Self {
            inner: Arc::new(ConnectionInner { id, peer, stream }),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    /// The underlying socket. `&TcpStream` implements `Read` and `Write`.
    pub fn stream(&self) -> &TcpStream {
        &self.inner.stream
    }

    /// Shut down both directions. Errors on an already-closed socket are
    /// ignored.
    pub fn shutdown(&self) {
        let _ = self.inner.stream.shutdown(Shutdown::Both);
    }
}

impl AsRawFd for ConnectionHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.stream.as_raw_fd()
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .finish()
    }
}

/// Per-connection reader/writer.
pub trait Messenger: Send + Sync {
    /// The connection this messenger serves.
    fn connection(&self) -> &ConnectionHandle;

    /// Drain whatever bytes are readable right now.
    ///
    /// Runs on a worker thread after the reactor saw read readiness and
    /// cleared read interest. Implementations call
    /// [`TransportContext::register_for_read`] again once they have hit
    /// `WouldBlock`, or [`TransportContext::unregister`] on EOF.
    fn process_readable(self: Arc<Self>);

    /// Close the connection. Called by the transport on registration failure
    /// and on shutdown; must be idempotent.
    fn close(&self);
}

/// Builds a [`Messenger`] for an accepted or outbound connection.
///
/// The transport registers the returned messenger for read readiness.
pub trait MessengerFactory: Send + Sync {
    fn new_messenger(
        &self,
        connection: ConnectionHandle,
        context: &TransportContext,
    ) -> Result<Arc<dyn Messenger>>;
}

/// What a started transport tells the routing layer about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportInfo {
    pub protocol: String,
    pub public_address: TransportAddress,
    pub addresses: Vec<TransportAddress>,
}

/// The message-routing layer above the transport.
pub trait EndpointRouter: Send + Sync {
    /// Deliver one decoded inbound message.
    fn demux(&self, message: Message);

    /// Register a started transport. Returning `false` aborts the start.
    fn add_transport(&self, info: &TransportInfo) -> bool;

    /// Forget a stopped transport.
    fn remove_transport(&self, info: &TransportInfo);
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use {
        super::*,
        std::{
            io::{Read, Write},
            net::TcpListener,
        },
    };

    #[test]
    fn test_handle_is_nonblocking_and_shared() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).unwrap();
        let (server, peer) = listener.accept().unwrap();

        let handle = ConnectionHandle::new(ConnectionId(7), server, peer).unwrap();
        let clone = handle.clone();
        assert_eq!(clone.id(), ConnectionId(7));
        assert_eq!(clone.peer_addr(), peer);
        assert_eq!(clone.as_raw_fd(), handle.as_raw_fd());

        let mut buf = [0u8; 8];
        let err = handle.stream().read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        client.write_all(b"hi").unwrap();
        client.flush().unwrap();
        drop(handle);
        // The clone still owns the socket.
        let mut stream = clone.stream();
        let mut got = Vec::new();
        while got.len() < 2 {
            match stream.read(&mut buf) {
                Ok(n) => got.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(5))
                }
                Err(e) => panic!("{e}"),
            }
        }
        assert_eq!(got, b"hi");
    }
}
