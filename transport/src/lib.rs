//! TCP and multicast message transport for the peerlink overlay.
//!
//! The crate moves opaque [`Message`]s between peers:
//!
//! - [`acceptor`]: the listening socket with preferred-port and range
//!   fallback, and its accept thread.
//! - [`reactor`]: one shared `mio` poll for read readiness of every
//!   connection, fed through deferred registration queues.
//! - [`write_pool`]: a fixed pool of write multiplexers for blocking sends.
//! - [`multicast`] and [`frame`]: the multicast channel and its wire format.
//! - [`worker_pool`]: the bounded, elastic thread pool behind multicast and
//!   the executor interface used for connection work.
//! - [`transport`]: the lifecycle that ties them together.
//!
//! Reading and writing application messages on a connection is left to a
//! [`Messenger`] supplied by the embedding node.

pub mod acceptor;
pub mod address;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod frame;
pub mod message;
pub mod multicast;
pub mod reactor;
pub mod stats;
pub mod transport;
pub mod worker_pool;
pub mod write_pool;

pub use {
    address::TransportAddress,
    config::{MulticastConfig, TransportConfig},
    connection::{
        ConnectionHandle, ConnectionId, EndpointRouter, Messenger, MessengerFactory,
        TransportInfo,
    },
    context::TransportContext,
    error::{RejectedTask, Result, TransportError},
    message::{Message, MessageElement},
    stats::TransportStatsSnapshot,
    transport::TcpTransport,
    worker_pool::{TaskExecutor, WorkerPool, WorkerPoolConfig},
};
