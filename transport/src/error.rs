//! Error types for the transport layer.

use {
    peerlink_net_utils::PortRange,
    std::{io, net::IpAddr, time::Duration},
    thiserror::Error,
};

/// Why a worker pool refused a task.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectedTask {
    /// Every worker is busy and the queue is full.
    #[error("worker pool saturated")]
    Saturated,

    /// The pool has been shut down.
    #[error("worker pool shut down")]
    Shutdown,

    /// The OS refused to start another worker thread.
    #[error("unable to spawn worker thread")]
    Spawn,
}

/// Errors that can occur in the transport layer.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Socket-level I/O error.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),

    /// Failed to serialize or deserialize a message.
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// An encoded multicast frame exceeds the configured datagram size.
    #[error("frame too large: {size} bytes (max {max} bytes)")]
    FrameTooLarge {
        /// Encoded frame size.
        size: usize,
        /// Configured maximum datagram size.
        max: usize,
    },

    /// A multicast frame is malformed.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Neither the preferred port nor the configured range could be bound.
    #[error("unable to bind {interface}:{port} (range {range:?}): {source}")]
    Bind {
        /// Interface the listener was meant to bind.
        interface: IpAddr,
        /// Preferred port, 0 when unset.
        port: u16,
        /// Fallback range, if configured.
        range: Option<PortRange>,
        /// Underlying bind failure.
        #[source]
        source: io::Error,
    },

    /// `start` was called on a component that is already running.
    #[error("already started")]
    AlreadyStarted,

    /// The operation requires a started transport.
    #[error("not started")]
    NotStarted,

    /// The component has been stopped and cannot be restarted.
    #[error("stopped")]
    Stopped,

    /// The listening socket is gone.
    #[error("listener closed")]
    ListenerClosed,

    /// Multicast was requested but is disabled by configuration.
    #[error("multicast disabled")]
    MulticastDisabled,

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// No write multiplexer became available within the bounded wait.
    #[error("write resource pool exhausted")]
    WritePoolExhausted,

    /// A blocking operation did not complete in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// A worker pool refused a task.
    #[error("task rejected: {0}")]
    Rejected(#[from] RejectedTask),

    /// The routing layer declined to register this transport.
    #[error("endpoint router refused transport registration")]
    RouterRefused,

    /// A transport address could not be parsed or resolved.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

/// Convenience result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
