//! Multicast send and receive.
//!
//! One thread receives datagrams and hands each to an elastic
//! [`WorkerPool`] which decodes it and passes the message to the router.
//! When that pool is saturated the receive thread blocks and the pool grows
//! instead of dropping datagrams.

use {
    crate::{
        config::MulticastConfig,
        connection::EndpointRouter,
        error::{Result, TransportError},
        frame::{decode_message, encode_message, MulticastFrame},
        message::{Message, DEFAULT_CONTENT_TYPE},
        stats::TransportStats,
        worker_pool::{SaturationPolicy, TaskExecutor, WorkerPool, WorkerPoolConfig},
    },
    log::*,
    parking_lot::Mutex,
    peerlink_net_utils::{bind_multicast_socket, leave_multicast_group, MulticastSocketConfig},
    std::{
        io,
        net::{SocketAddr, SocketAddrV4, UdpSocket},
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread::{self, JoinHandle},
        time::Duration,
    },
};

/// Workers kept alive before the pool has to grow.
pub const INITIAL_WORKERS: usize = 2;

/// Wait per blocked offer to a saturated pool.
pub const OFFER_TIMEOUT: Duration = Duration::from_millis(50);

/// Blocked offers made before the pool grows by one worker.
pub const OFFER_ATTEMPTS: usize = 2;

const WORKER_KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Elastic pool for multicast processing sized from `max_workers`.
///
/// Starts at [`INITIAL_WORKERS`], spawns up to `max_workers` when the
/// `2 × max_workers` queue fills, then grows one worker at a time up to
/// `2 × max_workers`.
pub fn multicast_worker_pool(max_workers: usize) -> WorkerPool {
    let max_workers = max_workers.max(1);
    let cap = max_workers.saturating_mul(2);
    WorkerPool::new(WorkerPoolConfig {
        name: "plMcastWork".to_string(),
        core_size: INITIAL_WORKERS.min(max_workers),
        max_size: max_workers,
        queue_capacity: cap,
        keep_alive: WORKER_KEEP_ALIVE,
        policy: SaturationPolicy::Grow {
            growth_cap: cap,
            offer_timeout: OFFER_TIMEOUT,
            offer_attempts: OFFER_ATTEMPTS,
        },
    })
}

/// Decode one datagram and deliver it.
///
/// Short buffers and buffers without the frame magic are dropped without
/// looking further. Returns whether the router got a message.
pub fn process_multicast(router: &dyn EndpointRouter, stats: &TransportStats, datagram: &[u8]) -> bool {
    if !MulticastFrame::has_magic(datagram) {
        trace!("discarding {} byte datagram without frame magic", datagram.len());
        return false;
    }
    match decode_message(datagram) {
        Ok((message, frame)) => {
            trace!(
                "multicast message: {} elements, {}",
                message.len(),
                frame.content_type
            );
            stats.record_received(datagram.len());
            router.demux(message);
            true
        }
        Err(err) => {
            trace!("discarding malformed multicast frame: {}", err);
            false
        }
    }
}

/// Queue `datagram` for processing on `pool`.
pub fn dispatch_datagram(
    pool: &WorkerPool,
    router: &Arc<dyn EndpointRouter>,
    stats: &Arc<TransportStats>,
    datagram: Vec<u8>,
) -> Result<()> {
    let router = router.clone();
    let stats = stats.clone();
    pool.execute(Box::new(move || {
        process_multicast(router.as_ref(), &stats, &datagram);
    }))?;
    Ok(())
}

/// A joined multicast group with its receive thread.
pub struct MulticastChannel {
    config: MulticastConfig,
    socket: Arc<UdpSocket>,
    group_address: SocketAddr,
    router: Arc<dyn EndpointRouter>,
    stats: Arc<TransportStats>,
    pool: Arc<WorkerPool>,
    send_lock: Mutex<()>,
    exit: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl MulticastChannel {
    /// Bind the group port and join the group.
    pub fn bind(
        config: MulticastConfig,
        router: Arc<dyn EndpointRouter>,
        stats: Arc<TransportStats>,
    ) -> Result<Self> {
        config.validate()?;
        let port = config.socket_port()?;
        let socket = bind_multicast_socket(&MulticastSocketConfig {
            group: config.group,
            port,
            interface: config.interface,
            ttl: config.ttl,
            loopback: true,
            read_timeout: Some(config.receive_timeout()),
        })?;
        info!("joined multicast group {}:{}", config.group, port);

        Ok(Self {
            group_address: SocketAddr::V4(SocketAddrV4::new(config.group, port)),
            pool: Arc::new(multicast_worker_pool(config.max_workers)),
            config,
            socket: Arc::new(socket),
            router,
            stats,
            send_lock: Mutex::new(()),
            exit: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        })
    }

    pub fn group_address(&self) -> SocketAddr {
        self.group_address
    }

    /// Start the receive thread.
    pub fn start(&self) -> Result<()> {
        let mut thread_slot = self.thread.lock();
        if thread_slot.is_some() {
            return Err(TransportError::AlreadyStarted);
        }
        if self.exit.load(Ordering::Relaxed) {
            return Err(TransportError::Stopped);
        }

        let socket = self.socket.clone();
        let pool = self.pool.clone();
        let router = self.router.clone();
        let stats = self.stats.clone();
        let exit = self.exit.clone();
        let max_datagram_size = self.config.max_datagram_size;
        let handle = thread::Builder::new()
            .name("plMcastRecv".to_string())
            .spawn(move || {
                receive_loop(&socket, &pool, &router, &stats, &exit, max_datagram_size)
            })?;
        *thread_slot = Some(handle);
        Ok(())
    }

    /// Send `message` to the group with the default content type.
    pub fn send(&self, message: &Message) -> Result<()> {
        self.send_with_content_type(message, DEFAULT_CONTENT_TYPE)
    }

    /// Send `message` to the group as one datagram.
    ///
    /// Frames larger than the configured datagram size are refused. Sends
    /// are serialized with each other.
    pub fn send_with_content_type(&self, message: &Message, content_type: &str) -> Result<()> {
        if self.exit.load(Ordering::Relaxed) {
            return Err(TransportError::Stopped);
        }
        let bytes = encode_message(message, content_type, self.config.max_datagram_size)?;
        let _guard = self.send_lock.lock();
        self.socket.send_to(&bytes, self.group_address)?;
        self.stats.record_sent(bytes.len());
        Ok(())
    }

    /// Stop receiving, discard queued datagrams and leave the group.
    /// Idempotent.
    pub fn stop(&self) {
        if self.exit.swap(true, Ordering::Relaxed) {
            return;
        }
        self.pool.shutdown_now();
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                error!("multicast receive thread panicked");
            }
        }
        if let Err(err) = leave_multicast_group(&self.socket, self.config.group, self.config.interface)
        {
            debug!("leaving multicast group {}: {}", self.config.group, err);
        }
        info!("multicast channel on {} stopped", self.group_address);
    }
}

impl Drop for MulticastChannel {
    fn drop(&mut self) {
        self.stop();
    }
}

fn receive_loop(
    socket: &UdpSocket,
    pool: &WorkerPool,
    router: &Arc<dyn EndpointRouter>,
    stats: &Arc<TransportStats>,
    exit: &AtomicBool,
    max_datagram_size: usize,
) {
    let mut buf = vec![0u8; max_datagram_size];
    while !exit.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buf) {
            Ok((len, from)) => {
                trace!("{} byte datagram from {}", len, from);
                if let Err(err) = dispatch_datagram(pool, router, stats, buf[..len].to_vec()) {
                    if exit.load(Ordering::Relaxed) {
                        break;
                    }
                    warn!("multicast datagram from {} dropped: {}", from, err);
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) => {}
            Err(err) => {
                if exit.load(Ordering::Relaxed) {
                    break;
                }
                warn!("multicast receive failed: {}", err);
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
    debug!("multicast receive thread exiting");
}

// ── Tests ───────────────────────────────────────────────────────────────────
