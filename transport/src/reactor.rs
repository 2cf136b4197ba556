//! The shared read reactor.
//!
//! One `mio::Poll` watches every live connection for read readiness. Only the
//! reactor thread touches it: other threads enqueue registrations and
//! deregistrations through a [`ReactorHandle`] and wake the poller, and the
//! reactor applies them before each poll.
//!
//! A readiness event removes the connection from the poll and hands
//! [`Messenger::process_readable`] to the executor. The messenger asks for
//! read interest again once it has drained the socket, so at most one read
//! task per connection is ever in flight.
//!
//! The reactor also owns the live-connection map. Whenever it closes a
//! messenger it drops the connection from the map, releasing the socket.

use {
    crate::{
        connection::{ConnectionHandle, ConnectionId, Messenger},
        error::{Result, TransportError},
        worker_pool::TaskExecutor,
    },
    crossbeam_channel::{unbounded, Receiver, Sender},
    dashmap::DashMap,
    log::*,
    mio::{unix::SourceFd, Events, Interest, Poll, Token, Waker},
    parking_lot::Mutex,
    std::{
        collections::HashMap,
        io,
        os::fd::AsRawFd,
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc,
        },
        thread::{self, JoinHandle},
    },
};

const WAKE_TOKEN: Token = Token(usize::MAX);
const EVENTS_CAPACITY: usize = 1024;

/// Every connection with a messenger attached, keyed by id.
pub type LiveConnections = Arc<DashMap<ConnectionId, ConnectionHandle>>;

struct PendingRegistration {
    connection: ConnectionHandle,
    messenger: Arc<dyn Messenger>,
}

/// Thread-safe front door to the reactor.
#[derive(Clone)]
pub struct ReactorHandle {
    registrations: Sender<PendingRegistration>,
    deregistrations: Sender<ConnectionId>,
    waker: Arc<Waker>,
    exit: Arc<AtomicBool>,
    live: LiveConnections,
}

impl ReactorHandle {
    /// Ask for read readiness on `connection`, delivered to `messenger`.
    ///
    /// Returns `false` once the reactor is stopped.
    pub fn register_for_read(
        &self,
        connection: &ConnectionHandle,
        messenger: Arc<dyn Messenger>,
    ) -> bool {
        if self.exit.load(Ordering::Relaxed) {
            debug!("reactor stopped, ignoring registration of {}", connection.id());
            return false;
        }
        let pending = PendingRegistration {
            connection: connection.clone(),
            messenger,
        };
        if self.registrations.send(pending).is_err() {
            debug!("reactor gone, ignoring registration of {}", connection.id());
            return false;
        }
        self.wake();
        true
    }

    /// Stop watching `connection`. Unknown connections are ignored.
    pub fn unregister(&self, connection: &ConnectionHandle) {
        if self.deregistrations.send(connection.id()).is_ok() {
            self.wake();
        }
    }

    pub(crate) fn live_connections(&self) -> &LiveConnections {
        &self.live
    }

    fn wake(&self) {
        if let Err(err) = self.waker.wake() {
            warn!("failed to wake reactor: {}", err);
        }
    }
}

struct Registered {
    connection: ConnectionHandle,
    messenger: Arc<dyn Messenger>,
    armed: bool,
}

struct ReactorLoop {
    poll: Poll,
    registrations: Receiver<PendingRegistration>,
    deregistrations: Receiver<ConnectionId>,
    entries: HashMap<ConnectionId, Registered>,
    executor: Arc<dyn TaskExecutor>,
    exit: Arc<AtomicBool>,
    registered: Arc<AtomicUsize>,
    live: LiveConnections,
}

impl ReactorLoop {
    fn run(mut self) {
        info!("reactor started");
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        while !self.exit.load(Ordering::Relaxed) {
            self.apply_registrations();
            self.apply_deregistrations();
            self.registered.store(self.entries.len(), Ordering::Relaxed);

            if let Err(err) = self.poll.poll(&mut events, None) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("reactor poll failed: {}", err);
                break;
            }
            if self.exit.load(Ordering::Relaxed) {
                break;
            }

            let ready: Vec<(Token, bool)> = events
                .iter()
                .filter(|event| event.token() != WAKE_TOKEN)
                .map(|event| (event.token(), event.is_error()))
                .collect();
            for (token, is_error) in ready {
                self.dispatch(ConnectionId(token.0 as u64), is_error);
            }
        }

        self.shutdown();
    }

    fn apply_registrations(&mut self) {
        while let Ok(PendingRegistration {
            connection,
            messenger,
        }) = self.registrations.try_recv()
        {
            let id = connection.id();
            let entry = self.entries.entry(id).or_insert_with(|| Registered {
                connection,
                messenger: messenger.clone(),
                armed: false,
            });
            entry.messenger = messenger;
            if entry.armed {
                continue;
            }

            let fd = entry.connection.as_raw_fd();
            let token = Token(id.0 as usize);
            let registry = self.poll.registry();
            let result = match registry.register(&mut SourceFd(&fd), token, Interest::READABLE) {
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    registry.reregister(&mut SourceFd(&fd), token, Interest::READABLE)
                }
                other => other,
            };
            match result {
                Ok(()) => entry.armed = true,
                Err(err) => {
                    warn!("failed to register {} for read: {}", id, err);
                    if let Some(entry) = self.entries.remove(&id) {
                        self.close(entry);
                    }
                }
            }
        }
    }

    fn apply_deregistrations(&mut self) {
        while let Ok(id) = self.deregistrations.try_recv() {
            if let Some(entry) = self.entries.remove(&id) {
                if entry.armed {
                    self.disarm(&entry.connection);
                }
                trace!("{} deregistered", id);
            }
        }
    }

    fn disarm(&self, connection: &ConnectionHandle) {
        let fd = connection.as_raw_fd();
        if let Err(err) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
            trace!("deregister {} failed: {}", connection.id(), err);
        }
    }

    fn dispatch(&mut self, id: ConnectionId, is_error: bool) {
        let Some(entry) = self.entries.get(&id) else {
            return;
        };
        if !entry.armed {
            return;
        }
        self.disarm(&entry.connection);

        if is_error {
            debug!("{} reported a socket error, closing", id);
            if let Some(entry) = self.entries.remove(&id) {
                self.close(entry);
            }
            return;
        }

        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        entry.armed = false;
        let messenger = entry.messenger.clone();
        if let Err(err) = self
            .executor
            .execute(Box::new(move || messenger.process_readable()))
        {
            warn!("read task for {} rejected: {}; read interest left cleared", id, err);
        }
    }

    fn close(&self, entry: Registered) {
        self.live.remove(&entry.connection.id());
        entry.messenger.close();
    }

    fn shutdown(&mut self) {
        let entries: Vec<Registered> = self.entries.drain().map(|(_, entry)| entry).collect();
        for entry in entries {
            if entry.armed {
                self.disarm(&entry.connection);
            }
            self.close(entry);
        }
        // Registrations that raced with stop.
        while let Ok(pending) = self.registrations.try_recv() {
            self.live.remove(&pending.connection.id());
            pending.messenger.close();
        }
        self.registered.store(0, Ordering::Relaxed);
        info!("reactor stopped");
    }
}

/// Owner of the reactor thread.
pub struct ReadMultiplexer {
    handle: ReactorHandle,
    reactor: Mutex<Option<ReactorLoop>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    registered: Arc<AtomicUsize>,
}

impl ReadMultiplexer {
    /// Build the poll and its waker; read tasks go to `executor`.
    pub fn new(executor: Arc<dyn TaskExecutor>) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let (registration_sender, registrations) = unbounded();
        let (deregistration_sender, deregistrations) = unbounded();
        let exit = Arc::new(AtomicBool::new(false));
        let registered = Arc::new(AtomicUsize::new(0));
        let live = LiveConnections::default();

        Ok(Self {
            handle: ReactorHandle {
                registrations: registration_sender,
                deregistrations: deregistration_sender,
                waker,
                exit: exit.clone(),
                live: live.clone(),
            },
            reactor: Mutex::new(Some(ReactorLoop {
                poll,
                registrations,
                deregistrations,
                entries: HashMap::new(),
                executor,
                exit,
                registered: registered.clone(),
                live,
            })),
            thread: Mutex::new(None),
            registered,
        })
    }

    pub fn handle(&self) -> ReactorHandle {
        self.handle.clone()
    }

    /// Spawn the reactor thread. Fails if already started or stopped.
    pub fn start(&self) -> Result<()> {
        let mut thread_slot = self.thread.lock();
        if thread_slot.is_some() {
            return Err(TransportError::AlreadyStarted);
        }
        let reactor = self.reactor.lock().take().ok_or(TransportError::Stopped)?;
        let handle = thread::Builder::new()
            .name("plReactor".to_string())
            .spawn(move || reactor.run())?;
        *thread_slot = Some(handle);
        Ok(())
    }

    /// Stop the reactor and close every registered messenger. Idempotent.
    pub fn stop(&self) {
        self.handle.exit.store(true, Ordering::Relaxed);
        if let Some(mut reactor) = self.reactor.lock().take() {
            // Never started.
            reactor.shutdown();
            return;
        }
        self.handle.wake();
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                error!("reactor thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.lock().is_some() && !self.handle.exit.load(Ordering::Relaxed)
    }

    /// Connections known to the reactor as of its last loop iteration.
    pub fn registered_count(&self) -> usize {
        self.registered.load(Ordering::Relaxed)
    }
}

impl Drop for ReadMultiplexer {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
