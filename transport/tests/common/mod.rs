//! Shared fixtures for the transport integration tests.

#![allow(dead_code)]

use {
    parking_lot::Mutex,
    peerlink_transport::{
        ConnectionHandle, EndpointRouter, Message, Messenger, MessengerFactory, TcpTransport,
        TransportConfig, TransportContext, TransportInfo, WorkerPool, WorkerPoolConfig,
    },
    std::{
        io::{self, Read},
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc,
        },
        thread,
        time::{Duration, Instant},
    },
};

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

/// Records every call made by the transport.
pub struct RecordingRouter {
    pub accept: bool,
    pub added: Mutex<Vec<TransportInfo>>,
    pub removed: Mutex<Vec<TransportInfo>>,
    pub demuxed: Mutex<Vec<Message>>,
}

impl RecordingRouter {
    pub fn new(accept: bool) -> Arc<Self> {
        Arc::new(Self {
            accept,
            added: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            demuxed: Mutex::new(Vec::new()),
        })
    }
}

impl EndpointRouter for RecordingRouter {
    fn demux(&self, message: Message) {
        self.demuxed.lock().push(message);
    }

    fn add_transport(&self, info: &TransportInfo) -> bool {
        self.added.lock().push(info.clone());
        self.accept
    }

    fn remove_transport(&self, info: &TransportInfo) {
        self.removed.lock().push(info.clone());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Echo messenger
// ─────────────────────────────────────────────────────────────────────────────

/// Writes every byte it reads straight back through the blocking write path.
pub struct EchoMessenger {
    connection: ConnectionHandle,
    context: TransportContext,
    pub received: AtomicUsize,
    pub closed: AtomicBool,
}

impl Messenger for EchoMessenger {
    fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    fn process_readable(self: Arc<Self>) {
        let mut buf = [0u8; 4096];
        loop {
            match self.connection.stream().read(&mut buf) {
                Ok(0) => {
                    self.context.unregister(&self.connection);
                    self.close();
                    return;
                }
                Ok(n) => {
                    self.received.fetch_add(n, Ordering::SeqCst);
                    if self.context.write_blocking(&self.connection, &buf[..n]).is_err() {
                        self.context.unregister(&self.connection);
                        self.close();
                        return;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => {
                    self.context.unregister(&self.connection);
                    self.close();
                    return;
                }
            }
        }
        let context = self.context.clone();
        let connection = self.connection.clone();
        context.register_for_read(&connection, self);
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.connection.shutdown();
        }
    }
}

#[derive(Default)]
pub struct EchoFactory {
    pub built: Mutex<Vec<Arc<EchoMessenger>>>,
}

impl MessengerFactory for EchoFactory {
    fn new_messenger(
        &self,
        connection: ConnectionHandle,
        context: &TransportContext,
    ) -> peerlink_transport::Result<Arc<dyn Messenger>> {
        let messenger = Arc::new(EchoMessenger {
            connection,
            context: context.clone(),
            received: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });
        self.built.lock().push(messenger.clone());
        Ok(messenger)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

pub fn executor() -> Arc<WorkerPool> {
    Arc::new(WorkerPool::new(WorkerPoolConfig::fixed("plTestExec", 4, 256)))
}

pub struct Fixture {
    pub transport: TcpTransport,
    pub router: Arc<RecordingRouter>,
    pub factory: Arc<EchoFactory>,
    pub executor: Arc<WorkerPool>,
}

pub fn fixture(config: TransportConfig) -> Fixture {
    peerlink_logger::setup_for_tests(log::LevelFilter::Debug);
    let router = RecordingRouter::new(true);
    let factory = Arc::new(EchoFactory::default());
    let executor = executor();
    let transport =
        TcpTransport::new(config, executor.clone(), factory.clone(), router.clone()).unwrap();
    Fixture {
        transport,
        router,
        factory,
        executor,
    }
}

pub fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(5) {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}
