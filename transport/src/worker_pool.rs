//! Elastic thread pool with a bounded queue.
//!
//! The pool keeps `core_size` workers alive, queues up to `queue_capacity`
//! tasks, and spawns extra workers up to `max_size` once the queue is full.
//! Extra workers exit after `keep_alive` without work.
//!
//! What happens when all of that is exhausted is the [`SaturationPolicy`]:
//! `Reject` hands the task back as [`RejectedTask::Saturated`], `Grow` blocks
//! the submitter in bounded offers and raises `max_size`, then `core_size`,
//! by one at a time up to `growth_cap`. Growth is never undone.

use {
    crate::error::RejectedTask,
    crossbeam_channel::{bounded, select, Receiver, SendTimeoutError, Sender, TrySendError},
    log::*,
    parking_lot::Mutex,
    std::{
        panic::{self, AssertUnwindSafe},
        sync::{
            atomic::{AtomicBool, AtomicU64, Ordering},
            Arc,
        },
        thread::{self, JoinHandle},
        time::Duration,
    },
};

/// A unit of work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Anything that runs [`Task`]s on other threads.
pub trait TaskExecutor: Send + Sync {
    /// Queue or start `task`. A refusal drops the task.
    fn execute(&self, task: Task) -> Result<(), RejectedTask>;
}

/// What [`WorkerPool::execute`] does once queue and workers are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaturationPolicy {
    /// Refuse the task.
    Reject,
    /// Block the submitter and grow the pool up to `growth_cap` workers.
    Grow {
        growth_cap: usize,
        offer_timeout: Duration,
        offer_attempts: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    /// Thread name prefix. Linux truncates names past 15 bytes.
    pub name: String,
    pub core_size: usize,
    pub max_size: usize,
    pub queue_capacity: usize,
    pub keep_alive: Duration,
    pub policy: SaturationPolicy,
}

impl WorkerPoolConfig {
    /// A rejecting pool of `size` fixed workers.
    pub fn fixed(name: impl Into<String>, size: usize, queue_capacity: usize) -> Self {
        Self {
            name: name.into(),
            core_size: size,
            max_size: size,
            queue_capacity,
            keep_alive: Duration::from_secs(60),
            policy: SaturationPolicy::Reject,
        }
    }
}

#[derive(Debug)]
struct PoolState {
    live: usize,
    peak: usize,
    core_size: usize,
    max_size: usize,
    next_id: usize,
    handles: Vec<JoinHandle<()>>,
}

struct Shared {
    name: String,
    keep_alive: Duration,
    tasks: Receiver<Task>,
    shutdown: Receiver<()>,
    exit: AtomicBool,
    state: Mutex<PoolState>,
    completed: AtomicU64,
}

/// See the module docs.
pub struct WorkerPool {
    shared: Arc<Shared>,
    task_sender: Sender<Task>,
    shutdown_sender: Mutex<Option<Sender<()>>>,
    policy: SaturationPolicy,
}

impl WorkerPool {
    /// Create the pool. Workers start lazily on the first tasks.
    pub fn new(config: WorkerPoolConfig) -> Self {
        let core_size = config.core_size.max(1);
        let max_size = config.max_size.max(core_size);
        let policy = match config.policy {
            SaturationPolicy::Grow {
                growth_cap,
                offer_timeout,
                offer_attempts,
            } => SaturationPolicy::Grow {
                growth_cap: growth_cap.max(max_size),
                offer_timeout,
                offer_attempts: offer_attempts.max(1),
            },
            SaturationPolicy::Reject => SaturationPolicy::Reject,
        };
        let (task_sender, tasks) = bounded(config.queue_capacity);
        let (shutdown_sender, shutdown) = bounded(0);

        Self {
            shared: Arc::new(Shared {
                name: config.name,
                keep_alive: config.keep_alive,
                tasks,
                shutdown,
                exit: AtomicBool::new(false),
                state: Mutex::new(PoolState {
                    live: 0,
                    peak: 0,
                    core_size,
                    max_size,
                    next_id: 0,
                    handles: Vec::new(),
                }),
                completed: AtomicU64::new(0),
            }),
            task_sender,
            shutdown_sender: Mutex::new(Some(shutdown_sender)),
            policy,
        }
    }

    pub fn live_workers(&self) -> usize {
        self.shared.state.lock().live
    }

    /// Highest number of simultaneously live workers so far.
    pub fn peak_workers(&self) -> usize {
        self.shared.state.lock().peak
    }

    pub fn core_size(&self) -> usize {
        self.shared.state.lock().core_size
    }

    pub fn max_size(&self) -> usize {
        self.shared.state.lock().max_size
    }

    pub fn queued(&self) -> usize {
        self.task_sender.len()
    }

    /// Tasks that ran to completion or panicked.
    pub fn completed(&self) -> u64 {
        self.shared.completed.load(Ordering::Relaxed)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.exit.load(Ordering::Relaxed)
    }

    /// Stop accepting work, discard the queue and tell idle workers to exit.
    ///
    /// Tasks already running are not interrupted. Returns the number of
    /// discarded tasks. Idempotent.
    pub fn shutdown_now(&self) -> usize {
        self.shared.exit.store(true, Ordering::Relaxed);
        drop(self.shutdown_sender.lock().take());
        let discarded = self.shared.tasks.try_iter().count();
        if discarded > 0 {
            debug!("{}: discarded {} queued tasks", self.shared.name, discarded);
        }
        discarded
    }

    /// [`WorkerPool::shutdown_now`], then wait for every worker to exit.
    pub fn shutdown_and_join(&self) -> usize {
        let discarded = self.shutdown_now();
        let handles = std::mem::take(&mut self.shared.state.lock().handles);
        for handle in handles {
            if handle.join().is_err() {
                warn!("{}: worker thread panicked", self.shared.name);
            }
        }
        discarded
    }

    fn spawn_worker(&self, state: &mut PoolState, first: Option<Task>) -> Result<(), RejectedTask> {
        state.handles.retain(|h| !h.is_finished());
        let id = state.next_id;
        state.next_id = state.next_id.wrapping_add(1);

        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}{:02}", self.shared.name, id % 100))
            .spawn(move || worker_loop(shared, first));
        match spawned {
            Ok(handle) => {
                state.handles.push(handle);
                state.live = state.live.saturating_add(1);
                state.peak = state.peak.max(state.live);
                Ok(())
            }
            Err(err) => {
                error!("{}: failed to spawn worker: {}", self.shared.name, err);
                Err(RejectedTask::Spawn)
            }
        }
    }

    fn on_saturated(&self, mut task: Task) -> Result<(), RejectedTask> {
        let SaturationPolicy::Grow {
            growth_cap,
            offer_timeout,
            offer_attempts,
        } = self.policy
        else {
            return Err(RejectedTask::Saturated);
        };

        loop {
            for _ in 0..offer_attempts {
                if self.is_shutdown() {
                    return Err(RejectedTask::Shutdown);
                }
                match self.task_sender.send_timeout(task, offer_timeout) {
                    Ok(()) => return Ok(()),
                    Err(SendTimeoutError::Timeout(t)) => task = t,
                    Err(SendTimeoutError::Disconnected(_)) => return Err(RejectedTask::Shutdown),
                }
            }

            let mut state = self.shared.state.lock();
            if state.max_size < growth_cap {
                state.max_size = state.max_size.saturating_add(1);
                debug!("{}: max workers raised to {}", self.shared.name, state.max_size);
                if state.live < state.max_size {
                    return self.spawn_worker(&mut state, Some(task));
                }
            } else if state.core_size < growth_cap {
                state.core_size = state.core_size.saturating_add(1);
                debug!("{}: core workers raised to {}", self.shared.name, state.core_size);
            }
            // At the cap: keep offering until a worker frees a slot.
        }
    }
}

impl TaskExecutor for WorkerPool {
    fn execute(&self, task: Task) -> Result<(), RejectedTask> {
        if self.is_shutdown() {
            return Err(RejectedTask::Shutdown);
        }

        {
            let mut state = self.shared.state.lock();
            if state.live < state.core_size {
                return self.spawn_worker(&mut state, Some(task));
            }
        }

        match self.task_sender.try_send(task) {
            Ok(()) => {
                let mut state = self.shared.state.lock();
                if state.live == 0 {
                    self.spawn_worker(&mut state, None)?;
                }
                Ok(())
            }
            Err(TrySendError::Full(task)) => {
                let mut state = self.shared.state.lock();
                if state.live < state.max_size {
                    return self.spawn_worker(&mut state, Some(task));
                }
                drop(state);
                self.on_saturated(task)
            }
            Err(TrySendError::Disconnected(_)) => Err(RejectedTask::Shutdown),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown_now();
    }
}

fn run_task(shared: &Shared, task: Task) {
    if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
        warn!("{}: task panicked", shared.name);
    }
    shared.completed.fetch_add(1, Ordering::Relaxed);
}

fn worker_loop(shared: Arc<Shared>, first: Option<Task>) {
    if let Some(task) = first {
        run_task(&shared, task);
    }

    loop {
        if shared.exit.load(Ordering::Relaxed) {
            break;
        }
        select! {
            recv(shared.tasks) -> task => match task {
                Ok(task) => {
                    if shared.exit.load(Ordering::Relaxed) {
                        break;
                    }
                    run_task(&shared, task);
                }
                Err(_) => break,
            },
            recv(shared.shutdown) -> _ => break,
            default(shared.keep_alive) => {
                let mut state = shared.state.lock();
                if state.live > state.core_size {
                    state.live = state.live.saturating_sub(1);
                    trace!("{}: idle worker exiting", shared.name);
                    return;
                }
            }
        }
    }

    let mut state = shared.state.lock();
    state.live = state.live.saturating_sub(1);
}

// ── Tests ───────────────────────────────────────────────────────────────────
