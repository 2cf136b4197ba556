//! Fixed pool of reusable write multiplexers.
//!
//! Synchronous sends borrow a `mio::Poll` from here to wait for
//! writability instead of creating one per write. The pool is filled once at
//! construction and never grows, so its capacity bounds the number of
//! concurrent blocking writes.

use {
    log::*,
    parking_lot::{Condvar, Mutex},
    std::{io, time::Duration},
};

/// Number of timed waits [`ResourcePool::acquire`] makes before giving up.
pub const ACQUIRE_ATTEMPTS: usize = 2;

/// A stack of pre-built resources checked out under a lock.
pub struct ResourcePool<T> {
    items: Mutex<Vec<T>>,
    available: Condvar,
    capacity: usize,
}

impl<T> ResourcePool<T> {
    /// Build a pool from an already-created set of resources.
    pub fn from_items(items: Vec<T>) -> Self {
        let capacity = items.len();
        Self {
            items: Mutex::new(items),
            available: Condvar::new(),
            capacity,
        }
    }

    /// Pool of `capacity` resources produced by `make`.
    pub fn with_capacity<E>(
        capacity: usize,
        mut make: impl FnMut() -> Result<T, E>,
    ) -> Result<Self, E> {
        let items = (0..capacity).map(|_| make()).collect::<Result<Vec<_>, E>>()?;
        Ok(Self::from_items(items))
    }

    /// Take a resource, waiting up to `timeout` at most
    /// [`ACQUIRE_ATTEMPTS`] times. `None` if the pool stayed empty.
    pub fn acquire(&self, timeout: Duration) -> Option<T> {
        let mut items = self.items.lock();
        for _ in 0..ACQUIRE_ATTEMPTS {
            if let Some(item) = items.pop() {
                return Some(item);
            }
            let _ = self.available.wait_for(&mut items, timeout);
        }
        let item = items.pop();
        if item.is_none() {
            debug!("resource pool empty after {} waits of {:?}", ACQUIRE_ATTEMPTS, timeout);
        }
        item
    }

    /// Return a resource and wake one waiter.
    pub fn release(&self, item: T) {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            warn!("resource pool over capacity on release, dropping resource");
            return;
        }
        items.push(item);
        drop(items);
        self.available.notify_one();
    }

    /// Resources currently checked in.
    pub fn available(&self) -> usize {
        self.items.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Pool of write-readiness multiplexers.
pub type WriteResourcePool = ResourcePool<mio::Poll>;

/// Create a [`WriteResourcePool`] with `capacity` fresh `mio::Poll`s.
pub fn new_write_pool(capacity: usize) -> io::Result<WriteResourcePool> {
    ResourcePool::with_capacity(capacity, mio::Poll::new)
}

// ── Tests ───────────────────────────────────────────────────────────────────
