//! Transport counters.
//!
//! Counters only ever grow; there is no reset. They are shared between the
//! accept, reactor, multicast and caller threads, so every update is a single
//! relaxed atomic add.

use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub const fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// Increment the counter by 1.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Add a value to the counter.
    pub fn add(&self, v: u64) {
        self.value.fetch_add(v, Ordering::Relaxed);
    }

    /// Get the current counter value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Live counters of one transport instance.
#[derive(Debug, Default)]
pub struct TransportStats {
    pub messages_sent: Counter,
    pub bytes_sent: Counter,
    pub messages_received: Counter,
    pub bytes_received: Counter,
    pub connections_accepted: Counter,
}

impl TransportStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one outbound message of `bytes` length.
    pub fn record_sent(&self, bytes: usize) {
        self.messages_sent.inc();
        self.bytes_sent.add(bytes as u64);
    }

    /// Record one inbound message of `bytes` length.
    pub fn record_received(&self, bytes: usize) {
        self.messages_received.inc();
        self.bytes_received.add(bytes as u64);
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> TransportStatsSnapshot {
        TransportStatsSnapshot {
            messages_sent: self.messages_sent.get(),
            bytes_sent: self.bytes_sent.get(),
            messages_received: self.messages_received.get(),
            bytes_received: self.bytes_received.get(),
            connections_accepted: self.connections_accepted.get(),
        }
    }
}

/// Point-in-time copy of [`TransportStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStatsSnapshot {
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub messages_received: u64,
    pub bytes_received: u64,
    pub connections_accepted: u64,
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let c = Counter::new();
        assert_eq!(c.get(), 0);
        c.inc();
        c.inc();
        c.add(10);
        assert_eq!(c.get(), 12);
    }

    #[test]
    fn test_record_and_snapshot() {
        let stats = TransportStats::new();
        stats.record_sent(100);
        stats.record_sent(20);
        stats.record_received(7);
        stats.connections_accepted.inc();

        let snap = stats.snapshot();
        assert_eq!(
            snap,
            TransportStatsSnapshot {
                messages_sent: 2,
                bytes_sent: 120,
                messages_received: 1,
                bytes_received: 7,
                connections_accepted: 1,
            }
        );
    }
}
