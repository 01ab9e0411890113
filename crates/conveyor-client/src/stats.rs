//! Subscriber counters, shared across workers as atomics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters mutated from worker threads.
#[derive(Default)]
pub struct SubscriberStats {
    pub active_subscriptions: AtomicU64,
    pub connections_opened: AtomicU64,
    pub connection_failures: AtomicU64,
    pub resubscriptions: AtomicU64,
    pub dropped_stale: AtomicU64,
    pub dropped_unexpected: AtomicU64,
    pub unsubscribes_sent: AtomicU64,
    pub unhealthy_stream_reports: AtomicU64,
}

impl SubscriberStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn dec(counter: &AtomicU64) {
        counter.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SubscriberStatsSnapshot {
        SubscriberStatsSnapshot {
            active_subscriptions: self.active_subscriptions.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connection_failures: self.connection_failures.load(Ordering::Relaxed),
            resubscriptions: self.resubscriptions.load(Ordering::Relaxed),
            dropped_stale: self.dropped_stale.load(Ordering::Relaxed),
            dropped_unexpected: self.dropped_unexpected.load(Ordering::Relaxed),
            unsubscribes_sent: self.unsubscribes_sent.load(Ordering::Relaxed),
            unhealthy_stream_reports: self.unhealthy_stream_reports.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriberStatsSnapshot {
    pub active_subscriptions: u64,
    pub connections_opened: u64,
    pub connection_failures: u64,
    pub resubscriptions: u64,
    pub dropped_stale: u64,
    pub dropped_unexpected: u64,
    pub unsubscribes_sent: u64,
    pub unhealthy_stream_reports: u64,
}
