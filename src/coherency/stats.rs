use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct CoherencyCounters {
    pub read_hits: AtomicU64,
    pub read_misses: AtomicU64,
    pub write_hits: AtomicU64,
    pub write_misses: AtomicU64,
    pub invalidations_sent: AtomicU64,
    pub invalidations_received: AtomicU64,
    pub writebacks: AtomicU64,
    pub migrations: AtomicU64,
    pub evictions: AtomicU64,
    pub timeouts: AtomicU64,
    pub contentions: AtomicU64,
}

impl CoherencyCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, amount: u64) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }

    pub fn snapshot(&self, pending_transactions: usize, cached_lines: usize) -> CoherencyStats {
        CoherencyStats {
            read_hits: self.read_hits.load(Ordering::Relaxed),
            read_misses: self.read_misses.load(Ordering::Relaxed),
            write_hits: self.write_hits.load(Ordering::Relaxed),
            write_misses: self.write_misses.load(Ordering::Relaxed),
            invalidations_sent: self.invalidations_sent.load(Ordering::Relaxed),
            invalidations_received: self.invalidations_received.load(Ordering::Relaxed),
            writebacks: self.writebacks.load(Ordering::Relaxed),
            migrations: self.migrations.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            contentions: self.contentions.load(Ordering::Relaxed),
            pending_transactions,
            cached_lines,
        }
    }
}

/// Point-in-time view exposed to operational tooling.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoherencyStats {
    pub read_hits: u64,
    pub read_misses: u64,
    pub write_hits: u64,
    pub write_misses: u64,
    pub invalidations_sent: u64,
    pub invalidations_received: u64,
    pub writebacks: u64,
    pub migrations: u64,
    pub evictions: u64,
    pub timeouts: u64,
    /// Line operations that lost to an initiator on another node and retried.
    pub contentions: u64,
    pub pending_transactions: usize,
    pub cached_lines: usize,
}
