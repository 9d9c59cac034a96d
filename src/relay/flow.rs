//! Relay flow statistics
//!
//! Counters accumulate for the process lifetime and are never reset.

use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc,
};

/// Byte and connection counters shared by every relay task
pub struct FlowStat {
    tx: AtomicU64,
    rx: AtomicU64,
    active: AtomicUsize,
}

/// Shared reference for `FlowStat`
pub type SharedFlowStat = Arc<FlowStat>;

impl FlowStat {
    /// Create an empty statistic
    pub fn new() -> FlowStat {
        FlowStat {
            tx: AtomicU64::new(0),
            rx: AtomicU64::new(0),
            active: AtomicUsize::new(0),
        }
    }

    /// Create a new shared reference
    pub fn new_shared() -> SharedFlowStat {
        Arc::new(FlowStat::new())
    }

    /// Total bytes sent client -> upstream
    pub fn tx(&self) -> u64 {
        self.tx.load(Ordering::Acquire)
    }

    /// Add bytes sent client -> upstream
    pub fn incr_tx(&self, tx: u64) {
        self.tx.fetch_add(tx, Ordering::AcqRel);
    }

    /// Total bytes sent upstream -> client
    pub fn rx(&self) -> u64 {
        self.rx.load(Ordering::Acquire)
    }

    /// Add bytes sent upstream -> client
    pub fn incr_rx(&self, rx: u64) {
        self.rx.fetch_add(rx, Ordering::AcqRel);
    }

    /// Number of currently relaying connections
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

impl Default for FlowStat {
    fn default() -> FlowStat {
        FlowStat::new()
    }
}

/// RAII connection counter, held for the lifetime of one connection task
pub struct ConnectionGuard {
    stat: SharedFlowStat,
}

impl ConnectionGuard {
    pub fn new(stat: SharedFlowStat) -> ConnectionGuard {
        stat.active.fetch_add(1, Ordering::AcqRel);
        ConnectionGuard { stat }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.stat.active.fetch_sub(1, Ordering::AcqRel);
    }
}
