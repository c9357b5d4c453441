//! Engine statistics.
//!
//! Counters are independent atomics so that the kernel-callback side, the
//! correlator task and the worker can all bump them without sharing a lock.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct ProcMonStats {
    /// Images currently in existence (gauge).
    pub images: AtomicI64,
    /// Successful live-process recoveries.
    pub liveacq: AtomicU64,
    pub miss_bypid: AtomicU64,
    pub miss_forksubj: AtomicU64,
    pub miss_execsubj: AtomicU64,
    pub miss_execinterp: AtomicU64,
    pub miss_chdirsubj: AtomicU64,
    pub miss_getcwd: AtomicU64,
    /// Events impaired by kernel-reported memory exhaustion.
    pub ooms: AtomicU64,
    pub pqlookup: AtomicU64,
    pub pqmiss: AtomicU64,
    pub pqdrop: AtomicU64,
    pub pqskip: AtomicU64,
    /// Current number of queued pre-exec images (gauge).
    pub pqsize: AtomicU64,
}

impl ProcMonStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            images: self.images.load(Ordering::Relaxed),
            liveacq: self.liveacq.load(Ordering::Relaxed),
            miss_bypid: self.miss_bypid.load(Ordering::Relaxed),
            miss_forksubj: self.miss_forksubj.load(Ordering::Relaxed),
            miss_execsubj: self.miss_execsubj.load(Ordering::Relaxed),
            miss_execinterp: self.miss_execinterp.load(Ordering::Relaxed),
            miss_chdirsubj: self.miss_chdirsubj.load(Ordering::Relaxed),
            miss_getcwd: self.miss_getcwd.load(Ordering::Relaxed),
            ooms: self.ooms.load(Ordering::Relaxed),
            pqlookup: self.pqlookup.load(Ordering::Relaxed),
            pqmiss: self.pqmiss.load(Ordering::Relaxed),
            pqdrop: self.pqdrop.load(Ordering::Relaxed),
            pqskip: self.pqskip.load(Ordering::Relaxed),
            pqsize: self.pqsize.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the engine counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub images: i64,
    pub liveacq: u64,
    pub miss_bypid: u64,
    pub miss_forksubj: u64,
    pub miss_execsubj: u64,
    pub miss_execinterp: u64,
    pub miss_chdirsubj: u64,
    pub miss_getcwd: u64,
    pub ooms: u64,
    pub pqlookup: u64,
    pub pqmiss: u64,
    pub pqdrop: u64,
    pub pqskip: u64,
    pub pqsize: u64,
}

/// Relaxed increment shorthand for event counters.
pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}
