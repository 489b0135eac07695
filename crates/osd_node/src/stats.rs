//! Per-stage counters.
//!
//! Updated by the stage task and the admission path, read by whoever polls
//! `Pipeline::stats`. All counters are best-effort (`Relaxed`).

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub queue_depth: usize,
    pub open_files: usize,
    pub processed: u64,
    pub rejected: u64,
    pub overloaded: u64,
    pub faults: u64,
}

impl StatsSnapshot {
    pub fn merge(self, other: StatsSnapshot) -> StatsSnapshot {
        StatsSnapshot {
            queue_depth: self.queue_depth + other.queue_depth,
            open_files: self.open_files + other.open_files,
            processed: self.processed + other.processed,
            rejected: self.rejected + other.rejected,
            overloaded: self.overloaded + other.overloaded,
            faults: self.faults + other.faults,
        }
    }
}

#[derive(Debug, Default)]
pub struct StageStats {
    queue_depth: AtomicUsize,
    open_files: AtomicUsize,
    processed: AtomicU64,
    rejected: AtomicU64,
    overloaded: AtomicU64,
    faults: AtomicU64,
}

impl StageStats {
    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.store(depth, Ordering::Relaxed);
    }

    pub fn set_open_files(&self, open: usize) {
        self.open_files.store(open, Ordering::Relaxed);
    }

    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    /// A request completed with a business error.
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_overloaded(&self) {
        self.overloaded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            open_files: self.open_files.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            overloaded: self.overloaded.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
        }
    }
}
