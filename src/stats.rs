use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counters. Read for logs and the status file only.
pub static RUN_STATS: Lazy<RunStats> = Lazy::new(RunStats::default);

#[derive(Debug, Default)]
pub struct RunStats {
    triggers: AtomicU64,
    fills: AtomicU64,
    rejections: AtomicU64,
    repairs: AtomicU64,
    abandoned: AtomicU64,
    exhausted: AtomicU64,
    snapshot_errors: AtomicU64,
    stale_snapshots: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStatsSnapshot {
    pub triggers: u64,
    pub fills: u64,
    pub rejections: u64,
    pub repairs: u64,
    pub abandoned: u64,
    pub exhausted: u64,
    pub snapshot_errors: u64,
    pub stale_snapshots: u64,
}

impl RunStats {
    pub fn record_trigger(&self) {
        self.triggers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fill(&self) {
        self.fills.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejection(&self) {
        self.rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_repairs(&self, legs: usize) {
        self.repairs.fetch_add(legs as u64, Ordering::Relaxed);
    }

    pub fn record_abandoned(&self, pairs: usize) {
        self.abandoned.fetch_add(pairs as u64, Ordering::Relaxed);
    }

    pub fn record_exhausted(&self, pairs: usize) {
        self.exhausted.fetch_add(pairs as u64, Ordering::Relaxed);
    }

    pub fn record_snapshot_error(&self) {
        self.snapshot_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_snapshot(&self) {
        self.stale_snapshots.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RunStatsSnapshot {
        RunStatsSnapshot {
            triggers: self.triggers.load(Ordering::Relaxed),
            fills: self.fills.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
            repairs: self.repairs.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            snapshot_errors: self.snapshot_errors.load(Ordering::Relaxed),
            stale_snapshots: self.stale_snapshots.load(Ordering::Relaxed),
        }
    }
}
