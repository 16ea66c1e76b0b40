//! Per-component atomic counters. Observational only — never
//! the source of truth for any control-flow decision, collection is
//! optional and costs nothing when not read.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[derive(Default)]
pub struct IoMetrics {
    pub active_conns: AtomicUsize,
    pub total_requests: AtomicU64,
    pub bytes_written: AtomicU64,
}

impl IoMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_conn(&self) {
        self.active_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_conn(&self) {
        self.active_conns.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_req(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, n: usize) {
        self.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// WorkerPool metrics ("Submitted, completed, rejected, cumulative
/// execution time").
#[derive(Default)]
pub struct WorkerPoolMetrics {
    pub submitted: AtomicU64,
    pub completed: AtomicU64,
    pub rejected: AtomicU64,
    pub cumulative_exec_nanos: AtomicU64,
}

impl WorkerPoolMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn average_exec_nanos(&self) -> u64 {
        let completed = self.completed.load(Ordering::Relaxed);
        if completed == 0 {
            0
        } else {
            self.cumulative_exec_nanos.load(Ordering::Relaxed) / completed
        }
    }

    pub fn in_flight(&self) -> u64 {
        self.submitted
            .load(Ordering::Relaxed)
            .saturating_sub(self.completed.load(Ordering::Relaxed))
            .saturating_sub(self.rejected.load(Ordering::Relaxed))
    }
}

/// DispatchEngine-level counters: fast-path / ultra-fast-path / worker-path
/// hit counts, useful for confirming the `/health` short-circuit and fast
/// route cache are actually taking load off the worker pool.
#[derive(Default)]
pub struct DispatchMetrics {
    pub fast_path_hits: AtomicU64,
    pub ultra_fast_path_hits: AtomicU64,
    pub worker_path_hits: AtomicU64,
    pub breaker_rejections: AtomicU64,
    pub not_found: AtomicU64,
    pub handler_failures: AtomicU64,
}

impl DispatchMetrics {
    pub fn new() -> Self {
        Self::default()
    }
}
