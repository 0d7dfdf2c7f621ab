//! Dispatch metrics — process-wide counters for the dispatch engine.
//!
//! Uses a lock-free design: every counter and the latency summary are
//! plain atomics, so recording never blocks a dispatch worker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Counters shared by the queue processor, dispatchers, and reaper.
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    claimed: AtomicU64,
    dispatch_success: AtomicU64,
    dispatch_failure: AtomicU64,
    requeued: AtomicU64,
    finalized: AtomicU64,
    restarted: AtomicU64,
    reaper_cancelled: AtomicU64,
    reaper_deleted: AtomicU64,
    reaper_skipped: AtomicU64,
    reaper_errors: AtomicU64,
    stale_containers_deleted: AtomicU64,
    latency_count: AtomicU64,
    latency_sum_ms: AtomicU64,
    latency_max_ms: AtomicU64,
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub claimed: u64,
    pub dispatch_success: u64,
    pub dispatch_failure: u64,
    pub requeued: u64,
    pub finalized: u64,
    pub restarted: u64,
    pub reaper_cancelled: u64,
    pub reaper_deleted: u64,
    pub reaper_skipped: u64,
    pub reaper_errors: u64,
    pub stale_containers_deleted: u64,
    pub dispatch_latency_count: u64,
    pub dispatch_latency_sum_ms: u64,
    pub dispatch_latency_max_ms: u64,
}

fn bump(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

impl DispatchMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_claimed(&self, count: usize) {
        bump(&self.claimed, count as u64);
    }

    /// A container was created; `elapsed` covers resolution through creation.
    pub fn record_dispatch_success(&self, elapsed: Duration) {
        bump(&self.dispatch_success, 1);
        let ms = elapsed.as_millis() as u64;
        bump(&self.latency_count, 1);
        bump(&self.latency_sum_ms, ms);
        self.latency_max_ms.fetch_max(ms, Ordering::Relaxed);
    }

    pub fn record_dispatch_failure(&self) {
        bump(&self.dispatch_failure, 1);
    }

    pub fn record_requeued(&self) {
        bump(&self.requeued, 1);
    }

    pub fn record_finalized(&self) {
        bump(&self.finalized, 1);
    }

    pub fn record_restarted(&self) {
        bump(&self.restarted, 1);
    }

    pub fn record_reaper_cancelled(&self) {
        bump(&self.reaper_cancelled, 1);
    }

    pub fn record_reaper_deleted(&self) {
        bump(&self.reaper_deleted, 1);
    }

    pub fn record_reaper_skipped(&self) {
        bump(&self.reaper_skipped, 1);
    }

    pub fn record_reaper_error(&self) {
        bump(&self.reaper_errors, 1);
    }

    pub fn record_stale_container_deleted(&self) {
        bump(&self.stale_containers_deleted, 1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            claimed: load(&self.claimed),
            dispatch_success: load(&self.dispatch_success),
            dispatch_failure: load(&self.dispatch_failure),
            requeued: load(&self.requeued),
            finalized: load(&self.finalized),
            restarted: load(&self.restarted),
            reaper_cancelled: load(&self.reaper_cancelled),
            reaper_deleted: load(&self.reaper_deleted),
            reaper_skipped: load(&self.reaper_skipped),
            reaper_errors: load(&self.reaper_errors),
            stale_containers_deleted: load(&self.stale_containers_deleted),
            dispatch_latency_count: load(&self.latency_count),
            dispatch_latency_sum_ms: load(&self.latency_sum_ms),
            dispatch_latency_max_ms: load(&self.latency_max_ms),
        }
    }
}
