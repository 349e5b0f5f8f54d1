//! Tracker counters
//!
//! Abandoned confirmations have no caller to report to; these counters are
//! the only place they surface besides the log.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::errors::AbandonReason;

/// Monotonic counters updated by the publish path and both loops
#[derive(Debug, Default)]
pub struct TrackerMetrics {
    published: AtomicU64,
    acknowledged: AtomicU64,
    timed_out: AtomicU64,
    untracked: AtomicU64,
    rejected: AtomicU64,
    stalled: AtomicU64,
    replays_scheduled: AtomicU64,
    replays_emitted: AtomicU64,
    abandoned_retries: AtomicU64,
    abandoned_no_capacity: AtomicU64,
}

/// Point-in-time copy of [`TrackerMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Messages accepted by the transport.
    pub published: u64,
    /// Registrations resolved by a matching confirmation.
    pub acknowledged: u64,
    /// Registrations expired by the sweep.
    pub timed_out: u64,
    /// Messages sent while the registration table was full.
    pub untracked: u64,
    /// Messages refused by the transport.
    pub rejected: u64,
    /// Callers released by the hard ceiling.
    pub stalled: u64,
    pub replays_scheduled: u64,
    pub replays_emitted: u64,
    pub abandoned_retries: u64,
    pub abandoned_no_capacity: u64,
}

impl MetricsSnapshot {
    /// Total confirmations dropped for good
    pub fn abandoned(&self) -> u64 {
        self.abandoned_retries + self.abandoned_no_capacity
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl TrackerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_published(&self) {
        bump(&self.published);
    }

    pub(crate) fn record_acknowledged(&self) {
        bump(&self.acknowledged);
    }

    pub(crate) fn record_timed_out(&self, count: usize) {
        self.timed_out.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_untracked(&self) {
        bump(&self.untracked);
    }

    pub(crate) fn record_rejected(&self) {
        bump(&self.rejected);
    }

    pub(crate) fn record_stalled(&self) {
        bump(&self.stalled);
    }

    pub(crate) fn record_replay_scheduled(&self) {
        bump(&self.replays_scheduled);
    }

    pub(crate) fn record_replays_emitted(&self, count: usize) {
        self.replays_emitted.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_abandoned(&self, reason: AbandonReason) {
        match reason {
            AbandonReason::RetriesExhausted { .. } => bump(&self.abandoned_retries),
            AbandonReason::NoReplayCapacity => bump(&self.abandoned_no_capacity),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            published: load(&self.published),
            acknowledged: load(&self.acknowledged),
            timed_out: load(&self.timed_out),
            untracked: load(&self.untracked),
            rejected: load(&self.rejected),
            stalled: load(&self.stalled),
            replays_scheduled: load(&self.replays_scheduled),
            replays_emitted: load(&self.replays_emitted),
            abandoned_retries: load(&self.abandoned_retries),
            abandoned_no_capacity: load(&self.abandoned_no_capacity),
        }
    }
}
