//! Process-wide counters for the synchronization machinery.
//!
//! The getter, event-record and callback-enqueue paths all bump these;
//! they are how the call-count guarantees of the scope protocol are
//! observed from the outside (and asserted in hardware tests).

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

/// Counters for the cross-stream synchronization machinery.
#[derive(Debug, Default)]
pub struct SyncMetrics {
    gets_already_available: AtomicU64,
    gets_same_stream: AtomicU64,
    event_waits_issued: AtomicU64,
    events_recorded: AtomicU64,
    callbacks_enqueued: AtomicU64,
}

impl SyncMetrics {
    pub(crate) fn incr_already_available(&self) {
        self.gets_already_available.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_same_stream(&self) {
        self.gets_same_stream.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_event_waits(&self) {
        self.event_waits_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_events_recorded(&self) {
        self.events_recorded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_callbacks_enqueued(&self) {
        self.callbacks_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time copy of the counters.
    #[must_use]
    pub fn snapshot(&self) -> SyncMetricsSnapshot {
        SyncMetricsSnapshot {
            gets_already_available: self.gets_already_available.load(Ordering::Relaxed),
            gets_same_stream: self.gets_same_stream.load(Ordering::Relaxed),
            event_waits_issued: self.event_waits_issued.load(Ordering::Relaxed),
            events_recorded: self.events_recorded.load(Ordering::Relaxed),
            callbacks_enqueued: self.callbacks_enqueued.load(Ordering::Relaxed),
        }
    }

    /// Resets all counters to zero.
    pub fn reset(&self) {
        self.gets_already_available.store(0, Ordering::Relaxed);
        self.gets_same_stream.store(0, Ordering::Relaxed);
        self.event_waits_issued.store(0, Ordering::Relaxed);
        self.events_recorded.store(0, Ordering::Relaxed);
        self.callbacks_enqueued.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`SyncMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncMetricsSnapshot {
    /// Reads served without synchronization because the producer work
    /// had already completed.
    pub gets_already_available: u64,
    /// Reads served without synchronization because producer and
    /// consumer share a queue.
    pub gets_same_stream: u64,
    /// Non-blocking wait-on-event instructions issued.
    pub event_waits_issued: u64,
    /// Producer-done events recorded.
    pub events_recorded: u64,
    /// Completion callbacks bound to streams.
    pub callbacks_enqueued: u64,
}

impl SyncMetricsSnapshot {
    /// Total synchronizing reads observed.
    #[must_use]
    pub fn gets_total(&self) -> u64 {
        self.gets_already_available + self.gets_same_stream + self.event_waits_issued
    }

    /// Counter deltas between `self` and an earlier snapshot.
    #[must_use]
    pub fn since(&self, earlier: &SyncMetricsSnapshot) -> SyncMetricsSnapshot {
        SyncMetricsSnapshot {
            gets_already_available: self.gets_already_available - earlier.gets_already_available,
            gets_same_stream: self.gets_same_stream - earlier.gets_same_stream,
            event_waits_issued: self.event_waits_issued - earlier.event_waits_issued,
            events_recorded: self.events_recorded - earlier.events_recorded,
            callbacks_enqueued: self.callbacks_enqueued - earlier.callbacks_enqueued,
        }
    }
}

impl fmt::Display for SyncMetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Sync: {} reads ({} available, {} same-stream, {} waited), {} events recorded, {} callbacks",
            self.gets_total(),
            self.gets_already_available,
            self.gets_same_stream,
            self.event_waits_issued,
            self.events_recorded,
            self.callbacks_enqueued
        )
    }
}

static METRICS: OnceLock<SyncMetrics> = OnceLock::new();

/// Process-wide synchronization counters.
pub fn sync_metrics() -> &'static SyncMetrics {
    METRICS.get_or_init(SyncMetrics::default)
}
