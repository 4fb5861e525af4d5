//! Process-wide counters read by `get_stats`.
//!
//! Every counter is a lone atomic; nothing here takes a lock. Observed and
//! dropped counters only ever grow until the process restarts.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

use chrono::{DateTime, Utc};

use relay_core::{SignalKind, TelemetryEvent};
use relay_protocol::StatsSnapshot;

/// Counters describing what the daemon has seen since it started.
#[derive(Debug, Default)]
pub struct DaemonStats {
    traces_observed: AtomicU64,
    metrics_observed: AtomicU64,
    logs_observed: AtomicU64,
    bytes_observed: AtomicU64,

    intake_dropped: AtomicU64,
    consumer_dropped: AtomicU64,

    active_readers: AtomicU32,
    active_writers: AtomicU32,

    started: OnceLock<(Instant, DateTime<Utc>)>,
}

impl DaemonStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the moment the server started listening. Later calls are ignored.
    pub fn mark_started(&self) {
        let _ = self.started.set((Instant::now(), Utc::now()));
    }

    /// Counts an event that made it into the intake queue.
    pub fn record_accepted(&self, event: &TelemetryEvent) {
        let counter = match event.kind {
            SignalKind::Trace => &self.traces_observed,
            SignalKind::Metric => &self.metrics_observed,
            SignalKind::Log => &self.logs_observed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.bytes_observed
            .fetch_add(event.len() as u64, Ordering::Relaxed);
    }

    pub fn record_intake_drop(&self) {
        self.intake_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_consumer_drop(&self) {
        self.consumer_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_active_readers(&self, count: usize) {
        let count = u32::try_from(count).unwrap_or(u32::MAX);
        self.active_readers.store(count, Ordering::Relaxed);
    }

    /// Marks one `emit` call as in flight until the guard is dropped.
    pub fn writer_guard(&self) -> WriterGuard<'_> {
        self.active_writers.fetch_add(1, Ordering::Relaxed);
        WriterGuard { stats: self }
    }

    /// Reads every counter. Never mutates anything.
    pub fn snapshot(&self) -> StatsSnapshot {
        let (uptime_seconds, started_at) = match self.started.get() {
            Some((instant, at)) => (instant.elapsed().as_secs(), Some(*at)),
            None => (0, None),
        };

        StatsSnapshot {
            traces_observed: self.traces_observed.load(Ordering::Relaxed),
            metrics_observed: self.metrics_observed.load(Ordering::Relaxed),
            logs_observed: self.logs_observed.load(Ordering::Relaxed),
            bytes_observed: self.bytes_observed.load(Ordering::Relaxed),
            active_readers: self.active_readers.load(Ordering::Relaxed),
            active_writers: self.active_writers.load(Ordering::Relaxed),
            uptime_seconds,
            intake_dropped: self.intake_dropped.load(Ordering::Relaxed),
            consumer_dropped: self.consumer_dropped.load(Ordering::Relaxed),
            started_at,
        }
    }
}

/// Decrements the active-writer gauge on drop.
pub struct WriterGuard<'a> {
    stats: &'a DaemonStats,
}

impl Drop for WriterGuard<'_> {
    fn drop(&mut self) {
        self.stats.active_writers.fetch_sub(1, Ordering::Relaxed);
    }
}
