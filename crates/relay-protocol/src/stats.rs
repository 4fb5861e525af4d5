//! Daemon statistics as reported by `get_stats`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Point-in-time view of the daemon's counters.
///
/// The `*_observed` and `*_dropped` counters never decrease within one
/// daemon lifetime. `active_readers` and `active_writers` are gauges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub traces_observed: u64,
    pub metrics_observed: u64,
    pub logs_observed: u64,
    pub bytes_observed: u64,

    /// Viewers currently streaming
    pub active_readers: u32,

    /// `emit` calls currently in flight
    pub active_writers: u32,

    pub uptime_seconds: u64,

    /// Events discarded because the central intake queue was full or closed
    #[serde(default)]
    pub intake_dropped: u64,

    /// Per-viewer deliveries discarded because that viewer's queue was full
    #[serde(default)]
    pub consumer_dropped: u64,

    /// When the daemon started listening
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

impl StatsSnapshot {
    /// Total signals observed across all kinds.
    pub fn signals_observed(&self) -> u64 {
        self.traces_observed
            .saturating_add(self.metrics_observed)
            .saturating_add(self.logs_observed)
    }
}
