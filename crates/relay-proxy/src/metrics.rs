//! Proxy counters.
//!
//! One instance is created at process start and handed to every front end;
//! there is no global registry.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use relay_core::SignalKind;

/// Which front end accepted an export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Grpc,
    Http,
}

impl Transport {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Grpc => "grpc",
            Self::Http => "http",
        }
    }

    const fn index(self) -> usize {
        match self {
            Self::Grpc => 0,
            Self::Http => 1,
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const fn kind_index(kind: SignalKind) -> usize {
    match kind {
        SignalKind::Trace => 0,
        SignalKind::Metric => 1,
        SignalKind::Log => 2,
    }
}

/// Atomic counters for everything the proxies accept and emit.
#[derive(Debug, Default)]
pub struct ProxyMetrics {
    /// Accepted exports by transport, then kind
    exports: [[AtomicU64; 3]; 2],

    /// Events handed to an enabled emitter without error
    pub events_emitted: AtomicU64,

    /// Emitter calls that returned an error
    pub emit_failures: AtomicU64,

    /// Known-path HTTP bodies that could not be decoded
    pub decode_failures: AtomicU64,
}

impl ProxyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_export(&self, transport: Transport, kind: SignalKind) {
        self.exports[transport.index()][kind_index(kind)].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_emitted(&self) {
        self.events_emitted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_emit_failure(&self) {
        self.emit_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Accepted exports of `kind` through `transport`.
    pub fn exports(&self, transport: Transport, kind: SignalKind) -> u64 {
        self.exports[transport.index()][kind_index(kind)].load(Ordering::Relaxed)
    }

    /// Accepted exports across every transport and kind.
    pub fn total_exports(&self) -> u64 {
        self.exports
            .iter()
            .flatten()
            .map(|counter| counter.load(Ordering::Relaxed))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_per_transport_and_kind() {
        let metrics = ProxyMetrics::new();
        metrics.record_export(Transport::Grpc, SignalKind::Trace);
        metrics.record_export(Transport::Grpc, SignalKind::Trace);
        metrics.record_export(Transport::Http, SignalKind::Log);

        assert_eq!(metrics.exports(Transport::Grpc, SignalKind::Trace), 2);
        assert_eq!(metrics.exports(Transport::Http, SignalKind::Trace), 0);
        assert_eq!(metrics.exports(Transport::Http, SignalKind::Log), 1);
        assert_eq!(metrics.total_exports(), 3);
    }
}
