//! Signal kind identification.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::DomainError;

/// Kind of OpenTelemetry signal carried by an export request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    /// `ExportTraceServiceRequest`
    Trace,

    /// `ExportMetricsServiceRequest`
    Metric,

    /// `ExportLogsServiceRequest`
    Log,
}

impl SignalKind {
    /// All signal kinds, in wire order.
    pub const ALL: [SignalKind; 3] = [SignalKind::Trace, SignalKind::Metric, SignalKind::Log];

    /// Returns the lowercase identifier used on the wire and in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Metric => "metric",
            Self::Log => "log",
        }
    }

    /// Returns the upper-case label shown by viewers.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Trace => "TRACE",
            Self::Metric => "METRIC",
            Self::Log => "LOG",
        }
    }

    /// Returns the OTLP/HTTP export path for this signal.
    pub fn http_path(&self) -> &'static str {
        match self {
            Self::Trace => "/v1/traces",
            Self::Metric => "/v1/metrics",
            Self::Log => "/v1/logs",
        }
    }

    /// Maps an OTLP/HTTP request path to its signal kind.
    ///
    /// Returns `None` for any path that is not one of the three export paths.
    pub fn from_http_path(path: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.http_path() == path)
    }
}

impl FromStr for SignalKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" | "traces" => Ok(Self::Trace),
            "metric" | "metrics" => Ok(Self::Metric),
            "log" | "logs" => Ok(Self::Log),
            _ => Err(DomainError::UnknownSignalKind(s.to_string())),
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_kind_parsing() {
        assert_eq!("trace".parse::<SignalKind>().unwrap(), SignalKind::Trace);
        assert_eq!("METRICS".parse::<SignalKind>().unwrap(), SignalKind::Metric);
        assert_eq!("logs".parse::<SignalKind>().unwrap(), SignalKind::Log);
        assert!("profile".parse::<SignalKind>().is_err());
    }

    #[test]
    fn test_http_path_mapping() {
        assert_eq!(SignalKind::from_http_path("/v1/traces"), Some(SignalKind::Trace));
        assert_eq!(SignalKind::from_http_path("/v1/metrics"), Some(SignalKind::Metric));
        assert_eq!(SignalKind::from_http_path("/v1/logs"), Some(SignalKind::Log));
        assert_eq!(SignalKind::from_http_path("/v1/logs/"), None);
        assert_eq!(SignalKind::from_http_path("/health"), None);
    }

    #[test]
    fn test_serialization_is_snake_case() {
        let json = serde_json::to_string(&SignalKind::Metric).unwrap();
        assert_eq!(json, "\"metric\"");
    }
}
