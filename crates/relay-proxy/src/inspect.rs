//! Observation of decoded export requests.
//!
//! Both front ends hand every decoded request to an [`Inspector`], which
//! counts it, optionally logs a one-line summary, and emits it to the
//! relay daemon.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use opentelemetry_proto::tonic::collector::logs::v1::ExportLogsServiceRequest;
use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceRequest;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::common::v1::any_value;
use opentelemetry_proto::tonic::metrics::v1::{metric, Metric};
use opentelemetry_proto::tonic::resource::v1::Resource;
use prost::Message;
use serde::de::DeserializeOwned;
use tracing::{info, warn};

use relay_client::{emit_message, Emitter};
use relay_core::{SignalKind, TelemetryEvent};

use crate::error::DecodeError;
use crate::metrics::{ProxyMetrics, Transport};

/// An OTLP export request for one signal kind.
pub trait ExportRequest: Message + Default + DeserializeOwned + Send + Sync + 'static {
    const KIND: SignalKind;

    /// Counts what the batch carries.
    fn summarize(&self) -> SignalSummary;
}

impl ExportRequest for ExportTraceServiceRequest {
    const KIND: SignalKind = SignalKind::Trace;

    fn summarize(&self) -> SignalSummary {
        let mut summary = SignalSummary::new(Self::KIND, self.encoded_len());
        for resource_spans in &self.resource_spans {
            summary.add_resource(resource_spans.resource.as_ref());
            summary.items += resource_spans
                .scope_spans
                .iter()
                .map(|scope| scope.spans.len())
                .sum::<usize>();
        }
        summary
    }
}

impl ExportRequest for ExportMetricsServiceRequest {
    const KIND: SignalKind = SignalKind::Metric;

    fn summarize(&self) -> SignalSummary {
        let mut summary = SignalSummary::new(Self::KIND, self.encoded_len());
        for resource_metrics in &self.resource_metrics {
            summary.add_resource(resource_metrics.resource.as_ref());
            summary.items += resource_metrics
                .scope_metrics
                .iter()
                .flat_map(|scope| scope.metrics.iter())
                .map(data_point_count)
                .sum::<usize>();
        }
        summary
    }
}

impl ExportRequest for ExportLogsServiceRequest {
    const KIND: SignalKind = SignalKind::Log;

    fn summarize(&self) -> SignalSummary {
        let mut summary = SignalSummary::new(Self::KIND, self.encoded_len());
        for resource_logs in &self.resource_logs {
            summary.add_resource(resource_logs.resource.as_ref());
            summary.items += resource_logs
                .scope_logs
                .iter()
                .map(|scope| scope.log_records.len())
                .sum::<usize>();
        }
        summary
    }
}

fn data_point_count(metric: &Metric) -> usize {
    match &metric.data {
        Some(metric::Data::Gauge(gauge)) => gauge.data_points.len(),
        Some(metric::Data::Sum(sum)) => sum.data_points.len(),
        Some(metric::Data::Histogram(histogram)) => histogram.data_points.len(),
        Some(metric::Data::ExponentialHistogram(histogram)) => histogram.data_points.len(),
        Some(metric::Data::Summary(summary)) => summary.data_points.len(),
        None => 0,
    }
}

/// What one export batch carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalSummary {
    pub kind: SignalKind,
    pub resources: usize,
    /// Spans, metric data points or log records
    pub items: usize,
    pub bytes: usize,
    /// Distinct `service.name` values, sorted
    pub services: Vec<String>,
}

impl SignalSummary {
    fn new(kind: SignalKind, bytes: usize) -> Self {
        Self {
            kind,
            resources: 0,
            items: 0,
            bytes,
            services: Vec::new(),
        }
    }

    fn add_resource(&mut self, resource: Option<&Resource>) {
        self.resources += 1;

        let service = resource
            .into_iter()
            .flat_map(|resource| resource.attributes.iter())
            .find(|attribute| attribute.key == "service.name")
            .and_then(|attribute| attribute.value.as_ref())
            .and_then(|value| match &value.value {
                Some(any_value::Value::StringValue(name)) => Some(name.clone()),
                _ => None,
            });

        if let Some(service) = service {
            let mut services: BTreeSet<String> = self.services.drain(..).collect();
            services.insert(service);
            self.services = services.into_iter().collect();
        }
    }

    fn item_noun(&self) -> &'static str {
        match (self.kind, self.items == 1) {
            (SignalKind::Trace, true) => "span",
            (SignalKind::Trace, false) => "spans",
            (SignalKind::Metric, true) => "data point",
            (SignalKind::Metric, false) => "data points",
            (SignalKind::Log, true) => "log record",
            (SignalKind::Log, false) => "log records",
        }
    }
}

impl fmt::Display for SignalSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<6} {} {} from {} resource{} ({} bytes)",
            self.kind.label(),
            self.items,
            self.item_noun(),
            self.resources,
            if self.resources == 1 { "" } else { "s" },
            self.bytes
        )?;
        if !self.services.is_empty() {
            write!(f, " [{}]", self.services.join(", "))?;
        }
        Ok(())
    }
}

/// Decodes an emitted event's payload and summarizes it.
pub fn summarize(event: &TelemetryEvent) -> Result<SignalSummary, DecodeError> {
    let payload = event.payload.clone();
    let summary = match event.kind {
        SignalKind::Trace => ExportTraceServiceRequest::decode(payload)?.summarize(),
        SignalKind::Metric => ExportMetricsServiceRequest::decode(payload)?.summarize(),
        SignalKind::Log => ExportLogsServiceRequest::decode(payload)?.summarize(),
    };
    Ok(summary)
}

/// Decodes an OTLP/HTTP body: protobuf when the content type says so,
/// OTLP/JSON otherwise.
pub fn decode_body<M: ExportRequest>(content_type: &str, body: &[u8]) -> Result<M, DecodeError> {
    if content_type.contains("application/x-protobuf") {
        Ok(M::decode(body)?)
    } else {
        Ok(serde_json::from_slice(body)?)
    }
}

/// Shared observation point for both front ends.
pub struct Inspector {
    emitter: Arc<dyn Emitter>,
    metrics: Arc<ProxyMetrics>,
    log_signals: AtomicBool,
}

impl Inspector {
    pub fn new(emitter: Arc<dyn Emitter>, metrics: Arc<ProxyMetrics>) -> Self {
        Self {
            emitter,
            metrics,
            log_signals: AtomicBool::new(false),
        }
    }

    /// Logs a summary line for every observed batch when enabled.
    pub fn with_signal_logging(self, enabled: bool) -> Self {
        self.log_signals.store(enabled, Ordering::Relaxed);
        self
    }

    /// Flips summary logging and returns the new setting.
    pub fn toggle_signal_logging(&self) -> bool {
        !self.log_signals.fetch_xor(true, Ordering::Relaxed)
    }

    pub fn metrics(&self) -> &Arc<ProxyMetrics> {
        &self.metrics
    }

    /// Counts, optionally logs, and emits one decoded export request.
    ///
    /// Emit failures are logged and counted, never returned.
    pub async fn observe<M: ExportRequest>(&self, transport: Transport, request: &M) {
        self.metrics.record_export(transport, M::KIND);

        if self.log_signals.load(Ordering::Relaxed) {
            info!(transport = %transport, "{}", request.summarize());
        }

        if !self.emitter.is_enabled() {
            return;
        }
        match emit_message(self.emitter.as_ref(), M::KIND, request).await {
            Ok(()) => self.metrics.record_emitted(),
            Err(e) => {
                self.metrics.record_emit_failure();
                warn!(transport = %transport, kind = %M::KIND, error = %e, "Failed to emit signal");
            }
        }
    }

    pub fn record_decode_failure(&self, transport: Transport, kind: SignalKind, error: &DecodeError) {
        self.metrics.record_decode_failure();
        warn!(transport = %transport, kind = %kind, error = %error, "Failed to decode export request");
    }
}
