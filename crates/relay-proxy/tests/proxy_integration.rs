//! Proxy tests over real sockets, with a recording emitter in place of the
//! daemon.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::Router;
use bytes::Bytes;
use opentelemetry_proto::tonic::collector::logs::v1::ExportLogsServiceRequest;
use opentelemetry_proto::tonic::collector::trace::v1::trace_service_client::TraceServiceClient;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::logs::v1::{LogRecord, ResourceLogs, ScopeLogs};
use opentelemetry_proto::tonic::trace::v1::{ResourceSpans, ScopeSpans, Span};
use prost::Message;
use relay_client::{ClientError, Emitter};
use relay_core::{SignalKind, TelemetryEvent};
use relay_proxy::{
    GrpcProxy, GrpcProxyConfig, HttpProxy, HttpProxyConfig, Inspector, Proxy, ProxyError,
    ProxyMetrics, Transport,
};
use reqwest::header::CONTENT_TYPE;
use tonic::transport::Endpoint;

/// Keeps every emitted event; fails every call when `broken` is set.
#[derive(Default)]
struct RecordingEmitter {
    events: Mutex<Vec<TelemetryEvent>>,
    broken: bool,
}

impl RecordingEmitter {
    fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl Emitter for RecordingEmitter {
    async fn emit(&self, event: TelemetryEvent) -> relay_client::Result<()> {
        if self.broken {
            return Err(ClientError::Disconnected);
        }
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

struct Harness {
    emitter: Arc<RecordingEmitter>,
    inspector: Arc<Inspector>,
}

impl Harness {
    fn new() -> Self {
        Self::with_emitter(RecordingEmitter::default())
    }

    fn with_emitter(emitter: RecordingEmitter) -> Self {
        let emitter = Arc::new(emitter);
        let inspector = Arc::new(Inspector::new(
            Arc::clone(&emitter) as Arc<dyn Emitter>,
            Arc::new(ProxyMetrics::new()),
        ));
        Self { emitter, inspector }
    }

    fn metrics(&self) -> &ProxyMetrics {
        self.inspector.metrics()
    }

    async fn grpc(&self, upstream: Option<String>) -> GrpcProxy {
        let proxy = GrpcProxy::new(
            GrpcProxyConfig {
                listen_addr: "127.0.0.1:0".to_string(),
                upstream,
            },
            Arc::clone(&self.inspector),
        );
        proxy.start().await.unwrap();
        proxy
    }

    async fn http(&self, upstream: Option<String>) -> HttpProxy {
        self.http_with(HttpProxyConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            upstream,
            ..Default::default()
        })
        .await
    }

    async fn http_with(&self, config: HttpProxyConfig) -> HttpProxy {
        let proxy = HttpProxy::new(config, Arc::clone(&self.inspector));
        proxy.start().await.unwrap();
        proxy
    }
}

fn trace_request(span_name: &str) -> ExportTraceServiceRequest {
    ExportTraceServiceRequest {
        resource_spans: vec![ResourceSpans {
            scope_spans: vec![ScopeSpans {
                spans: vec![Span {
                    name: span_name.to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        }],
    }
}

async fn grpc_client(proxy: &dyn Proxy) -> TraceServiceClient<tonic::transport::Channel> {
    let address = proxy.local_addr().unwrap();
    let channel = Endpoint::from_shared(format!("http://{address}"))
        .unwrap()
        .connect()
        .await
        .unwrap();
    TraceServiceClient::new(channel)
}

fn http_url(proxy: &dyn Proxy, path: &str) -> String {
    format!("http://{}{}", proxy.local_addr().unwrap(), path)
}

/// A port nothing listens on.
fn closed_port() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap();
    drop(listener);
    address.to_string()
}

// ============================================================================
// gRPC
// ============================================================================

#[tokio::test]
async fn test_grpc_without_upstream_answers_and_emits() {
    let harness = Harness::new();
    let proxy = harness.grpc(None).await;
    assert_eq!(proxy.protocol(), "grpc");

    let request = trace_request("GET /checkout");
    let response = grpc_client(&proxy)
        .await
        .export(request.clone())
        .await
        .unwrap();
    assert_eq!(response.into_inner().partial_success, None);

    let events = harness.emitter.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, SignalKind::Trace);
    assert_eq!(
        ExportTraceServiceRequest::decode(events[0].payload.clone()).unwrap(),
        request
    );

    assert_eq!(harness.metrics().exports(Transport::Grpc, SignalKind::Trace), 1);
    assert_eq!(harness.metrics().total_exports(), 1);

    proxy.stop().await.unwrap();
    assert_eq!(proxy.err().await, Ok(()));
}

#[tokio::test]
async fn test_grpc_relays_to_upstream() {
    let upstream = Harness::new();
    let collector = upstream.grpc(None).await;

    let harness = Harness::new();
    let proxy = harness
        .grpc(Some(collector.local_addr().unwrap().to_string()))
        .await;

    grpc_client(&proxy)
        .await
        .export(trace_request("relayed"))
        .await
        .unwrap();

    assert_eq!(harness.emitter.events().len(), 1);
    assert_eq!(upstream.emitter.events().len(), 1);
    assert_eq!(
        ExportTraceServiceRequest::decode(upstream.emitter.events()[0].payload.clone())
            .unwrap()
            .resource_spans[0]
            .scope_spans[0]
            .spans[0]
            .name,
        "relayed"
    );

    proxy.stop().await.unwrap();
    collector.stop().await.unwrap();
}

#[tokio::test]
async fn test_grpc_unreachable_upstream_fails_only_the_call() {
    let harness = Harness::new();
    let proxy = harness.grpc(Some(closed_port())).await;

    let result = grpc_client(&proxy)
        .await
        .export(trace_request("lost"))
        .await;
    assert!(result.is_err());

    // Observed before forwarding
    assert_eq!(harness.emitter.events().len(), 1);

    proxy.stop().await.unwrap();
}

#[tokio::test]
async fn test_grpc_malformed_upstream_fails_start() {
    let harness = Harness::new();
    let proxy = GrpcProxy::new(
        GrpcProxyConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            upstream: Some("bad upstream".to_string()),
        },
        Arc::clone(&harness.inspector),
    );

    let error = proxy.start().await.unwrap_err();
    assert!(matches!(error, ProxyError::InvalidUpstream { .. }));
    assert_eq!(proxy.err().await, Err(error));
    assert!(proxy.local_addr().is_none());
}

#[tokio::test]
async fn test_grpc_emit_failure_does_not_fail_export() {
    let harness = Harness::with_emitter(RecordingEmitter {
        broken: true,
        ..Default::default()
    });
    let proxy = harness.grpc(None).await;

    grpc_client(&proxy)
        .await
        .export(trace_request("unwatched"))
        .await
        .unwrap();

    let metrics = harness.metrics();
    assert_eq!(metrics.exports(Transport::Grpc, SignalKind::Trace), 1);
    assert_eq!(metrics.emit_failures.load(std::sync::atomic::Ordering::Relaxed), 1);

    proxy.stop().await.unwrap();
}

#[tokio::test]
async fn test_start_twice_and_err_before_start() {
    let harness = Harness::new();
    let proxy = GrpcProxy::new(
        GrpcProxyConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            upstream: None,
        },
        Arc::clone(&harness.inspector),
    );
    assert_eq!(proxy.err().await, Err(ProxyError::NotStarted));

    proxy.start().await.unwrap();
    assert_eq!(proxy.start().await, Err(ProxyError::AlreadyStarted));

    proxy.stop().await.unwrap();
}

#[tokio::test]
async fn test_bind_failure_is_reported() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let harness = Harness::new();
    let proxy = HttpProxy::new(
        HttpProxyConfig {
            listen_addr: taken.local_addr().unwrap().to_string(),
            ..Default::default()
        },
        Arc::clone(&harness.inspector),
    );

    assert!(matches!(proxy.start().await, Err(ProxyError::Bind { .. })));
}

// ============================================================================
// HTTP
// ============================================================================

#[tokio::test]
async fn test_http_protobuf_without_upstream() {
    let harness = Harness::new();
    let proxy = harness.http(None).await;
    assert_eq!(proxy.protocol(), "http");

    let request = trace_request("POST /orders");
    let response = reqwest::Client::new()
        .post(http_url(&proxy, "/v1/traces"))
        .header(CONTENT_TYPE, "application/x-protobuf")
        .body(request.encode_to_vec())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let events = harness.emitter.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, SignalKind::Trace);
    assert_eq!(harness.metrics().exports(Transport::Http, SignalKind::Trace), 1);

    proxy.stop().await.unwrap();
    assert_eq!(proxy.err().await, Ok(()));
}

#[tokio::test]
async fn test_http_json_body_is_decoded() {
    let harness = Harness::new();
    let proxy = harness.http(None).await;

    let request = ExportLogsServiceRequest {
        resource_logs: vec![ResourceLogs {
            scope_logs: vec![ScopeLogs {
                log_records: vec![LogRecord::default(), LogRecord::default()],
                ..Default::default()
            }],
            ..Default::default()
        }],
    };
    let response = reqwest::Client::new()
        .post(http_url(&proxy, "/v1/logs"))
        .header(CONTENT_TYPE, "application/json")
        .body(serde_json::to_vec(&request).unwrap())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let events = harness.emitter.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, SignalKind::Log);
    let summary = relay_proxy::summarize(&events[0]).unwrap();
    assert_eq!(summary.items, 2);

    proxy.stop().await.unwrap();
}

#[tokio::test]
async fn test_http_unknown_path_is_not_inspected() {
    let harness = Harness::new();
    let proxy = harness.http(None).await;

    let response = reqwest::Client::new()
        .get(http_url(&proxy, "/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    assert!(harness.emitter.events().is_empty());
    assert_eq!(harness.metrics().total_exports(), 0);
    assert_eq!(
        harness
            .metrics()
            .decode_failures
            .load(std::sync::atomic::Ordering::Relaxed),
        0
    );

    proxy.stop().await.unwrap();
}

#[tokio::test]
async fn test_http_undecodable_body_is_counted_and_still_answered() {
    let harness = Harness::new();
    let proxy = harness.http(None).await;

    let response = reqwest::Client::new()
        .post(http_url(&proxy, "/v1/traces"))
        .header(CONTENT_TYPE, "application/x-protobuf")
        .body(vec![0xff, 0xff, 0xff])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    assert!(harness.emitter.events().is_empty());
    assert_eq!(
        harness
            .metrics()
            .decode_failures
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );

    proxy.stop().await.unwrap();
}

#[tokio::test]
async fn test_http_oversized_body_is_rejected() {
    let harness = Harness::new();
    let proxy = harness
        .http_with(HttpProxyConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            upstream: None,
            max_body_size: 1024,
        })
        .await;

    let response = reqwest::Client::new()
        .post(http_url(&proxy, "/v1/traces"))
        .header(CONTENT_TYPE, "application/x-protobuf")
        .body(vec![0u8; 4096])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert!(harness.emitter.events().is_empty());

    proxy.stop().await.unwrap();
}

#[tokio::test]
async fn test_http_relays_status_headers_and_body() {
    // Echoes the path and query it was reached on
    let collector = Router::new().fallback(|uri: Uri, headers: HeaderMap, body: Bytes| async move {
        let tenant = headers
            .get("x-tenant")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        (
            StatusCode::ACCEPTED,
            [("x-seen-uri", uri.to_string()), ("x-seen-tenant", tenant)],
            body,
        )
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let collector_addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, collector).await });

    let harness = Harness::new();
    let proxy = harness
        .http(Some(format!("http://{collector_addr}/otlp")))
        .await;

    let body = trace_request("forwarded").encode_to_vec();
    let response = reqwest::Client::new()
        .post(http_url(&proxy, "/v1/traces?tenant=a"))
        .header(CONTENT_TYPE, "application/x-protobuf")
        .header("x-tenant", "a")
        .body(body.clone())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(response.headers()["x-seen-uri"], "/otlp/v1/traces?tenant=a");
    assert_eq!(response.headers()["x-seen-tenant"], "a");
    assert_eq!(response.bytes().await.unwrap().as_ref(), body.as_slice());
    assert_eq!(harness.emitter.events().len(), 1);

    proxy.stop().await.unwrap();
}

#[tokio::test]
async fn test_http_chained_proxies_both_observe() {
    let upstream = Harness::new();
    let collector = upstream.http(None).await;

    let harness = Harness::new();
    let proxy = harness
        .http(Some(format!("http://{}", collector.local_addr().unwrap())))
        .await;

    let response = reqwest::Client::new()
        .post(http_url(&proxy, "/v1/traces"))
        .header(CONTENT_TYPE, "application/x-protobuf")
        .body(trace_request("chained").encode_to_vec())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    assert_eq!(harness.emitter.events().len(), 1);
    assert_eq!(upstream.emitter.events().len(), 1);

    proxy.stop().await.unwrap();
    collector.stop().await.unwrap();
}

#[tokio::test]
async fn test_http_unreachable_upstream_is_bad_gateway() {
    let harness = Harness::new();
    let proxy = harness
        .http(Some(format!("http://{}", closed_port())))
        .await;

    let response = reqwest::Client::new()
        .post(http_url(&proxy, "/v1/traces"))
        .header(CONTENT_TYPE, "application/x-protobuf")
        .body(trace_request("dropped").encode_to_vec())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(harness.emitter.events().len(), 1);

    proxy.stop().await.unwrap();
}

#[tokio::test]
async fn test_http_malformed_upstream_fails_start() {
    let harness = Harness::new();
    let proxy = HttpProxy::new(
        HttpProxyConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            upstream: Some("not a url".to_string()),
            ..Default::default()
        },
        Arc::clone(&harness.inspector),
    );

    assert!(matches!(
        proxy.start().await,
        Err(ProxyError::InvalidUpstream { .. })
    ));
}
