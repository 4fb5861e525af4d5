//! OTLP/gRPC front end.
//!
//! Serves the collector `Export` RPC for traces, metrics and logs. Each
//! call is inspected first and then, when an upstream is configured,
//! relayed over one shared lazily-connected channel. The upstream's
//! response or status goes back to the caller unchanged.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use opentelemetry_proto::tonic::collector::logs::v1::{
    logs_service_client::LogsServiceClient,
    logs_service_server::{LogsService, LogsServiceServer},
    ExportLogsServiceRequest, ExportLogsServiceResponse,
};
use opentelemetry_proto::tonic::collector::metrics::v1::{
    metrics_service_client::MetricsServiceClient,
    metrics_service_server::{MetricsService, MetricsServiceServer},
    ExportMetricsServiceRequest, ExportMetricsServiceResponse,
};
use opentelemetry_proto::tonic::collector::trace::v1::{
    trace_service_client::TraceServiceClient,
    trace_service_server::{TraceService, TraceServiceServer},
    ExportTraceServiceRequest, ExportTraceServiceResponse,
};
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::{Channel, Endpoint, Server};
use tonic::{Request, Response, Status};
use tracing::{debug, info};

use crate::error::ProxyError;
use crate::inspect::{ExportRequest, Inspector};
use crate::metrics::Transport;
use crate::serve::{normalize_listen_addr, ServeHandle};
use crate::{Proxy, MAX_MESSAGE_SIZE};

/// Settings for a [`GrpcProxy`].
#[derive(Debug, Clone)]
pub struct GrpcProxyConfig {
    /// `host:port` or `:port`
    pub listen_addr: String,

    /// Collector to relay to, as `host:port` or a full `http://` URI
    pub upstream: Option<String>,
}

impl Default for GrpcProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: ":14317".to_string(),
            upstream: None,
        }
    }
}

/// Builds the upstream endpoint. A bare `host:port` is taken as plaintext.
fn upstream_endpoint(address: &str) -> Result<Endpoint, ProxyError> {
    let uri = if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{address}")
    };

    Endpoint::from_shared(uri).map_err(|e| ProxyError::InvalidUpstream {
        address: address.to_string(),
        error: e.to_string(),
    })
}

/// State every export service shares.
struct Relay {
    inspector: Arc<Inspector>,
    upstream: Option<Channel>,
}

impl Relay {
    async fn observe<M: ExportRequest>(&self, request: &Request<M>) {
        self.inspector
            .observe(Transport::Grpc, request.get_ref())
            .await;
    }
}

/// Copies the caller's metadata onto a fresh request for the upstream.
fn upstream_request<M>(request: Request<M>) -> Request<M> {
    let metadata = request.metadata().clone();
    let mut forwarded = Request::new(request.into_inner());
    *forwarded.metadata_mut() = metadata;
    forwarded
}

struct TraceRelay(Arc<Relay>);

#[tonic::async_trait]
impl TraceService for TraceRelay {
    async fn export(
        &self,
        request: Request<ExportTraceServiceRequest>,
    ) -> Result<Response<ExportTraceServiceResponse>, Status> {
        self.0.observe(&request).await;

        match &self.0.upstream {
            Some(channel) => {
                TraceServiceClient::new(channel.clone())
                    .max_decoding_message_size(MAX_MESSAGE_SIZE)
                    .max_encoding_message_size(MAX_MESSAGE_SIZE)
                    .export(upstream_request(request))
                    .await
            }
            None => Ok(Response::new(ExportTraceServiceResponse::default())),
        }
    }
}

struct MetricsRelay(Arc<Relay>);

#[tonic::async_trait]
impl MetricsService for MetricsRelay {
    async fn export(
        &self,
        request: Request<ExportMetricsServiceRequest>,
    ) -> Result<Response<ExportMetricsServiceResponse>, Status> {
        self.0.observe(&request).await;

        match &self.0.upstream {
            Some(channel) => {
                MetricsServiceClient::new(channel.clone())
                    .max_decoding_message_size(MAX_MESSAGE_SIZE)
                    .max_encoding_message_size(MAX_MESSAGE_SIZE)
                    .export(upstream_request(request))
                    .await
            }
            None => Ok(Response::new(ExportMetricsServiceResponse::default())),
        }
    }
}

struct LogsRelay(Arc<Relay>);

#[tonic::async_trait]
impl LogsService for LogsRelay {
    async fn export(
        &self,
        request: Request<ExportLogsServiceRequest>,
    ) -> Result<Response<ExportLogsServiceResponse>, Status> {
        self.0.observe(&request).await;

        match &self.0.upstream {
            Some(channel) => {
                LogsServiceClient::new(channel.clone())
                    .max_decoding_message_size(MAX_MESSAGE_SIZE)
                    .max_encoding_message_size(MAX_MESSAGE_SIZE)
                    .export(upstream_request(request))
                    .await
            }
            None => Ok(Response::new(ExportLogsServiceResponse::default())),
        }
    }
}

/// OTLP/gRPC interception proxy.
pub struct GrpcProxy {
    config: GrpcProxyConfig,
    inspector: Arc<Inspector>,
    handle: ServeHandle,
}

impl GrpcProxy {
    pub fn new(config: GrpcProxyConfig, inspector: Arc<Inspector>) -> Self {
        Self {
            config,
            inspector,
            handle: ServeHandle::new(),
        }
    }

    async fn bind(&self) -> Result<(TcpListener, SocketAddr, Arc<Relay>), ProxyError> {
        // A bad upstream is a start error; a down upstream only fails calls
        let upstream = match &self.config.upstream {
            Some(address) => Some(upstream_endpoint(address)?.connect_lazy()),
            None => None,
        };

        let address = normalize_listen_addr(&self.config.listen_addr);
        let bind_error = |e: std::io::Error| ProxyError::Bind {
            address: address.clone(),
            error: e.to_string(),
        };
        let listener = TcpListener::bind(&address).await.map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        let relay = Arc::new(Relay {
            inspector: Arc::clone(&self.inspector),
            upstream,
        });
        Ok((listener, local_addr, relay))
    }
}

#[async_trait]
impl Proxy for GrpcProxy {
    fn protocol(&self) -> &'static str {
        "grpc"
    }

    async fn start(&self) -> Result<(), ProxyError> {
        self.handle.begin()?;

        let (listener, local_addr, relay) = match self.bind().await {
            Ok(bound) => bound,
            Err(e) => return Err(self.handle.fail(e)),
        };

        let router = Server::builder()
            .add_service(
                TraceServiceServer::new(TraceRelay(Arc::clone(&relay)))
                    .max_decoding_message_size(MAX_MESSAGE_SIZE),
            )
            .add_service(
                MetricsServiceServer::new(MetricsRelay(Arc::clone(&relay)))
                    .max_decoding_message_size(MAX_MESSAGE_SIZE),
            )
            .add_service(
                LogsServiceServer::new(LogsRelay(relay))
                    .max_decoding_message_size(MAX_MESSAGE_SIZE),
            );

        let shutdown = self.handle.shutdown_signal();
        self.handle.spawn(local_addr, async move {
            let result = router
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
                .await
                .map_err(|e| ProxyError::Serve(e.to_string()));
            debug!("gRPC proxy loop exited");
            result
        });

        match &self.config.upstream {
            Some(upstream) => info!(listen = %local_addr, upstream = %upstream, "gRPC proxy listening"),
            None => info!(listen = %local_addr, "gRPC proxy listening (inspection only)"),
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), ProxyError> {
        self.handle.stop().await
    }

    async fn err(&self) -> Result<(), ProxyError> {
        self.handle.err().await
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.handle.local_addr()
    }
}
