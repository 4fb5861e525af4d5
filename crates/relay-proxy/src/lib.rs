//! OTLP interception front ends for otel-relay.
//!
//! [`GrpcProxy`] and [`HttpProxy`] accept OTLP exports, hand each decoded
//! request to a shared [`Inspector`], and relay the original call to an
//! optional upstream collector.

pub mod error;
pub mod grpc;
pub mod http;
pub mod inspect;
pub mod metrics;
mod serve;

use std::net::SocketAddr;

use async_trait::async_trait;

pub use error::{DecodeError, ProxyError};
pub use grpc::{GrpcProxy, GrpcProxyConfig};
pub use http::{HttpProxy, HttpProxyConfig};
pub use inspect::{decode_body, summarize, ExportRequest, Inspector, SignalSummary};
pub use metrics::{ProxyMetrics, Transport};
pub use serve::DRAIN_TIMEOUT;

/// Largest gRPC message or HTTP body accepted, in bytes
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// A front end that can be started once and stopped.
#[async_trait]
pub trait Proxy: Send + Sync {
    /// Short transport name for logs
    fn protocol(&self) -> &'static str;

    /// Binds and begins serving in the background.
    async fn start(&self) -> Result<(), ProxyError>;

    /// Stops accepting and drains in-flight requests.
    async fn stop(&self) -> Result<(), ProxyError>;

    /// Resolves once the serving loop exits, with its terminal result.
    async fn err(&self) -> Result<(), ProxyError>;

    /// Bound address, once started
    fn local_addr(&self) -> Option<SocketAddr>;
}
