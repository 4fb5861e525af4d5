//! OTLP/HTTP front end.
//!
//! Every request is answered by one fallback handler. Bodies on the three
//! OTLP signal paths are decoded and inspected; everything else passes
//! through untouched. With an upstream configured the original request is
//! replayed there and its response relayed back.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, HeaderMap, HeaderName, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use bytes::Bytes;
use opentelemetry_proto::tonic::collector::logs::v1::ExportLogsServiceRequest;
use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceRequest;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use reqwest::redirect::Policy;
use reqwest::Url;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use relay_core::SignalKind;

use crate::error::ProxyError;
use crate::inspect::{decode_body, ExportRequest, Inspector};
use crate::metrics::Transport;
use crate::serve::{normalize_listen_addr, ServeHandle};
use crate::{Proxy, MAX_MESSAGE_SIZE};

/// Headers that describe one hop and are never relayed.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Settings for an [`HttpProxy`].
#[derive(Debug, Clone)]
pub struct HttpProxyConfig {
    /// `host:port` or `:port`
    pub listen_addr: String,

    /// Base URL of the collector to relay to, e.g. `http://localhost:4318`
    pub upstream: Option<String>,

    /// Larger bodies are answered with `413 Payload Too Large`
    pub max_body_size: usize,
}

impl Default for HttpProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: ":14318".to_string(),
            upstream: None,
            max_body_size: MAX_MESSAGE_SIZE,
        }
    }
}

fn parse_upstream(address: &str) -> Result<Url, ProxyError> {
    let invalid = |error: String| ProxyError::InvalidUpstream {
        address: address.to_string(),
        error,
    };

    let url = Url::parse(address).map_err(|e| invalid(e.to_string()))?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Ok(url),
        "http" | "https" => Err(invalid("missing host".to_string())),
        other => Err(invalid(format!("unsupported scheme {other}"))),
    }
}

/// Joins the upstream base path with the request path and keeps the query.
fn upstream_url(base: &Url, uri: &Uri) -> Url {
    let mut url = base.clone();
    let path = format!("{}{}", base.path().trim_end_matches('/'), uri.path());
    url.set_path(&path);
    url.set_query(uri.query());
    url
}

fn is_end_to_end(name: &HeaderName) -> bool {
    let name = name.as_str();
    !HOP_BY_HOP.contains(&name) && name != "host" && name != "content-length"
}

fn end_to_end_headers(headers: &HeaderMap) -> HeaderMap {
    headers
        .iter()
        .filter(|(name, _)| is_end_to_end(name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

struct Upstream {
    base: Url,
    client: reqwest::Client,
}

struct HttpState {
    inspector: Arc<Inspector>,
    upstream: Option<Upstream>,
}

impl HttpState {
    async fn inspect(&self, kind: SignalKind, headers: &HeaderMap, body: &[u8]) {
        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();

        match kind {
            SignalKind::Trace => {
                self.decode_and_observe::<ExportTraceServiceRequest>(content_type, body)
                    .await
            }
            SignalKind::Metric => {
                self.decode_and_observe::<ExportMetricsServiceRequest>(content_type, body)
                    .await
            }
            SignalKind::Log => {
                self.decode_and_observe::<ExportLogsServiceRequest>(content_type, body)
                    .await
            }
        }
    }

    async fn decode_and_observe<M: ExportRequest>(&self, content_type: &str, body: &[u8]) {
        match decode_body::<M>(content_type, body) {
            Ok(request) => self.inspector.observe(Transport::Http, &request).await,
            Err(e) => self
                .inspector
                .record_decode_failure(Transport::Http, M::KIND, &e),
        }
    }

    async fn forward(
        &self,
        upstream: &Upstream,
        method: Method,
        uri: &Uri,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Response, reqwest::Error> {
        let url = upstream_url(&upstream.base, uri);
        let response = upstream
            .client
            .request(method, url)
            .headers(end_to_end_headers(headers))
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let headers = end_to_end_headers(response.headers());
        let body = response.bytes().await?;

        let mut relayed = Response::new(Body::from(body));
        *relayed.status_mut() = status;
        *relayed.headers_mut() = headers;
        Ok(relayed)
    }
}

async fn relay(
    State(state): State<Arc<HttpState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(kind) = SignalKind::from_http_path(uri.path()) {
        state.inspect(kind, &headers, &body).await;
    }

    let Some(upstream) = &state.upstream else {
        return StatusCode::OK.into_response();
    };

    match state.forward(upstream, method, &uri, &headers, body).await {
        Ok(response) => response,
        Err(e) => {
            warn!(path = %uri.path(), error = %e, "Upstream request failed");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}

/// OTLP/HTTP interception proxy.
pub struct HttpProxy {
    config: HttpProxyConfig,
    inspector: Arc<Inspector>,
    handle: ServeHandle,
}

impl HttpProxy {
    pub fn new(config: HttpProxyConfig, inspector: Arc<Inspector>) -> Self {
        Self {
            config,
            inspector,
            handle: ServeHandle::new(),
        }
    }

    async fn bind(&self) -> Result<(TcpListener, SocketAddr, Router), ProxyError> {
        let upstream = match &self.config.upstream {
            Some(address) => {
                let base = parse_upstream(address)?;
                let client = reqwest::Client::builder()
                    .redirect(Policy::none())
                    .build()
                    .map_err(|e| ProxyError::InvalidUpstream {
                        address: address.clone(),
                        error: e.to_string(),
                    })?;
                Some(Upstream { base, client })
            }
            None => None,
        };

        let address = normalize_listen_addr(&self.config.listen_addr);
        let bind_error = |e: std::io::Error| ProxyError::Bind {
            address: address.clone(),
            error: e.to_string(),
        };
        let listener = TcpListener::bind(&address).await.map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        let state = Arc::new(HttpState {
            inspector: Arc::clone(&self.inspector),
            upstream,
        });
        let router = Router::new()
            .fallback(relay)
            .layer(DefaultBodyLimit::max(self.config.max_body_size))
            .with_state(state);

        Ok((listener, local_addr, router))
    }
}

#[async_trait]
impl Proxy for HttpProxy {
    fn protocol(&self) -> &'static str {
        "http"
    }

    async fn start(&self) -> Result<(), ProxyError> {
        self.handle.begin()?;

        let (listener, local_addr, router) = match self.bind().await {
            Ok(bound) => bound,
            Err(e) => return Err(self.handle.fail(e)),
        };

        let shutdown = self.handle.shutdown_signal();
        self.handle.spawn(local_addr, async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
                .map_err(|e| ProxyError::Serve(e.to_string()));
            debug!("HTTP proxy loop exited");
            result
        });

        match &self.config.upstream {
            Some(upstream) => info!(listen = %local_addr, upstream = %upstream, "HTTP proxy listening"),
            None => info!(listen = %local_addr, "HTTP proxy listening (inspection only)"),
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

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_upstream_must_be_http() {
        assert!(parse_upstream("http://localhost:4318").is_ok());
        assert!(parse_upstream("https://collector.example/otlp").is_ok());
        assert!(matches!(
            parse_upstream("ftp://collector"),
            Err(ProxyError::InvalidUpstream { .. })
        ));
        assert!(parse_upstream("localhost 4318").is_err());
    }

    #[test]
    fn test_upstream_url_keeps_base_path_and_query() {
        let base = Url::parse("http://collector:4318/otlp/").unwrap();
        let uri: Uri = "/v1/traces?tenant=a".parse().unwrap();
        assert_eq!(
            upstream_url(&base, &uri).as_str(),
            "http://collector:4318/otlp/v1/traces?tenant=a"
        );

        let base = Url::parse("http://collector:4318").unwrap();
        let uri: Uri = "/v1/logs".parse().unwrap();
        assert_eq!(upstream_url(&base, &uri).as_str(), "http://collector:4318/v1/logs");
    }

    #[test]
    fn test_hop_by_hop_headers_are_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(header::HOST, HeaderValue::from_static("proxy:14318"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("12"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/x-protobuf"));
        headers.insert("x-tenant", HeaderValue::from_static("a"));

        let relayed = end_to_end_headers(&headers);
        assert_eq!(relayed.len(), 2);
        assert!(relayed.contains_key(header::CONTENT_TYPE));
        assert!(relayed.contains_key("x-tenant"));
    }
}
