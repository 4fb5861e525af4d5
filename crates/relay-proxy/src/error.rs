//! Error types for the proxy front ends.

use std::time::Duration;

use thiserror::Error;

/// Errors starting, running or stopping a proxy.
///
/// Cloneable so the terminal result of a serving loop can be handed to
/// every caller waiting in `err()`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProxyError {
    #[error("Failed to bind {address}: {error}")]
    Bind { address: String, error: String },

    #[error("Invalid upstream address {address}: {error}")]
    InvalidUpstream { address: String, error: String },

    #[error("Proxy already started")]
    AlreadyStarted,

    #[error("Proxy not started")]
    NotStarted,

    #[error("Server error: {0}")]
    Serve(String),

    #[error("Drain did not finish within {0:?}")]
    DrainTimeout(Duration),
}

/// Failure to decode an inbound export body.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("invalid protobuf: {0}")]
    Protobuf(#[from] prost::DecodeError),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}
