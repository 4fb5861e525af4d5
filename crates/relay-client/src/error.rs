//! Error types for relay clients.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors talking to the relay daemon.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Nothing accepted the connection at the socket path.
    #[error("Failed to connect to daemon at {path}: {error}")]
    Connect { path: PathBuf, error: String },

    /// Client and daemon speak incompatible protocol versions.
    #[error("Protocol version mismatch (client: {client_version}, daemon: {daemon_version})")]
    VersionMismatch {
        client_version: String,
        daemon_version: String,
    },

    /// Daemon sent something other than what the exchange calls for.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Daemon answered with an error frame.
    #[error("Daemon error: {0}")]
    Daemon(String),

    #[error("Daemon closed the connection")]
    Disconnected,

    #[error("Timed out waiting for daemon")]
    Timeout,

    /// Too many emits are waiting on the daemon; this one was not sent.
    #[error("Emit queue full, event dropped")]
    QueueFull,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClientError {
    /// True when the connection it happened on cannot be reused.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            Self::Disconnected
                | Self::Io(_)
                | Self::Timeout
                | Self::Protocol(_)
                | Self::Json(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
