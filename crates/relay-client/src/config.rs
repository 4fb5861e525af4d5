//! Client configuration.

use std::path::PathBuf;
use std::time::Duration;

use relay_protocol::DEFAULT_SOCKET_PATH;

/// Where the daemon lives and how long to wait on it.
///
/// ```rust
/// use relay_client::ClientConfig;
/// use std::time::Duration;
///
/// let config = ClientConfig {
///     socket_path: "/tmp/my-relay.sock".into(),
///     request_timeout: Duration::from_secs(1),
///     ..Default::default()
/// };
/// assert_eq!(config.connect_timeout, Duration::from_secs(1));
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub socket_path: PathBuf,

    /// Limit for connecting plus the handshake
    pub connect_timeout: Duration,

    /// Limit for one request/response exchange
    pub request_timeout: Duration,

    /// Sent in the handshake; the daemon assigns one when absent
    pub client_id: Option<String>,

    /// Emits queued for the daemon connection before new ones are refused
    pub max_pending_emits: usize,
}

impl ClientConfig {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            ..Self::default()
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            connect_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(5),
            client_id: None,
            max_pending_emits: 1000,
        }
    }
}
