//! Viewer-side client: live event streams and stats queries.

use tracing::debug;

use relay_core::TelemetryEvent;
use relay_protocol::{ClientMessage, DaemonMessage, StatsSnapshot};

use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::error::{ClientError, Result};

/// Client for reading from the daemon.
///
/// Each call opens its own connection; a stream keeps its connection for
/// as long as it lives.
#[derive(Debug, Clone)]
pub struct StreamClient {
    config: ClientConfig,
}

impl StreamClient {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    /// Checks that the daemon answers a handshake and a ping.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let client = Self::new(config);
        let mut connection = Connection::open(&client.config).await?;
        match connection
            .request(&ClientMessage::ping(0), client.config.request_timeout)
            .await?
        {
            DaemonMessage::Pong { .. } => Ok(client),
            other => Err(ClientError::Protocol(format!(
                "Unexpected response to ping: {other:?}"
            ))),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Fetches a statistics snapshot.
    pub async fn stats(&self) -> Result<StatsSnapshot> {
        let mut connection = Connection::open(&self.config).await?;
        let response = connection
            .request(&ClientMessage::get_stats(), self.config.request_timeout)
            .await?;

        // Best effort; the daemon also handles a plain hang-up
        let _ = connection.send(&ClientMessage::disconnect()).await;

        match response {
            DaemonMessage::Stats { stats } => Ok(stats),
            DaemonMessage::Error { message, .. } => Err(ClientError::Daemon(message)),
            other => Err(ClientError::Protocol(format!(
                "Unexpected response to get_stats: {other:?}"
            ))),
        }
    }

    /// Registers as a viewer. Only events accepted from now on are delivered.
    pub async fn stream(&self) -> Result<EventStream> {
        let mut connection = Connection::open(&self.config).await?;
        match connection
            .request(&ClientMessage::stream(), self.config.request_timeout)
            .await?
        {
            DaemonMessage::StreamStarted => {
                debug!(socket = %self.config.socket_path.display(), "Stream started");
                Ok(EventStream { connection })
            }
            DaemonMessage::Error { message, .. } => Err(ClientError::Daemon(message)),
            other => Err(ClientError::Protocol(format!(
                "Unexpected response to stream: {other:?}"
            ))),
        }
    }
}

/// Live feed of events from the daemon.
pub struct EventStream {
    connection: Connection,
}

impl EventStream {
    /// Waits for the next event. Returns `None` once the daemon ends the
    /// stream.
    pub async fn next(&mut self) -> Result<Option<TelemetryEvent>> {
        loop {
            match self.connection.recv().await {
                Ok(DaemonMessage::Event { event }) => return Ok(Some(event)),
                Ok(DaemonMessage::Error { message, .. }) => {
                    return Err(ClientError::Daemon(message))
                }
                Ok(other) => {
                    debug!(message = ?other, "Ignoring non-event frame");
                }
                Err(ClientError::Disconnected) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }

    /// Tells the daemon to stop streaming and drops the connection.
    pub async fn close(mut self) -> Result<()> {
        self.connection.send(&ClientMessage::disconnect()).await
    }
}
