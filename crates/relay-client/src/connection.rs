//! One handshaken connection to the daemon.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::debug;

use relay_protocol::{ClientMessage, DaemonMessage, ProtocolVersion};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};

pub(crate) struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    /// Bytes of a frame not yet terminated by a newline
    frame: Vec<u8>,
}

impl Connection {
    /// Connects and completes the `connect` handshake within
    /// `config.connect_timeout`.
    pub(crate) async fn open(config: &ClientConfig) -> Result<Self> {
        match timeout(config.connect_timeout, Self::open_inner(config)).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout),
        }
    }

    async fn open_inner(config: &ClientConfig) -> Result<Self> {
        let stream = UnixStream::connect(&config.socket_path)
            .await
            .map_err(|e| ClientError::Connect {
                path: config.socket_path.clone(),
                error: e.to_string(),
            })?;

        let (reader, writer) = stream.into_split();
        let mut connection = Self {
            reader: BufReader::new(reader),
            writer,
            frame: Vec::new(),
        };

        connection
            .send(&ClientMessage::connect(config.client_id.clone()))
            .await?;

        match connection.recv().await? {
            DaemonMessage::Connected {
                protocol_version,
                client_id,
            } => {
                if !ProtocolVersion::CURRENT.is_compatible_with(&protocol_version) {
                    return Err(ClientError::VersionMismatch {
                        client_version: ProtocolVersion::CURRENT.to_string(),
                        daemon_version: protocol_version.to_string(),
                    });
                }
                debug!(client_id, protocol_version = %protocol_version, "Handshake complete");
                Ok(connection)
            }
            DaemonMessage::Rejected {
                protocol_version, ..
            } => Err(ClientError::VersionMismatch {
                client_version: ProtocolVersion::CURRENT.to_string(),
                daemon_version: protocol_version.to_string(),
            }),
            other => Err(ClientError::Protocol(format!(
                "Unexpected response to connect: {other:?}"
            ))),
        }
    }

    /// Writes one frame.
    pub(crate) async fn send(&mut self, message: &ClientMessage) -> Result<()> {
        let json = serde_json::to_string(message)?;
        self.writer.write_all(json.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Reads one frame. End of stream is [`ClientError::Disconnected`].
    ///
    /// Cancel safe: a partly read frame is kept and completed by the next
    /// call.
    pub(crate) async fn recv(&mut self) -> Result<DaemonMessage> {
        let read = self.reader.read_until(b'\n', &mut self.frame).await?;
        if read == 0 {
            self.frame.clear();
            return Err(ClientError::Disconnected);
        }
        let frame = std::mem::take(&mut self.frame);
        Ok(serde_json::from_slice(&frame)?)
    }

    /// Sends a request and waits for its single response.
    pub(crate) async fn request(
        &mut self,
        message: &ClientMessage,
        limit: std::time::Duration,
    ) -> Result<DaemonMessage> {
        let exchange = async {
            self.send(message).await?;
            self.recv().await
        };
        match timeout(limit, exchange).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout),
        }
    }
}
