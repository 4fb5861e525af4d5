//! Connection handler for individual client connections.
//!
//! Each connection gets its own `ConnectionHandler` that:
//! - Performs protocol version negotiation
//! - Hands emitted events to the broadcaster
//! - Answers stats and ping requests
//! - Turns into a one-way event stream once the client asks for `stream`
//!
//! Connection errors are logged and end that connection only.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::timeout;
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};

use relay_protocol::{ClientMessage, DaemonMessage, MessageType, ProtocolVersion};

use super::{Broadcaster, Consumer};

/// Write timeout (10 seconds)
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection handler for a single client.
pub struct ConnectionHandler {
    frames: FrameReader,

    writer: BufWriter<OwnedWriteHalf>,

    shared: Arc<Broadcaster>,

    /// Assigned after handshake
    client_id: Option<String>,

    connection_number: u64,
}

impl ConnectionHandler {
    pub(crate) fn new(
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        shared: Arc<Broadcaster>,
        connection_number: u64,
    ) -> Self {
        Self {
            frames: FrameReader::new(reader, shared.max_frame_size()),
            writer: BufWriter::new(writer),
            shared,
            client_id: None,
            connection_number,
        }
    }

    /// Runs the handshake and then serves requests until the client leaves,
    /// the connection fails, or the server shuts down.
    pub async fn run(mut self) {
        debug!(connection = self.connection_number, "New client connected");

        match self.handle_handshake().await {
            Ok(()) => {
                debug!(client_id = ?self.client_id, "Client handshake completed");
            }
            // Liveness probes connect and hang up without a word
            Err(ConnectionError::Eof) => {
                debug!(connection = self.connection_number, "Client left before handshake");
                return;
            }
            Err(e) => {
                warn!(
                    connection = self.connection_number,
                    error = %e,
                    "Handshake failed"
                );
                return;
            }
        }

        if let Err(e) = self.process_messages().await {
            debug!(client_id = ?self.client_id, error = %e, "Connection closed");
        }

        debug!(client_id = ?self.client_id, "Client disconnected");
    }

    /// Expects a `Connect` message, validates the protocol version, and
    /// responds with `Connected` or `Rejected`.
    async fn handle_handshake(&mut self) -> Result<(), ConnectionError> {
        let msg = self.read_message().await?;

        let client_version = msg.protocol_version;
        if !client_version.is_compatible_with(&ProtocolVersion::CURRENT) {
            warn!(
                client_version = %client_version,
                server_version = %ProtocolVersion::CURRENT,
                "Protocol version mismatch"
            );

            self.send_message(&DaemonMessage::rejected(&format!(
                "Protocol version {} not compatible with server version {}",
                client_version,
                ProtocolVersion::CURRENT
            )))
            .await?;

            return Err(ConnectionError::VersionMismatch {
                client: client_version,
                server: ProtocolVersion::CURRENT,
            });
        }

        match msg.message {
            MessageType::Connect { client_id } => {
                let assigned_id =
                    client_id.unwrap_or_else(|| format!("client-{}", self.connection_number));
                self.client_id = Some(assigned_id.clone());
                self.send_message(&DaemonMessage::connected(assigned_id))
                    .await
            }
            other => {
                self.send_message(&DaemonMessage::error("Expected Connect message for handshake"))
                    .await?;
                Err(ConnectionError::UnexpectedMessage(format!("{other:?}")))
            }
        }
    }

    /// Request/response loop for producers and stats clients.
    async fn process_messages(&mut self) -> Result<(), ConnectionError> {
        let idle_timeout = self.shared.idle_timeout();
        let cancel_token = self.shared.cancel_token().clone();

        loop {
            let next = tokio::select! {
                biased;

                _ = cancel_token.cancelled() => {
                    debug!(client_id = ?self.client_id, "Server closing connection");
                    return Ok(());
                }
                next = timeout(idle_timeout, self.read_message()) => next,
            };

            let msg = match next {
                Ok(Ok(msg)) => msg,
                Ok(Err(ConnectionError::Eof)) => {
                    debug!(client_id = ?self.client_id, "Client sent EOF");
                    return Ok(());
                }
                Ok(Err(ConnectionError::ParseError(reason))) => {
                    warn!(client_id = ?self.client_id, error = %reason, "Ignoring malformed message");
                    self.send_message(&DaemonMessage::error_with_code(&reason, "parse_error"))
                        .await?;
                    continue;
                }
                Ok(Err(ConnectionError::MessageTooLarge { max })) => {
                    warn!(client_id = ?self.client_id, max, "Rejecting oversized frame");
                    let reason = format!("Frame exceeds limit of {max} bytes");
                    self.send_message(&DaemonMessage::error_with_code(&reason, "message_too_large"))
                        .await?;
                    continue;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    debug!(client_id = ?self.client_id, "Connection timed out");
                    return Err(ConnectionError::Timeout);
                }
            };

            match msg.message {
                MessageType::Connect { .. } => {
                    self.send_message(&DaemonMessage::error("Already connected"))
                        .await?;
                }

                MessageType::Emit { event } => {
                    if !self.shared.submit(event) {
                        debug!(client_id = ?self.client_id, "Event dropped at intake");
                    }
                    self.send_message(&DaemonMessage::EmitAck).await?;
                }

                MessageType::GetStats => {
                    self.send_message(&DaemonMessage::stats(self.shared.stats()))
                        .await?;
                }

                MessageType::Ping { seq } => {
                    self.send_message(&DaemonMessage::pong(seq)).await?;
                }

                // Streaming takes over the connection for good
                MessageType::Stream => return self.handle_stream().await,

                MessageType::Disconnect => {
                    debug!(client_id = ?self.client_id, "Client requested disconnect");
                    return Ok(());
                }
            }
        }
    }

    /// Registers a consumer and pushes events until either side stops.
    async fn handle_stream(&mut self) -> Result<(), ConnectionError> {
        let mut consumer = self.shared.register().await;
        let consumer_id = consumer.id();
        info!(client_id = ?self.client_id, consumer = consumer_id, "Viewer attached");

        let result = self.stream_events(&mut consumer).await;

        self.shared.unregister(consumer_id).await;
        info!(client_id = ?self.client_id, consumer = consumer_id, "Viewer detached");
        result
    }

    async fn stream_events(&mut self, consumer: &mut Consumer) -> Result<(), ConnectionError> {
        self.send_message(&DaemonMessage::StreamStarted).await?;
        let cancel_token = self.shared.cancel_token().clone();

        loop {
            tokio::select! {
                next = consumer.recv() => match next {
                    Some(event) => {
                        self.send_message(&DaemonMessage::event((*event).clone())).await?;
                    }
                    // Server dropped our queue
                    None => return Ok(()),
                },

                frame = self.frames.next_frame() => match frame {
                    Ok(None) => return Ok(()),
                    Ok(Some(line)) => {
                        if let Ok(msg) = serde_json::from_str::<ClientMessage>(&line) {
                            if matches!(msg.message, MessageType::Disconnect) {
                                return Ok(());
                            }
                        }
                    }
                    // Viewers have nothing big to say; skip it
                    Err(ConnectionError::MessageTooLarge { .. }) => {}
                    Err(e) => return Err(e),
                },

                _ = cancel_token.cancelled() => return Ok(()),
            }
        }
    }

    /// Reads a single message from the client.
    async fn read_message(&mut self) -> Result<ClientMessage, ConnectionError> {
        let line = self.frames.next_frame().await?.ok_or(ConnectionError::Eof)?;

        let msg: ClientMessage =
            serde_json::from_str(&line).map_err(|e| ConnectionError::ParseError(e.to_string()))?;

        Ok(msg)
    }

    /// Sends a message to the client.
    async fn send_message(&mut self, msg: &DaemonMessage) -> Result<(), ConnectionError> {
        let json =
            serde_json::to_string(msg).map_err(|e| ConnectionError::ParseError(e.to_string()))?;

        let writer = &mut self.writer;
        match timeout(WRITE_TIMEOUT, async {
            writer.write_all(json.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
            Ok::<(), std::io::Error>(())
        })
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ConnectionError::Io(e.to_string())),
            Err(_) => Err(ConnectionError::WriteTimeout),
        }
    }
}

/// Errors that can occur during connection handling.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Protocol version mismatch: client {client}, server {server}")]
    VersionMismatch {
        client: ProtocolVersion,
        server: ProtocolVersion,
    },

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection closed")]
    Eof,

    #[error("Read timeout")]
    Timeout,

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Message too large (max: {max} bytes)")]
    MessageTooLarge { max: usize },
}

/// Newline framing with a hard length limit.
///
/// An oversized frame is reported as soon as the limit is passed, without
/// buffering the rest of it. The remainder is skipped up to the next newline,
/// so the connection stays usable. Cancel safe: bytes already read stay in
/// the buffer for the next call.
struct FrameReader {
    reader: OwnedReadHalf,
    codec: LinesCodec,
    buffer: BytesMut,
    max: usize,
}

impl FrameReader {
    fn new(reader: OwnedReadHalf, max: usize) -> Self {
        Self {
            reader,
            codec: LinesCodec::new_with_max_length(max),
            buffer: BytesMut::with_capacity(8 * 1024),
            max,
        }
    }

    async fn next_frame(&mut self) -> Result<Option<String>, ConnectionError> {
        loop {
            let decoded = self.codec.decode(&mut self.buffer);
            if let Some(line) = decoded.map_err(|e| self.error(e))? {
                return Ok(Some(line));
            }
            let read = self
                .reader
                .read_buf(&mut self.buffer)
                .await
                .map_err(|e| ConnectionError::Io(e.to_string()))?;
            if read == 0 {
                let decoded = self.codec.decode_eof(&mut self.buffer);
                return decoded.map_err(|e| self.error(e));
            }
        }
    }

    fn error(&self, error: LinesCodecError) -> ConnectionError {
        match error {
            LinesCodecError::MaxLineLengthExceeded => {
                ConnectionError::MessageTooLarge { max: self.max }
            }
            LinesCodecError::Io(e) => ConnectionError::Io(e.to_string()),
        }
    }
}
