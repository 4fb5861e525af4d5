//! Telemetry emitters used by the interception proxy.
//!
//! An emitter hands each observed export batch to the daemon. Failures are
//! returned so the caller can log and count them; they must never stop the
//! export itself from being forwarded.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{oneshot, Mutex};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, warn};

use relay_core::{SignalKind, TelemetryEvent};
use relay_protocol::{ClientMessage, DaemonMessage};

use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::error::{ClientError, Result};

/// Sink for observed telemetry.
#[async_trait]
pub trait Emitter: Send + Sync {
    /// Hands one event to the fan-out.
    async fn emit(&self, event: TelemetryEvent) -> Result<()>;

    /// False when emitting is a no-op, so callers can skip serializing.
    fn is_enabled(&self) -> bool {
        true
    }
}

/// Serializes a decoded export request and emits it.
///
/// Nothing is encoded when the emitter is disabled.
pub async fn emit_message<M>(emitter: &dyn Emitter, kind: SignalKind, message: &M) -> Result<()>
where
    M: prost::Message,
{
    if !emitter.is_enabled() {
        return Ok(());
    }
    emitter
        .emit(TelemetryEvent::new(kind, message.encode_to_vec()))
        .await
}

/// Emitter used when fan-out is turned off.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEmitter;

#[async_trait]
impl Emitter for NoopEmitter {
    async fn emit(&self, _event: TelemetryEvent) -> Result<()> {
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        false
    }
}

/// Emitter backed by a persistent daemon connection.
///
/// The connection is opened on first use under a lock, so concurrent first
/// calls share one connection. After that the lock only guards handing out
/// the connection's queue: a writer task pipelines emits onto the socket
/// and matches acks in order, so each call waits for its own ack (at most
/// `request_timeout`) and never behind another call. A connection that
/// fails is discarded and the next call reconnects.
pub struct SocketEmitter {
    config: ClientConfig,
    writer: Mutex<Option<WriterHandle>>,
    next_writer_id: AtomicU64,
}

/// Queue into one connection's writer task.
struct WriterHandle {
    id: u64,
    requests: mpsc::Sender<PendingEmit>,
}

struct PendingEmit {
    event: TelemetryEvent,
    reply: oneshot::Sender<Result<()>>,
}

impl SocketEmitter {
    pub fn new(config: ClientConfig) -> Self {
        let config = ClientConfig {
            client_id: config
                .client_id
                .or_else(|| Some(format!("emitter-{}", std::process::id()))),
            ..config
        };
        Self {
            config,
            writer: Mutex::new(None),
            next_writer_id: AtomicU64::new(1),
        }
    }

    /// Returns true if a connection is currently held.
    pub async fn is_connected(&self) -> bool {
        self.writer
            .lock()
            .await
            .as_ref()
            .is_some_and(|writer| !writer.requests.is_closed())
    }

    /// Returns the live writer's queue, connecting first when there is none.
    ///
    /// `failed` names a writer that just lost its connection and must not
    /// be handed out again. The flag is true when the writer already existed.
    async fn writer(
        &self,
        failed: Option<u64>,
    ) -> Result<(u64, mpsc::Sender<PendingEmit>, bool)> {
        let mut slot = self.writer.lock().await;
        if let Some(writer) = slot.as_ref() {
            if Some(writer.id) != failed && !writer.requests.is_closed() {
                return Ok((writer.id, writer.requests.clone(), true));
            }
        }
        *slot = None;

        let connection = Connection::open(&self.config).await?;
        debug!(socket = %self.config.socket_path.display(), "Emitter connected");

        let (requests, receiver) = mpsc::channel(self.config.max_pending_emits.max(1));
        let id = self.next_writer_id.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(run_writer(connection, receiver, self.config.request_timeout));

        *slot = Some(WriterHandle {
            id,
            requests: requests.clone(),
        });
        Ok((id, requests, false))
    }

    /// Queues one emit without waiting and then waits for its ack.
    async fn emit_via(
        &self,
        requests: &mpsc::Sender<PendingEmit>,
        event: TelemetryEvent,
    ) -> Result<()> {
        let (reply, response) = oneshot::channel();
        requests
            .try_send(PendingEmit { event, reply })
            .map_err(|e| match e {
                TrySendError::Full(_) => ClientError::QueueFull,
                TrySendError::Closed(_) => ClientError::Disconnected,
            })?;

        match timeout(self.config.request_timeout, response).await {
            Ok(Ok(result)) => result,
            // Writer went away without answering
            Ok(Err(_)) => Err(ClientError::Disconnected),
            Err(_) => Err(ClientError::Timeout),
        }
    }
}

#[async_trait]
impl Emitter for SocketEmitter {
    async fn emit(&self, event: TelemetryEvent) -> Result<()> {
        let (id, requests, reused) = self.writer(None).await?;

        match self.emit_via(&requests, event.clone()).await {
            // The daemon may have closed an idle connection; try once more
            Err(e) if reused && matches!(e, ClientError::Disconnected | ClientError::Io(_)) => {
                debug!(error = %e, "Emitter connection lost, reconnecting");
                let (_, requests, _) = self.writer(Some(id)).await?;
                self.emit_via(&requests, event).await
            }
            result => result,
        }
    }
}

/// Sleeps until `deadline`, or forever without one.
async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Owns one daemon connection: writes queued emits and answers each caller
/// with the ack that comes back for it.
///
/// Exits when the connection fails, when the oldest unacknowledged emit is
/// older than `ack_timeout`, or when the emitter is dropped. Emits still
/// waiting are answered with [`ClientError::Timeout`] after an ack timeout
/// and with [`ClientError::Disconnected`] otherwise.
async fn run_writer(
    mut connection: Connection,
    mut requests: mpsc::Receiver<PendingEmit>,
    ack_timeout: Duration,
) {
    let mut in_flight: VecDeque<(Instant, oneshot::Sender<Result<()>>)> = VecDeque::new();
    let mut expired = false;

    loop {
        let deadline = in_flight.front().map(|(sent, _)| *sent + ack_timeout);

        tokio::select! {
            next = requests.recv() => {
                let Some(pending) = next else {
                    debug!("Emitter dropped, closing daemon connection");
                    break;
                };
                let frame = ClientMessage::emit(pending.event);
                match timeout(ack_timeout, connection.send(&frame)).await {
                    Ok(Ok(())) => in_flight.push_back((Instant::now(), pending.reply)),
                    Ok(Err(e)) => {
                        debug!(error = %e, "Emit write failed");
                        let _ = pending.reply.send(Err(e));
                        break;
                    }
                    // Daemon is not reading; the frame may be half written
                    Err(_) => {
                        warn!(timeout = ?ack_timeout, "Daemon stopped reading emits");
                        let _ = pending.reply.send(Err(ClientError::Timeout));
                        break;
                    }
                }
            }

            response = connection.recv() => {
                let result = match response {
                    Ok(DaemonMessage::EmitAck) => Ok(()),
                    Ok(DaemonMessage::Error { message, .. }) => Err(ClientError::Daemon(message)),
                    Ok(other) => {
                        warn!(message = ?other, "Unexpected daemon frame on emit connection");
                        break;
                    }
                    Err(e) => {
                        debug!(error = %e, "Emit connection closed");
                        break;
                    }
                };
                match in_flight.pop_front() {
                    // The caller may have given up already
                    Some((_, reply)) => {
                        let _ = reply.send(result);
                    }
                    None => {
                        warn!("Daemon answered an emit that was never sent");
                        break;
                    }
                }
            }

            _ = expire(deadline) => {
                warn!(
                    timeout = ?ack_timeout,
                    pending = in_flight.len(),
                    "Daemon stopped acknowledging emits"
                );
                expired = true;
                break;
            }
        }
    }

    requests.close();
    for (_, reply) in in_flight.drain(..) {
        let error = if expired {
            ClientError::Timeout
        } else {
            ClientError::Disconnected
        };
        let _ = reply.send(Err(error));
    }
    while let Ok(pending) = requests.try_recv() {
        let _ = pending.reply.send(Err(ClientError::Disconnected));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use prost::Message;

    #[derive(Default)]
    struct CountingEmitter {
        events: AtomicUsize,
        bytes: AtomicUsize,
    }

    #[async_trait]
    impl Emitter for CountingEmitter {
        async fn emit(&self, event: TelemetryEvent) -> Result<()> {
            self.events.fetch_add(1, Ordering::SeqCst);
            self.bytes.fetch_add(event.len(), Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Clone, PartialEq, prost::Message)]
    struct Sample {
        #[prost(string, tag = "1")]
        name: String,
    }

    #[tokio::test]
    async fn test_emit_message_encodes_payload() {
        let emitter = CountingEmitter::default();
        let message = Sample {
            name: "abc".to_string(),
        };

        emit_message(&emitter, SignalKind::Trace, &message)
            .await
            .unwrap();

        assert_eq!(emitter.events.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.bytes.load(Ordering::SeqCst), message.encoded_len());
    }

    #[tokio::test]
    async fn test_noop_emitter_is_disabled() {
        assert!(!NoopEmitter.is_enabled());
        emit_message(&NoopEmitter, SignalKind::Log, &Sample::default())
            .await
            .unwrap();
    }

    #[test]
    fn test_socket_emitter_names_itself() {
        let emitter = SocketEmitter::new(ClientConfig::default());
        let expected = format!("emitter-{}", std::process::id());
        assert_eq!(emitter.config.client_id.as_deref(), Some(expected.as_str()));
    }
}
