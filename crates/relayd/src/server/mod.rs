//! Unix socket broadcast server.
//!
//! The server:
//! - Accepts producer and viewer connections on a Unix socket
//! - Feeds every emitted event into one bounded intake queue
//! - Fans each queued event out to every registered viewer queue
//! - Never blocks a producer on a slow or absent viewer
//!
//! # Architecture
//!
//! ```text
//!  producers (Emit)            viewers (Stream)
//!        │                          ▲
//!        ▼                          │
//! ┌──────────────┐  intake  ┌───────┴──────┐
//! │ Connection-  │─────────▶│ distribution │──▶ consumer queue (one per viewer)
//! │ Handler      │  (1000)  │     loop     │        (100 each)
//! └──────────────┘          └──────────────┘
//! ```
//!
//! A full intake queue drops the event and still acknowledges the emit.
//! A full viewer queue drops the event for that viewer only.

mod connection;
mod stats;

pub use connection::{ConnectionError, ConnectionHandler};
pub use stats::{DaemonStats, WriterGuard};

use std::collections::HashMap;
use std::fs::Permissions;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::UnixListener;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use relay_core::TelemetryEvent;
pub use relay_protocol::DEFAULT_SOCKET_PATH;
use relay_protocol::StatsSnapshot;

use crate::lifecycle;

/// Capacity of the central intake queue
pub const DEFAULT_INTAKE_CAPACITY: usize = 1000;

/// Capacity of each viewer's queue
pub const DEFAULT_CONSUMER_CAPACITY: usize = 100;

/// Largest accepted client frame (16 MiB). Emits carry whole export batches.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// How long `close` waits for the accept and distribution tasks
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Sender side of one viewer's queue
type ConsumerQueue = mpsc::Sender<Arc<TelemetryEvent>>;

/// Registered viewers keyed by consumer id
type ConsumersMap = RwLock<HashMap<u64, ConsumerQueue>>;

/// Tunables for a [`BroadcastServer`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub socket_path: PathBuf,
    pub intake_capacity: usize,
    pub consumer_capacity: usize,
    /// Producer connections idle longer than this are closed
    pub idle_timeout: Duration,
    pub max_frame_size: usize,
}

impl ServerConfig {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            ..Self::default()
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            intake_capacity: DEFAULT_INTAKE_CAPACITY,
            consumer_capacity: DEFAULT_CONSUMER_CAPACITY,
            idle_timeout: Duration::from_secs(300),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Where a server is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerPhase {
    Created = 0,
    Listening = 1,
    Serving = 2,
    Draining = 3,
    Closed = 4,
}

impl ServerPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Listening,
            2 => Self::Serving,
            3 => Self::Draining,
            _ => Self::Closed,
        }
    }
}

/// State shared by the accept loop, the distribution loop and every
/// connection handler.
pub(crate) struct Broadcaster {
    config: ServerConfig,
    stats: DaemonStats,
    intake: mpsc::Sender<Arc<TelemetryEvent>>,
    consumers: ConsumersMap,
    next_consumer_id: AtomicU64,
    cancel_token: CancellationToken,
}

impl Broadcaster {
    /// Offers an event to the intake queue without waiting.
    ///
    /// Returns false when the event was dropped because the queue was full
    /// or the server is shutting down. Observed counters only move for
    /// events that were queued.
    pub(crate) fn submit(&self, event: TelemetryEvent) -> bool {
        let _writer = self.stats.writer_guard();

        match self.intake.try_reserve() {
            Ok(permit) => {
                self.stats.record_accepted(&event);
                permit.send(Arc::new(event));
                true
            }
            Err(TrySendError::Full(())) => {
                self.stats.record_intake_drop();
                trace!(kind = %event.kind, "Intake queue full, dropping event");
                false
            }
            Err(TrySendError::Closed(())) => {
                self.stats.record_intake_drop();
                trace!(kind = %event.kind, "Intake queue closed, dropping event");
                false
            }
        }
    }

    /// Registers a new viewer queue.
    pub(crate) async fn register(&self) -> Consumer {
        let (tx, rx) = mpsc::channel(self.config.consumer_capacity.max(1));
        let id = self.next_consumer_id.fetch_add(1, Ordering::Relaxed);

        let mut consumers = self.consumers.write().await;
        consumers.insert(id, tx);
        self.stats.set_active_readers(consumers.len());
        debug!(consumer = id, readers = consumers.len(), "Registered consumer");

        Consumer { id, receiver: rx }
    }

    /// Removes a viewer queue. Removing an unknown id is a no-op.
    pub(crate) async fn unregister(&self, id: u64) {
        let mut consumers = self.consumers.write().await;
        if consumers.remove(&id).is_some() {
            debug!(consumer = id, readers = consumers.len(), "Removed consumer");
        }
        self.stats.set_active_readers(consumers.len());
    }

    pub(crate) fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn idle_timeout(&self) -> Duration {
        self.config.idle_timeout
    }

    pub(crate) fn max_frame_size(&self) -> usize {
        self.config.max_frame_size
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    /// Copies one event into every viewer queue that has room.
    async fn fan_out(&self, event: Arc<TelemetryEvent>) {
        let consumers = self.consumers.read().await;

        for (id, queue) in consumers.iter() {
            match queue.try_send(Arc::clone(&event)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.stats.record_consumer_drop();
                    trace!(consumer = id, "Consumer queue full, dropping event");
                }
                Err(TrySendError::Closed(_)) => {
                    // Viewer is leaving; its handler unregisters it
                    trace!(consumer = id, "Consumer queue closed");
                }
            }
        }
    }
}

/// A registered viewer's end of the fan-out.
///
/// Only events accepted after registration are delivered. Dropping the
/// consumer does not unregister it; call [`BroadcastServer::unregister`].
#[derive(Debug)]
pub struct Consumer {
    id: u64,
    receiver: mpsc::Receiver<Arc<TelemetryEvent>>,
}

impl Consumer {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Waits for the next event. Returns `None` once the server has closed.
    pub async fn recv(&mut self) -> Option<Arc<TelemetryEvent>> {
        self.receiver.recv().await
    }

    /// Takes the next queued event without waiting.
    pub fn try_recv(&mut self) -> Option<Arc<TelemetryEvent>> {
        self.receiver.try_recv().ok()
    }
}

/// Singleton broadcast server behind the relay socket.
pub struct BroadcastServer {
    shared: Arc<Broadcaster>,

    /// Receiving end of the intake queue until `start` hands it to the
    /// distribution loop
    intake_rx: Mutex<Option<mpsc::Receiver<Arc<TelemetryEvent>>>>,

    phase: AtomicU8,
    closing: AtomicBool,

    /// Set once this server has bound the socket file
    bound: AtomicBool,

    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BroadcastServer {
    /// Creates a server for `socket_path` with default capacities.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self::with_config(ServerConfig::new(socket_path))
    }

    pub fn with_config(config: ServerConfig) -> Self {
        let (intake, intake_rx) = mpsc::channel(config.intake_capacity.max(1));

        Self {
            shared: Arc::new(Broadcaster {
                config,
                stats: DaemonStats::new(),
                intake,
                consumers: RwLock::new(HashMap::new()),
                next_consumer_id: AtomicU64::new(1),
                cancel_token: CancellationToken::new(),
            }),
            intake_rx: Mutex::new(Some(intake_rx)),
            phase: AtomicU8::new(ServerPhase::Created as u8),
            closing: AtomicBool::new(false),
            bound: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Returns the socket path.
    pub fn socket_path(&self) -> &Path {
        &self.shared.config.socket_path
    }

    pub fn phase(&self) -> ServerPhase {
        ServerPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: ServerPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// Binds the socket and starts serving.
    ///
    /// A stale socket file left by a dead daemon (missing listener,
    /// connection refused) is removed first. Any other socket is left alone
    /// and reported as [`ServerError::AddressInUse`].
    pub async fn start(&self) -> Result<(), ServerError> {
        let phase = self.phase();
        if phase != ServerPhase::Created {
            return Err(ServerError::InvalidPhase(phase));
        }

        let path = self.shared.config.socket_path.clone();
        let setup_error = |e: std::io::Error| ServerError::SocketSetup {
            path: path.clone(),
            error: e.to_string(),
        };

        if path.exists() {
            match lifecycle::probe(&path).await {
                Err(e) if lifecycle::is_not_listening(&e) => {
                    debug!(socket = %path.display(), "Removing stale socket file");
                    std::fs::remove_file(&path).map_err(setup_error)?;
                }
                Ok(()) => return Err(ServerError::AddressInUse { path }),
                // Busy or slow, but someone is there
                Err(e) => {
                    warn!(socket = %path.display(), error = %e, "Socket in use but not answering");
                    return Err(ServerError::AddressInUse { path });
                }
            }
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(setup_error)?;
            }
        }

        let listener = UnixListener::bind(&path).map_err(setup_error)?;
        self.bound.store(true, Ordering::Release);
        std::fs::set_permissions(&path, Permissions::from_mode(0o600)).map_err(setup_error)?;

        self.set_phase(ServerPhase::Listening);
        self.shared.stats.mark_started();

        let intake_rx = match self.intake_rx.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(intake_rx) = intake_rx else {
            return Err(ServerError::InvalidPhase(self.phase()));
        };

        let distribution = tokio::spawn(run_distribution(Arc::clone(&self.shared), intake_rx));
        let accept = tokio::spawn(run_accept_loop(Arc::clone(&self.shared), listener));
        self.track(distribution);
        self.track(accept);

        self.set_phase(ServerPhase::Serving);
        info!(socket = %path.display(), "Broadcast server listening");
        Ok(())
    }

    fn track(&self, handle: JoinHandle<()>) {
        match self.tasks.lock() {
            Ok(mut tasks) => tasks.push(handle),
            Err(poisoned) => poisoned.into_inner().push(handle),
        }
    }

    /// Stops accepting connections, drops every viewer queue and removes
    /// the socket file. Calling it again is a no-op.
    pub async fn close(&self) -> Result<(), ServerError> {
        if self.closing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.set_phase(ServerPhase::Draining);
        self.shared.cancel_token.cancel();

        // A server that never started still owns the intake receiver
        let unused_intake = match self.intake_rx.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(unused_intake);

        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for task in tasks {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await.is_err() {
                warn!("Server task did not stop in time");
            }
        }

        {
            let mut consumers = self.shared.consumers.write().await;
            consumers.clear();
            self.shared.stats.set_active_readers(0);
        }

        let mut result = Ok(());
        let path = &self.shared.config.socket_path;
        if self.bound.load(Ordering::Acquire) && path.exists() {
            if let Err(e) = std::fs::remove_file(path) {
                warn!(socket = %path.display(), error = %e, "Failed to remove socket file");
                result = Err(ServerError::SocketSetup {
                    path: path.clone(),
                    error: e.to_string(),
                });
            }
        }

        self.set_phase(ServerPhase::Closed);
        info!("Broadcast server closed");
        result
    }

    /// Emits an event in-process, exactly as a producer connection would.
    ///
    /// Returns false when the event was dropped.
    pub fn emit(&self, event: TelemetryEvent) -> bool {
        self.shared.submit(event)
    }

    /// Registers an in-process viewer.
    pub async fn register(&self) -> Consumer {
        self.shared.register().await
    }

    pub async fn unregister(&self, consumer: &Consumer) {
        self.shared.unregister(consumer.id).await;
    }

    /// Returns the number of registered viewers.
    pub async fn consumer_count(&self) -> usize {
        self.shared.consumers.read().await.len()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats()
    }
}

impl Drop for BroadcastServer {
    fn drop(&mut self) {
        self.shared.cancel_token.cancel();
    }
}

/// Accepts connections until cancelled.
async fn run_accept_loop(shared: Arc<Broadcaster>, listener: UnixListener) {
    let mut connection_counter: u64 = 0;

    loop {
        tokio::select! {
            _ = shared.cancel_token.cancelled() => {
                debug!("Accept loop shutting down");
                break;
            }

            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        connection_counter += 1;
                        let (reader, writer) = stream.into_split();
                        let handler = ConnectionHandler::new(
                            reader,
                            writer,
                            Arc::clone(&shared),
                            connection_counter,
                        );
                        tokio::spawn(handler.run());
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                }
            }
        }
    }
}

/// Moves events from the intake queue to every viewer queue, in order.
async fn run_distribution(shared: Arc<Broadcaster>, mut intake: mpsc::Receiver<Arc<TelemetryEvent>>) {
    loop {
        tokio::select! {
            biased;

            _ = shared.cancel_token.cancelled() => {
                debug!("Distribution loop shutting down");
                break;
            }

            next = intake.recv() => match next {
                Some(event) => shared.fan_out(event).await,
                None => break,
            },
        }
    }

    intake.close();
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to setup socket at {path}: {error}")]
    SocketSetup { path: PathBuf, error: String },

    #[error("Another server is already listening on {path}")]
    AddressInUse { path: PathBuf },

    #[error("Server cannot start from phase {0:?}")]
    InvalidPhase(ServerPhase),
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::SignalKind;

    fn trace_event(payload: &'static [u8]) -> TelemetryEvent {
        TelemetryEvent::new(SignalKind::Trace, payload)
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.socket_path, PathBuf::from("/tmp/otel-relay.sock"));
        assert_eq!(config.intake_capacity, 1000);
        assert_eq!(config.consumer_capacity, 100);
    }

    #[test]
    fn test_new_server_is_created() {
        let server = BroadcastServer::new("/tmp/unused.sock");
        assert_eq!(server.phase(), ServerPhase::Created);
        assert_eq!(server.socket_path(), Path::new("/tmp/unused.sock"));
    }

    #[tokio::test]
    async fn test_emit_succeeds_when_intake_is_full() {
        // Never started, so nothing drains the intake queue
        let server = BroadcastServer::with_config(ServerConfig {
            intake_capacity: 1,
            ..ServerConfig::new("/tmp/unused.sock")
        });

        assert!(server.emit(trace_event(b"first")));
        assert!(!server.emit(trace_event(b"second")));

        let stats = server.stats();
        assert_eq!(stats.traces_observed, 1);
        assert_eq!(stats.bytes_observed, 5);
        assert_eq!(stats.intake_dropped, 1);
        assert_eq!(stats.active_writers, 0);
    }

    #[tokio::test]
    async fn test_register_and_unregister_track_readers() {
        let server = BroadcastServer::new("/tmp/unused.sock");

        let first = server.register().await;
        let second = server.register().await;
        assert_ne!(first.id(), second.id());
        assert_eq!(server.stats().active_readers, 2);

        server.unregister(&first).await;
        server.unregister(&first).await;
        assert_eq!(server.stats().active_readers, 1);
        assert_eq!(server.consumer_count().await, 1);
    }

    #[tokio::test]
    async fn test_close_unstarted_server() {
        let server = BroadcastServer::new("/tmp/never-bound.sock");
        server.close().await.unwrap();
        server.close().await.unwrap();
        assert_eq!(server.phase(), ServerPhase::Closed);
        assert!(!server.emit(trace_event(b"late")));
    }
}
