//! Daemon lifecycle: liveness probing, spawn-on-demand and the daemon's
//! own main loop.
//!
//! At most one daemon serves a socket path. A proxy that finds nothing
//! listening re-executes its own binary with `--daemon <path>` and waits
//! for the socket to come up.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::net::UnixStream;
use tokio::process::Command;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::server::{BroadcastServer, ServerError};

/// Flag that switches the binary into daemon mode
pub const DAEMON_FLAG: &str = "--daemon";

/// How long a liveness probe may take
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(100);

/// Delay between readiness probes after spawning
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Readiness probes before giving up (about half a second in total)
pub const MAX_POLL_ATTEMPTS: u32 = 50;

/// What [`ensure_server_running`] found or did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// Something was already accepting connections on the socket
    AlreadyRunning,
    /// A daemon was spawned and is now accepting connections
    Spawned { pid: Option<u32> },
}

/// Program and arguments used to start a daemon.
#[derive(Debug, Clone)]
pub struct DaemonCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl DaemonCommand {
    pub fn new(program: impl Into<PathBuf>, args: impl IntoIterator<Item = impl Into<OsString>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Re-executes the running binary as `<exe> --daemon <socket_path>`.
    pub fn current_exe(socket_path: &Path) -> io::Result<Self> {
        let program = std::env::current_exe()?;
        Ok(Self {
            program,
            args: vec![OsString::from(DAEMON_FLAG), socket_path.as_os_str().to_owned()],
        })
    }
}

/// Errors from probing, spawning or running the daemon.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Failed to spawn daemon {program}: {error}")]
    Spawn { program: PathBuf, error: String },

    #[error("Daemon exited before accepting connections ({status})")]
    DaemonExited { status: String },

    /// Something holds the socket but did not answer the liveness check.
    #[error("Daemon on {path} is not answering: {error}")]
    Unresponsive { path: PathBuf, error: String },

    #[error("Daemon did not accept connections on {path} within {waited:?}")]
    StartupTimeout { path: PathBuf, waited: Duration },

    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Checks whether something accepts connections on `path`.
///
/// The connection is closed straight away. A missing socket file or a
/// refused connection means no daemon is listening.
pub async fn probe(path: &Path) -> io::Result<()> {
    match timeout(PROBE_TIMEOUT, UnixStream::connect(path)).await {
        Ok(Ok(_stream)) => Ok(()),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("probe of {} timed out", path.display()),
        )),
    }
}

/// True for the connect failures that simply mean "nothing is listening".
///
/// Anything else (a full accept queue, a timeout) may be a live daemon.
pub(crate) fn is_not_listening(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
    )
}

/// Makes sure a daemon is serving `socket_path`, spawning this binary in
/// daemon mode if needed.
pub async fn ensure_server_running(
    socket_path: impl AsRef<Path>,
) -> Result<EnsureOutcome, LifecycleError> {
    let socket_path = socket_path.as_ref();
    let command = DaemonCommand::current_exe(socket_path)?;
    ensure_server_running_with(socket_path, command).await
}

/// Like [`ensure_server_running`], with an explicit daemon command.
pub async fn ensure_server_running_with(
    socket_path: impl AsRef<Path>,
    command: DaemonCommand,
) -> Result<EnsureOutcome, LifecycleError> {
    let socket_path = socket_path.as_ref();

    match probe(socket_path).await {
        Ok(()) => {
            debug!(socket = %socket_path.display(), "Daemon already running");
            return Ok(EnsureOutcome::AlreadyRunning);
        }
        Err(e) if is_not_listening(&e) => {
            info!(socket = %socket_path.display(), "Daemon not running, starting it");
        }
        Err(e) => {
            warn!(
                socket = %socket_path.display(),
                error = %e,
                "Daemon socket not answering, not spawning"
            );
            return Err(LifecycleError::Unresponsive {
                path: socket_path.to_path_buf(),
                error: e.to_string(),
            });
        }
    }

    debug!(program = %command.program.display(), "Spawning daemon");

    let mut child = Command::new(&command.program)
        .args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .process_group(0)
        .spawn()
        .map_err(|e| LifecycleError::Spawn {
            program: command.program.clone(),
            error: e.to_string(),
        })?;
    let pid = child.id();

    for attempt in 1..=MAX_POLL_ATTEMPTS {
        sleep(POLL_INTERVAL).await;

        // A racing daemon that won the bind counts as success too
        if probe(socket_path).await.is_ok() {
            info!(attempts = attempt, pid = ?pid, "Daemon started successfully");
            return Ok(EnsureOutcome::Spawned { pid });
        }

        if let Some(status) = child.try_wait()? {
            return Err(LifecycleError::DaemonExited {
                status: status.to_string(),
            });
        }
    }

    if let Err(e) = child.start_kill() {
        debug!(error = %e, "Failed to kill unresponsive daemon");
    }

    Err(LifecycleError::StartupTimeout {
        path: socket_path.to_path_buf(),
        waited: POLL_INTERVAL * MAX_POLL_ATTEMPTS,
    })
}

/// Daemon main: serves `socket_path` until SIGINT or SIGTERM.
pub async fn run_daemon(socket_path: impl Into<PathBuf>) -> Result<(), LifecycleError> {
    let server = BroadcastServer::new(socket_path);

    if let Err(e) = server.start().await {
        let _ = server.close().await;
        return Err(e.into());
    }

    info!(
        socket = %server.socket_path().display(),
        pid = std::process::id(),
        "Relay daemon running"
    );

    wait_for_shutdown_signal().await?;

    info!("Shutdown signal received");
    server.close().await?;
    Ok(())
}

/// Waits for a shutdown signal (SIGTERM or SIGINT).
pub async fn wait_for_shutdown_signal() -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_exe_command_uses_daemon_flag() {
        let command = DaemonCommand::current_exe(Path::new("/tmp/x.sock")).unwrap();
        assert_eq!(
            command.args,
            vec![OsString::from("--daemon"), OsString::from("/tmp/x.sock")]
        );
    }

    #[tokio::test]
    async fn test_probe_missing_socket_is_not_listening() {
        let dir = tempfile::tempdir().unwrap();
        let err = probe(&dir.path().join("absent.sock")).await.unwrap_err();
        assert!(is_not_listening(&err));
    }

    #[tokio::test]
    async fn test_probe_stale_socket_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());

        let err = probe(&path).await.unwrap_err();
        assert!(is_not_listening(&err));
    }

    #[test]
    fn test_busy_or_slow_socket_counts_as_listening() {
        for kind in [io::ErrorKind::WouldBlock, io::ErrorKind::TimedOut] {
            assert!(!is_not_listening(&io::Error::from(kind)));
        }
    }
}
