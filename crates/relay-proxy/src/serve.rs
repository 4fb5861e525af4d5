//! Start/stop/wait plumbing shared by both front ends.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::ProxyError;

/// How long `stop` lets in-flight requests finish
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

type Outcome = Option<Result<(), ProxyError>>;

/// Owns one serving loop: its cancellation, its task and its outcome.
pub(crate) struct ServeHandle {
    started: AtomicBool,
    cancel_token: CancellationToken,
    local_addr: OnceLock<SocketAddr>,
    task: Mutex<Option<JoinHandle<()>>>,
    outcome: watch::Sender<Outcome>,
}

impl ServeHandle {
    pub(crate) fn new() -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            started: AtomicBool::new(false),
            cancel_token: CancellationToken::new(),
            local_addr: OnceLock::new(),
            task: Mutex::new(None),
            outcome,
        }
    }

    /// Claims the single start. Fails on a second call.
    pub(crate) fn begin(&self) -> Result<(), ProxyError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ProxyError::AlreadyStarted);
        }
        Ok(())
    }

    /// Records a failed start so waiters see it.
    pub(crate) fn fail(&self, error: ProxyError) -> ProxyError {
        self.outcome.send_replace(Some(Err(error.clone())));
        error
    }

    /// Fires when `stop` is called.
    pub(crate) fn shutdown_signal(&self) -> impl Future<Output = ()> + Send + 'static {
        let token = self.cancel_token.clone();
        async move { token.cancelled().await }
    }

    /// Runs the serving loop in the background.
    pub(crate) fn spawn<F>(&self, local_addr: SocketAddr, serve: F)
    where
        F: Future<Output = Result<(), ProxyError>> + Send + 'static,
    {
        let _ = self.local_addr.set(local_addr);
        let outcome = self.outcome.clone();
        let handle = tokio::spawn(async move {
            let result = serve.await;
            outcome.send_replace(Some(result));
        });

        match self.task.lock() {
            Ok(mut task) => *task = Some(handle),
            Err(poisoned) => *poisoned.into_inner() = Some(handle),
        }
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Starts a graceful drain and waits for it, up to [`DRAIN_TIMEOUT`].
    /// The loop is aborted if it does not finish in time.
    pub(crate) async fn stop(&self) -> Result<(), ProxyError> {
        self.cancel_token.cancel();

        if !self.started.load(Ordering::Acquire) {
            return Ok(());
        }

        match timeout(DRAIN_TIMEOUT, self.wait_done()).await {
            Ok(_) => Ok(()),
            Err(_) => {
                let task = match self.task.lock() {
                    Ok(mut task) => task.take(),
                    Err(poisoned) => poisoned.into_inner().take(),
                };
                if let Some(task) = task {
                    task.abort();
                }
                warn!(timeout = ?DRAIN_TIMEOUT, "Proxy did not drain in time, closing");

                let error = ProxyError::DrainTimeout(DRAIN_TIMEOUT);
                self.outcome.send_if_modified(|outcome| {
                    if outcome.is_none() {
                        *outcome = Some(Err(error.clone()));
                        true
                    } else {
                        false
                    }
                });
                Err(error)
            }
        }
    }

    /// Waits until the serving loop has exited and returns how it ended.
    pub(crate) async fn err(&self) -> Result<(), ProxyError> {
        if !self.started.load(Ordering::Acquire) {
            return Err(ProxyError::NotStarted);
        }
        self.wait_done().await
    }

    async fn wait_done(&self) -> Result<(), ProxyError> {
        let mut receiver = self.outcome.subscribe();
        let outcome = receiver.wait_for(Option::is_some).await;
        match outcome {
            Ok(outcome) => (*outcome).clone().unwrap_or(Ok(())),
            // The sender lives in `self`, so this cannot happen while we run
            Err(_) => Ok(()),
        }
    }
}

/// Turns `:4317` into `0.0.0.0:4317`; other addresses pass through.
pub(crate) fn normalize_listen_addr(address: &str) -> String {
    if address.starts_with(':') {
        format!("0.0.0.0{address}")
    } else {
        address.to_string()
    }
}
