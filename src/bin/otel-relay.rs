//! otel-relay - OTLP interception proxy with live fan-out
//!
//! Sits between instrumented applications and a collector. Every export
//! passing through is forwarded unchanged and, unless disabled, published
//! to a local relay daemon that viewers such as `otel-tail` subscribe to.
//! The daemon is started on demand by re-executing this binary.
//!
//! # Usage
//!
//! ```bash
//! # Inspect only, no collector behind the proxy
//! otel-relay
//!
//! # Relay to a local collector on the standard ports
//! otel-relay -u localhost:4317 -U http://localhost:4318
//!
//! # Log a summary of every batch, skip the daemon entirely
//! otel-relay --log --no-emit
//!
//! # gRPC front end only
//! otel-relay -l :4317 -u collector:4317
//! ```
//!
//! Without `--listen` or `--listen-http` both front ends start on their
//! default ports. Naming either one starts only the ones named.
//! SIGUSR2 toggles the per-batch summary log at runtime.

use std::path::PathBuf;
use std::process;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use relay_client::{ClientConfig, Emitter, NoopEmitter, SocketEmitter};
use relay_proxy::{
    GrpcProxy, GrpcProxyConfig, HttpProxy, HttpProxyConfig, Inspector, Proxy, ProxyError,
    ProxyMetrics,
};
use relayd::lifecycle::{ensure_server_running, run_daemon, wait_for_shutdown_signal};
use relayd::{EnsureOutcome, DEFAULT_SOCKET_PATH};

/// gRPC listen address when no front end is named
const DEFAULT_GRPC_LISTEN: &str = ":14317";

/// HTTP listen address when no front end is named
const DEFAULT_HTTP_LISTEN: &str = ":14318";

/// OTLP interception proxy with live fan-out to local viewers
#[derive(Parser, Debug)]
#[command(name = "otel-relay", version, about)]
struct Args {
    /// OTLP/gRPC listen address [default: :14317 unless --listen-http is given]
    #[arg(short = 'l', long)]
    listen: Option<String>,

    /// Upstream OTLP/gRPC collector (host:port)
    #[arg(short = 'u', long)]
    upstream: Option<String>,

    /// OTLP/HTTP listen address [default: :14318 unless --listen is given]
    #[arg(short = 'L', long)]
    listen_http: Option<String>,

    /// Upstream OTLP/HTTP collector base URL
    #[arg(short = 'U', long)]
    upstream_http: Option<String>,

    /// Relay daemon socket
    #[arg(short = 's', long, env = "OTEL_RELAY_SOCKET", default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    /// Do not publish observed telemetry to the relay daemon
    #[arg(long)]
    no_emit: bool,

    /// Log a one-line summary of every observed batch
    #[arg(long)]
    log: bool,

    /// Serve the relay daemon on this socket (used when self-spawning)
    #[arg(long, hide = true, value_name = "PATH")]
    daemon: Option<PathBuf>,
}

impl Args {
    /// gRPC and HTTP listen addresses of the front ends to run.
    fn front_ends(&self) -> (Option<String>, Option<String>) {
        match (&self.listen, &self.listen_http) {
            (None, None) => (
                Some(DEFAULT_GRPC_LISTEN.to_string()),
                Some(DEFAULT_HTTP_LISTEN.to_string()),
            ),
            (grpc, http) => (grpc.clone(), http.clone()),
        }
    }
}

fn init_tracing() -> Result<()> {
    // stdout is closed in daemon mode, so everything goes to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("otel_relay=info".parse()?)
                .add_directive("relayd=info".parse()?)
                .add_directive("relay_proxy=info".parse()?)
                .add_directive("relay_client=info".parse()?),
        )
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing()?;

    if let Some(socket_path) = args.daemon {
        info!(
            version = env!("CARGO_PKG_VERSION"),
            pid = process::id(),
            "Relay daemon starting"
        );
        run_daemon(&socket_path)
            .await
            .with_context(|| format!("Relay daemon on {} failed", socket_path.display()))?;
        info!("Relay daemon stopped");
        return Ok(());
    }

    run_proxy(args).await
}

async fn run_proxy(args: Args) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "otel-relay starting"
    );

    let emitter: Arc<dyn Emitter> = if args.no_emit {
        info!("Fan-out disabled");
        Arc::new(NoopEmitter)
    } else {
        let outcome = ensure_server_running(&args.socket)
            .await
            .context("Failed to start relay daemon")?;
        match outcome {
            EnsureOutcome::AlreadyRunning => {
                info!(socket = %args.socket.display(), "Using running relay daemon")
            }
            EnsureOutcome::Spawned { pid } => {
                info!(socket = %args.socket.display(), pid = ?pid, "Spawned relay daemon")
            }
        }
        Arc::new(SocketEmitter::new(ClientConfig::new(&args.socket)))
    };

    let metrics = Arc::new(ProxyMetrics::new());
    let inspector =
        Arc::new(Inspector::new(emitter, Arc::clone(&metrics)).with_signal_logging(args.log));

    let proxies = build_proxies(&args, &inspector)?;

    for (started, proxy) in proxies.iter().enumerate() {
        if let Err(e) = proxy.start().await {
            for running in &proxies[..started] {
                let _ = running.stop().await;
            }
            return Err(e).with_context(|| format!("Failed to start {} proxy", proxy.protocol()));
        }
    }

    let signal_logging = toggle_signal_logging_on_sigusr2(Arc::clone(&inspector));

    let mut exits: JoinSet<(&'static str, Result<(), ProxyError>)> = JoinSet::new();
    for proxy in &proxies {
        let proxy = Arc::clone(proxy);
        exits.spawn(async move { (proxy.protocol(), proxy.err().await) });
    }

    // Runs until a signal arrives or any serving loop dies
    let failure = tokio::select! {
        signal = wait_for_shutdown_signal() => {
            if let Err(e) = signal {
                error!(error = %e, "Error waiting for shutdown signal");
            }
            info!("Shutting down");
            None
        }
        Some(exit) = exits.join_next() => exit.ok(),
    };
    exits.abort_all();
    signal_logging.abort();

    for proxy in &proxies {
        if let Err(e) = proxy.stop().await {
            warn!(protocol = proxy.protocol(), error = %e, "Proxy did not stop cleanly");
        }
    }

    info!(
        exports = metrics.total_exports(),
        emitted = metrics.events_emitted.load(Ordering::Relaxed),
        emit_failures = metrics.emit_failures.load(Ordering::Relaxed),
        decode_failures = metrics.decode_failures.load(Ordering::Relaxed),
        "otel-relay stopped"
    );

    match failure {
        Some((protocol, Err(e))) => {
            Err(e).with_context(|| format!("{protocol} proxy stopped unexpectedly"))
        }
        Some((protocol, Ok(()))) => {
            warn!(protocol, "Proxy exited");
            Ok(())
        }
        None => Ok(()),
    }
}

fn build_proxies(args: &Args, inspector: &Arc<Inspector>) -> Result<Vec<Arc<dyn Proxy>>> {
    let (grpc_listen, http_listen) = args.front_ends();
    let mut proxies: Vec<Arc<dyn Proxy>> = Vec::new();

    match grpc_listen {
        Some(listen_addr) => proxies.push(Arc::new(GrpcProxy::new(
            GrpcProxyConfig {
                listen_addr,
                upstream: args.upstream.clone(),
            },
            Arc::clone(inspector),
        ))),
        None if args.upstream.is_some() => {
            warn!("--upstream given without a gRPC listener, ignoring it")
        }
        None => {}
    }

    match http_listen {
        Some(listen_addr) => proxies.push(Arc::new(HttpProxy::new(
            HttpProxyConfig {
                listen_addr,
                upstream: args.upstream_http.clone(),
                ..Default::default()
            },
            Arc::clone(inspector),
        ))),
        None if args.upstream_http.is_some() => {
            warn!("--upstream-http given without an HTTP listener, ignoring it")
        }
        None => {}
    }

    if proxies.is_empty() {
        bail!("No front end configured");
    }
    Ok(proxies)
}

/// Flips per-batch summary logging every time SIGUSR2 arrives.
fn toggle_signal_logging_on_sigusr2(inspector: Arc<Inspector>) -> tokio::task::JoinHandle<()> {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut sigusr2 = match signal(SignalKind::user_defined2()) {
            Ok(sigusr2) => sigusr2,
            Err(e) => {
                warn!(error = %e, "SIGUSR2 handler unavailable, signal logging fixed");
                return;
            }
        };
        while sigusr2.recv().await.is_some() {
            let enabled = inspector.toggle_signal_logging();
            info!(enabled, "Signal logging toggled");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("otel-relay").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_both_front_ends_by_default() {
        let args = parse(&[]);
        assert_eq!(
            args.front_ends(),
            (
                Some(DEFAULT_GRPC_LISTEN.to_string()),
                Some(DEFAULT_HTTP_LISTEN.to_string())
            )
        );
    }

    #[test]
    fn test_naming_one_front_end_runs_only_that_one() {
        let args = parse(&["--listen", "127.0.0.1:0"]);
        assert_eq!(args.front_ends(), (Some("127.0.0.1:0".to_string()), None));

        let args = parse(&["-L", "127.0.0.1:0"]);
        assert_eq!(args.front_ends(), (None, Some("127.0.0.1:0".to_string())));
    }

    #[tokio::test]
    async fn test_only_named_proxies_are_built() {
        let inspector = Arc::new(Inspector::new(
            Arc::new(NoopEmitter),
            Arc::new(ProxyMetrics::new()),
        ));

        let proxies = build_proxies(&parse(&["-L", "127.0.0.1:0"]), &inspector).unwrap();
        let protocols: Vec<_> = proxies.iter().map(|p| p.protocol()).collect();
        assert_eq!(protocols, vec!["http"]);

        let proxies = build_proxies(&parse(&[]), &inspector).unwrap();
        assert_eq!(proxies.len(), 2);
    }
}
