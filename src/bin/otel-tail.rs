//! otel-tail - follow the telemetry passing through otel-relay
//!
//! Connects to the relay daemon and prints one line per observed export
//! batch, or a statistics snapshot with `--stats`.
//!
//! # Usage
//!
//! ```text
//! otel-tail            # follow live batches
//! otel-tail --stats    # print daemon counters and exit
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

use relay_client::{ClientConfig, StreamClient};
use relay_core::TelemetryEvent;
use relay_protocol::{StatsSnapshot, DEFAULT_SOCKET_PATH};
use relayd::lifecycle::wait_for_shutdown_signal;

/// Follow telemetry observed by otel-relay
#[derive(Parser, Debug)]
#[command(name = "otel-tail", version, about)]
struct Args {
    /// Relay daemon socket
    #[arg(short = 's', long, env = "OTEL_RELAY_SOCKET", default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    /// Print daemon statistics and exit
    #[arg(long)]
    stats: bool,
}

fn describe(event: &TelemetryEvent) -> String {
    match relay_proxy::summarize(event) {
        Ok(summary) => summary.to_string(),
        Err(e) => format!(
            "{:<6} {} bytes (undecodable: {e})",
            event.kind.label(),
            event.len()
        ),
    }
}

fn print_stats(stats: &StatsSnapshot) {
    println!("uptime:           {}s", stats.uptime_seconds);
    if let Some(started_at) = stats.started_at {
        println!("started:          {}", started_at.to_rfc3339());
    }
    println!("traces observed:  {}", stats.traces_observed);
    println!("metrics observed: {}", stats.metrics_observed);
    println!("logs observed:    {}", stats.logs_observed);
    println!("bytes observed:   {}", stats.bytes_observed);
    println!("active readers:   {}", stats.active_readers);
    println!("active writers:   {}", stats.active_writers);
    println!("intake dropped:   {}", stats.intake_dropped);
    println!("consumer dropped: {}", stats.consumer_dropped);
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("otel_tail=warn".parse()?)
                .add_directive("relay_client=warn".parse()?),
        )
        .init();

    let client = StreamClient::connect(ClientConfig::new(&args.socket))
        .await
        .with_context(|| format!("No relay daemon on {}", args.socket.display()))?;

    if args.stats {
        let stats = client.stats().await.context("Failed to fetch stats")?;
        print_stats(&stats);
        return Ok(());
    }

    let mut stream = client.stream().await.context("Failed to start stream")?;
    debug!(socket = %args.socket.display(), "Following");

    let shutdown = wait_for_shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let next = tokio::select! {
            signal = &mut shutdown => {
                if let Err(e) = signal {
                    error!(error = %e, "Error waiting for shutdown signal");
                }
                break;
            }
            next = stream.next() => next.context("Stream failed")?,
        };

        match next {
            Some(event) => println!("{}", describe(&event)),
            None => {
                eprintln!("Relay daemon closed the stream");
                return Ok(());
            }
        }
    }

    let _ = stream.close().await;
    Ok(())
}
