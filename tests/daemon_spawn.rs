//! Spawn-on-demand against the real `otel-relay` binary.

use std::ffi::OsStr;
use std::path::Path;
use std::time::{Duration, Instant};

use relay_client::{ClientConfig, StreamClient};
use relayd::lifecycle::{
    ensure_server_running_with, DaemonCommand, DAEMON_FLAG, MAX_POLL_ATTEMPTS, POLL_INTERVAL,
};
use relayd::EnsureOutcome;

/// Readiness polling budget plus room for process start on a loaded machine
fn spawn_budget() -> Duration {
    POLL_INTERVAL * MAX_POLL_ATTEMPTS + Duration::from_millis(500)
}

fn daemon_command(socket_path: &Path) -> DaemonCommand {
    DaemonCommand::new(
        env!("CARGO_BIN_EXE_otel-relay"),
        [OsStr::new(DAEMON_FLAG), socket_path.as_os_str()],
    )
}

fn terminate(pid: u32) {
    let result = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    assert_eq!(result, 0, "failed to signal daemon {pid}");
}

async fn wait_for_removal(path: &Path) -> bool {
    for _ in 0..200 {
        if !path.exists() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_daemon_is_spawned_once_and_stops_on_sigterm() {
    let temp_dir = tempfile::tempdir().unwrap();
    let socket_path = temp_dir.path().join("relay.sock");

    let started = Instant::now();
    let outcome = ensure_server_running_with(&socket_path, daemon_command(&socket_path))
        .await
        .unwrap();
    let elapsed = started.elapsed();
    assert!(
        elapsed < spawn_budget(),
        "spawning the daemon took {elapsed:?}"
    );
    let pid = match outcome {
        EnsureOutcome::Spawned { pid } => pid.unwrap(),
        other => panic!("expected a spawned daemon, got {other:?}"),
    };

    let started = Instant::now();
    let outcome = ensure_server_running_with(&socket_path, daemon_command(&socket_path))
        .await
        .unwrap();
    assert_eq!(outcome, EnsureOutcome::AlreadyRunning);
    assert!(started.elapsed() < POLL_INTERVAL * MAX_POLL_ATTEMPTS);

    let client = StreamClient::connect(ClientConfig::new(&socket_path))
        .await
        .unwrap();
    let stats = client.stats().await.unwrap();
    assert_eq!(stats.signals_observed(), 0);
    assert!(stats.started_at.is_some());

    terminate(pid);
    assert!(
        wait_for_removal(&socket_path).await,
        "daemon did not remove its socket after SIGTERM"
    );
}

#[tokio::test]
async fn test_second_daemon_on_a_live_socket_exits() {
    let temp_dir = tempfile::tempdir().unwrap();
    let socket_path = temp_dir.path().join("relay.sock");

    let outcome = ensure_server_running_with(&socket_path, daemon_command(&socket_path))
        .await
        .unwrap();
    let EnsureOutcome::Spawned { pid: Some(pid) } = outcome else {
        panic!("expected a spawned daemon, got {outcome:?}");
    };

    // Started directly, skipping the liveness check
    let status = tokio::process::Command::new(env!("CARGO_BIN_EXE_otel-relay"))
        .arg(DAEMON_FLAG)
        .arg(&socket_path)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await
        .unwrap();
    assert!(!status.success());
    assert!(socket_path.exists());

    terminate(pid);
    assert!(wait_for_removal(&socket_path).await);
}
