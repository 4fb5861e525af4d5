//! otel-relay daemon - the broadcast hub between proxies and viewers
//!
//! This crate provides:
//! - `server` - Unix socket broadcast server with bounded, lossy fan-out
//! - `lifecycle` - Probe, spawn-on-demand and run-until-signalled helpers
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                     relay daemon                          │
//! ├───────────────────────────────────────────────────────────┤
//! │                                                           │
//! │  ┌─────────────────┐  emit  ┌──────────────────────────┐  │
//! │  │ConnectionHandler│───────▶│ intake queue (bounded)   │  │
//! │  │  (per client)   │        └────────────┬─────────────┘  │
//! │  └────────▲────────┘                     │ distribution   │
//! │           │ event frames                 ▼                │
//! │           └──────────────── per-viewer queues (bounded)   │
//! │                                                           │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! Production code here never panics: fallible operations return `Result`
//! and channel closure is treated as shutdown.

pub mod lifecycle;
pub mod server;

pub use lifecycle::{ensure_server_running, run_daemon, EnsureOutcome, LifecycleError};
pub use server::{
    BroadcastServer, Consumer, ServerConfig, ServerError, ServerPhase, DEFAULT_SOCKET_PATH,
};
