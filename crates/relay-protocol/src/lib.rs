//! otel-relay Protocol - Wire protocol for daemon communication
//!
//! This crate provides the message types exchanged over the daemon's
//! Unix socket: producers emit telemetry events, viewers stream them
//! back out and query daemon statistics.
//!
//! Frames are newline-delimited JSON. Every client frame carries the
//! protocol version; the daemon checks it during the `connect` handshake.

pub mod message;
pub mod stats;
pub mod version;

pub use message::{ClientMessage, DaemonMessage, MessageType};
pub use stats::StatsSnapshot;
pub use version::ProtocolVersion;

/// Socket path shared by the daemon and its clients unless overridden.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/otel-relay.sock";
