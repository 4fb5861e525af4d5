//! otel-relay client - talking to the relay daemon
//!
//! - [`Emitter`] implementations the proxy uses to publish observed batches:
//!   [`SocketEmitter`] for a live daemon, [`NoopEmitter`] when fan-out is off
//! - [`StreamClient`] for viewers: live event streams and stats snapshots

mod config;
mod connection;
pub mod emitter;
pub mod error;
pub mod stream;

pub use config::ClientConfig;
pub use emitter::{emit_message, Emitter, NoopEmitter, SocketEmitter};
pub use error::{ClientError, Result};
pub use stream::{EventStream, StreamClient};
