//! otel-relay Core - Shared types for telemetry interception
//!
//! This crate provides the domain types shared between the proxy,
//! the broadcast daemon (relayd) and viewer clients.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod error;
pub mod event;
pub mod signal;

// Re-exports for convenience
pub use error::{DomainError, DomainResult};
pub use event::TelemetryEvent;
pub use signal::SignalKind;
