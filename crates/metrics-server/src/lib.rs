//! Metrics and probe endpoints
//!
//! Serves `/healthz`, `/readyz` and `/metrics`, plus optional cache-dump
//! routes exposing the in-memory allocators and lease table as JSON.

pub mod dump;
pub mod error;
pub mod metrics;
pub mod server;

pub use dump::{DebugDumps, Dumper};
pub use error::MetricsError;
pub use metrics::Metrics;
pub use server::{AppState, router, serve, shutdown_signal};
