//! Metrics server errors

use thiserror::Error;

/// Errors raised while registering metrics or serving HTTP
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Metric registration failed
    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    /// Listener or server IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
