//! Telemetry for the renter engine
//!
//! Installs the global `tracing` subscriber and provides span helpers that
//! carry the engine's common fields (component, host, chunk).

pub mod logging;

pub use logging::{init_logging, LogConfig, LogContext, LogFormat, LogLevel, LogOutput};

use thiserror::Error;

/// Telemetry error types
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// I/O error while opening a log file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid logging configuration
    #[error("logging error: {0}")]
    Logging(String),

    /// Subscriber installation failed
    #[error("initialization error: {0}")]
    Init(String),
}

/// Result type for telemetry operations
pub type Result<T> = std::result::Result<T, TelemetryError>;
