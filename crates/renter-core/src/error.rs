//! Error taxonomy for the renter engine
//!
//! Per-piece failures (`HostFault`, `WorkerKilled`) are absorbed by the
//! orchestrators and turned into chunk state; only chunk-level outcomes
//! (`InsufficientRedundancy`, `Unrecoverable`, `Cancelled`) reach callers.

use thiserror::Error;

use crate::config::ConfigError;
use crate::host::HostKey;

/// Result type for renter operations
pub type Result<T> = std::result::Result<T, Error>;

/// Renter engine errors
#[derive(Debug, Error)]
pub enum Error {
    /// A single host operation failed
    #[error("host {host} fault: {message}")]
    HostFault {
        /// Host that failed
        host: HostKey,
        /// Failure reported by the protocol layer
        message: String,
    },

    /// The worker was torn down before or while running the job
    #[error("worker for host {0} was killed")]
    WorkerKilled(HostKey),

    /// No worker exists for the host
    #[error("no worker for host {0}")]
    WorkerNotFound(HostKey),

    /// Fewer than `k` pieces could be fetched or stored
    #[error("insufficient redundancy: need {needed} pieces, reached {available}")]
    InsufficientRedundancy {
        /// Pieces required (k)
        needed: usize,
        /// Pieces obtained or still obtainable
        available: usize,
    },

    /// Chunk is below 1x redundancy and has no local source
    #[error("chunk {0} is unrecoverable")]
    Unrecoverable(String),

    /// The caller gave up on the request
    #[error("request cancelled")]
    Cancelled,

    /// The renter is shutting down
    #[error("renter is shutting down")]
    Shutdown,

    /// Erasure coding failure
    #[error("erasure coding error: {0}")]
    Erasure(#[from] renter_ec::Error),

    /// Persistence layer failure
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Item not found in the persistence layer
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed request
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A background task panicked or was aborted
    #[error("task failed: {0}")]
    Task(String),
}

impl Error {
    /// The job failed because its worker was killed, not because of the host
    pub fn is_worker_killed(&self) -> bool {
        matches!(self, Error::WorkerKilled(_))
    }

    /// Local shutdown, never evidence against the chunk or host
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Error::Shutdown | Error::Cancelled)
    }

    /// Failure that a standby worker or a later repair cycle may overcome
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::HostFault { .. } | Error::WorkerKilled(_))
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Task(err.to_string())
    }
}
