//! Error types for erasure coding operations

use thiserror::Error;

/// Result type for erasure coding operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while encoding or recovering a chunk
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid `(k, n)` parameters
    #[error("invalid erasure scheme: {0}")]
    InvalidScheme(String),

    /// Chunk data cannot be encoded
    #[error("invalid chunk data: {0}")]
    InvalidData(String),

    /// Fewer than `k` pieces were supplied for recovery
    #[error("too few pieces to recover chunk: need {needed}, have {available}")]
    TooFewPieces {
        /// Pieces needed for recovery (k)
        needed: usize,
        /// Pieces supplied
        available: usize,
    },

    /// Supplied pieces have different lengths
    #[error("piece size mismatch: expected {expected}, got {actual}")]
    PieceSizeMismatch {
        /// Size of the first piece seen
        expected: usize,
        /// Size of the offending piece
        actual: usize,
    },

    /// Piece slice does not have `n` slots
    #[error("wrong piece count: expected {expected}, got {actual}")]
    WrongPieceCount {
        /// Expected number of slots (n)
        expected: usize,
        /// Actual number of slots
        actual: usize,
    },

    /// Failure inside the Reed-Solomon codec
    #[error("codec error: {0}")]
    Codec(String),
}
