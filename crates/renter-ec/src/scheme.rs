//! Erasure scheme parameters

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Largest `n` the Reed-Solomon codec accepts
const MAX_PIECES: usize = 32768;

/// A `(k, n)` Reed-Solomon scheme
///
/// A chunk is split into `k` data pieces plus `n - k` parity pieces and can
/// be recovered from any `k` of the `n`. Redundancy is `n / k`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ErasureScheme {
    /// Pieces required to recover a chunk (k)
    min_pieces: usize,
    /// Pieces produced per chunk (n)
    num_pieces: usize,
}

impl ErasureScheme {
    /// Create a scheme with `data_pieces` data pieces and `parity_pieces`
    /// parity pieces.
    ///
    /// ```
    /// use renter_ec::ErasureScheme;
    ///
    /// let scheme = ErasureScheme::new(10, 20).unwrap();
    /// assert_eq!(scheme.min_pieces(), 10);
    /// assert_eq!(scheme.num_pieces(), 30);
    /// ```
    pub fn new(data_pieces: usize, parity_pieces: usize) -> Result<Self> {
        if data_pieces == 0 {
            return Err(Error::InvalidScheme(
                "data_pieces must be at least 1".into(),
            ));
        }
        if parity_pieces == 0 {
            return Err(Error::InvalidScheme(
                "parity_pieces must be at least 1".into(),
            ));
        }

        let total = data_pieces + parity_pieces;
        if total > MAX_PIECES {
            return Err(Error::InvalidScheme(format!(
                "total pieces ({}) exceeds maximum of {}",
                total, MAX_PIECES
            )));
        }

        Ok(Self {
            min_pieces: data_pieces,
            num_pieces: total,
        })
    }

    /// 10-of-30, the network's default upload scheme (3x redundancy)
    pub fn default_upload() -> Self {
        Self {
            min_pieces: 10,
            num_pieces: 30,
        }
    }

    /// 1-of-N replication-like scheme used for small metadata chunks
    pub fn replicated(copies: usize) -> Result<Self> {
        Self::new(1, copies.saturating_sub(1))
    }

    /// Pieces required to recover a chunk (k)
    pub fn min_pieces(&self) -> usize {
        self.min_pieces
    }

    /// Total pieces per chunk (n)
    pub fn num_pieces(&self) -> usize {
        self.num_pieces
    }

    /// Parity pieces per chunk (n - k)
    pub fn parity_pieces(&self) -> usize {
        self.num_pieces - self.min_pieces
    }

    /// Redundancy multiple when all pieces are present
    pub fn redundancy(&self) -> f64 {
        self.num_pieces as f64 / self.min_pieces as f64
    }

    /// Size of one piece for a chunk of `chunk_size` bytes
    ///
    /// `ceil(chunk_size / k)` rounded up to an even number, which the codec
    /// requires. A zero-sized chunk still yields a two byte piece.
    pub fn piece_size(&self, chunk_size: usize) -> usize {
        let raw = chunk_size.div_ceil(self.min_pieces).max(1);
        (raw + 1) & !1
    }

    /// Chunk size after zero padding to `k` whole pieces
    pub fn padded_chunk_size(&self, chunk_size: usize) -> usize {
        self.piece_size(chunk_size) * self.min_pieces
    }

    /// Bytes stored on hosts for one chunk with all `n` pieces
    pub fn encoded_size(&self, chunk_size: usize) -> usize {
        self.piece_size(chunk_size) * self.num_pieces
    }
}

impl Default for ErasureScheme {
    fn default() -> Self {
        Self::default_upload()
    }
}
