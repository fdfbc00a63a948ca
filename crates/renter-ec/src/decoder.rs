//! Reed-Solomon decoder

use reed_solomon_simd::ReedSolomonDecoder;

use crate::{ErasureScheme, Error, Result};

/// Recovers a chunk from any `k` of its `n` pieces
pub struct ErasureDecoder {
    scheme: ErasureScheme,
}

impl ErasureDecoder {
    /// Create a decoder for `scheme`
    pub fn new(scheme: ErasureScheme) -> Self {
        Self { scheme }
    }

    /// Recover the padded chunk
    ///
    /// `pieces` must have exactly `n` slots, `None` for pieces that were not
    /// retrieved. Only the first `k` present pieces are used.
    pub fn decode(&self, pieces: &[Option<Vec<u8>>]) -> Result<Vec<u8>> {
        let n = self.scheme.num_pieces();
        let k = self.scheme.min_pieces();

        if pieces.len() != n {
            return Err(Error::WrongPieceCount {
                expected: n,
                actual: pieces.len(),
            });
        }

        let mut piece_size = 0;
        let mut available = 0;
        for piece in pieces.iter().flatten() {
            if piece_size == 0 {
                piece_size = piece.len();
            } else if piece.len() != piece_size {
                return Err(Error::PieceSizeMismatch {
                    expected: piece_size,
                    actual: piece.len(),
                });
            }
            available += 1;
        }

        if available < k || piece_size == 0 {
            return Err(Error::TooFewPieces {
                needed: k,
                available,
            });
        }

        // Fast path: every data piece is present.
        if pieces[..k].iter().all(Option::is_some) {
            let mut chunk = Vec::with_capacity(piece_size * k);
            for piece in pieces[..k].iter().flatten() {
                chunk.extend_from_slice(piece);
            }
            return Ok(chunk);
        }

        let mut decoder = ReedSolomonDecoder::new(k, self.scheme.parity_pieces(), piece_size)
            .map_err(|e| Error::Codec(format!("failed to create decoder: {}", e)))?;

        let mut added = 0;
        for (index, piece) in pieces.iter().enumerate() {
            if added == k {
                break;
            }
            let Some(data) = piece else { continue };
            let res = if index < k {
                decoder.add_original_shard(index, data)
            } else {
                decoder.add_recovery_shard(index - k, data)
            };
            res.map_err(|e| Error::Codec(format!("failed to add piece {}: {}", index, e)))?;
            added += 1;
        }

        let restored = decoder
            .decode()
            .map_err(|e| Error::Codec(format!("decoding failed: {}", e)))?;

        let mut chunk = vec![0u8; piece_size * k];
        for (index, piece) in pieces[..k].iter().enumerate() {
            if let Some(data) = piece {
                chunk[index * piece_size..(index + 1) * piece_size].copy_from_slice(data);
            }
        }
        for (index, data) in restored.restored_original_iter() {
            chunk[index * piece_size..(index + 1) * piece_size].copy_from_slice(data);
        }

        Ok(chunk)
    }

    /// Recover the chunk and trim the encoder's zero padding
    pub fn decode_exact(&self, pieces: &[Option<Vec<u8>>], chunk_len: usize) -> Result<Vec<u8>> {
        let mut chunk = self.decode(pieces)?;
        chunk.truncate(chunk_len);
        Ok(chunk)
    }

    /// The scheme this decoder recovers
    pub fn scheme(&self) -> &ErasureScheme {
        &self.scheme
    }
}
