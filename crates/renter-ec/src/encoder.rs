//! Reed-Solomon encoder

use reed_solomon_simd::ReedSolomonEncoder;

use crate::{ErasureScheme, Error, Piece, Result};

/// Splits chunk data into `k` data pieces and `n - k` parity pieces
pub struct ErasureEncoder {
    scheme: ErasureScheme,
}

impl ErasureEncoder {
    /// Create an encoder for `scheme`
    pub fn new(scheme: ErasureScheme) -> Self {
        Self { scheme }
    }

    /// Encode a chunk into `n` equally sized pieces
    ///
    /// The chunk is zero padded to `k` whole pieces; callers keep the
    /// original length to trim after recovery.
    pub fn encode(&self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        if data.is_empty() {
            return Err(Error::InvalidData("chunk cannot be empty".into()));
        }

        let piece_size = self.scheme.piece_size(data.len());
        let mut padded = data.to_vec();
        padded.resize(self.scheme.padded_chunk_size(data.len()), 0);

        let mut encoder = ReedSolomonEncoder::new(
            self.scheme.min_pieces(),
            self.scheme.parity_pieces(),
            piece_size,
        )
        .map_err(|e| Error::Codec(format!("failed to create encoder: {}", e)))?;

        for original in padded.chunks(piece_size) {
            encoder
                .add_original_shard(original)
                .map_err(|e| Error::Codec(format!("failed to add piece: {}", e)))?;
        }

        let result = encoder
            .encode()
            .map_err(|e| Error::Codec(format!("encoding failed: {}", e)))?;

        let mut pieces: Vec<Vec<u8>> = padded.chunks(piece_size).map(|s| s.to_vec()).collect();
        pieces.extend(result.recovery_iter().map(|r| r.to_vec()));
        Ok(pieces)
    }

    /// Encode and tag each piece with its index and kind
    pub fn encode_pieces(&self, data: &[u8]) -> Result<Vec<Piece>> {
        let k = self.scheme.min_pieces();
        Ok(self
            .encode(data)?
            .into_iter()
            .enumerate()
            .map(|(index, bytes)| Piece::new(index, k, bytes))
            .collect())
    }

    /// The scheme this encoder produces
    pub fn scheme(&self) -> &ErasureScheme {
        &self.scheme
    }
}
