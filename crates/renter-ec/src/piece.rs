//! Pieces produced by the encoder

use bytes::Bytes;

/// Whether a piece carries original chunk bytes or parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PieceKind {
    /// One of the first `k` pieces
    Data,
    /// One of the trailing `n - k` pieces
    Parity,
}

/// One erasure-coded fragment of a chunk, destined for one host
#[derive(Debug, Clone)]
pub struct Piece {
    /// Position within the chunk's `n` pieces
    pub index: usize,
    /// Data or parity
    pub kind: PieceKind,
    /// Piece bytes
    pub data: Bytes,
}

impl Piece {
    pub(crate) fn new(index: usize, min_pieces: usize, data: Vec<u8>) -> Self {
        let kind = if index < min_pieces {
            PieceKind::Data
        } else {
            PieceKind::Parity
        };
        Self {
            index,
            kind,
            data: Bytes::from(data),
        }
    }

    /// Check if this is a data piece
    pub fn is_data(&self) -> bool {
        self.kind == PieceKind::Data
    }

    /// Piece length in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if the piece is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
