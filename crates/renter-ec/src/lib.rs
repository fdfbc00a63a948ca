//! Erasure coding for renter chunks
//!
//! A chunk of `chunk_size` bytes is split into `k` data pieces and
//! `n - k` parity pieces. Any `k` of the `n` pieces recover the chunk.
//!
//! ```
//! use renter_ec::{ErasureDecoder, ErasureEncoder, ErasureScheme};
//!
//! let scheme = ErasureScheme::new(4, 2).unwrap();
//! let pieces = ErasureEncoder::new(scheme.clone()).encode(b"hello renter").unwrap();
//! let mut received: Vec<Option<Vec<u8>>> = pieces.into_iter().map(Some).collect();
//! received[1] = None;
//! received[4] = None;
//! let data = ErasureDecoder::new(scheme).decode_exact(&received, 12).unwrap();
//! assert_eq!(&data, b"hello renter");
//! ```

mod decoder;
mod encoder;
mod error;
mod piece;
mod scheme;

pub use decoder::ErasureDecoder;
pub use encoder::ErasureEncoder;
pub use error::{Error, Result};
pub use piece::{Piece, PieceKind};
pub use scheme::ErasureScheme;
