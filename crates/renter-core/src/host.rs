//! Host identities, contract terms and the piece I/O contract
//!
//! The contract and host-selection subsystem hands the engine a list of
//! [`UsableHost`]s. Each carries a [`HostConnection`] implementing the
//! protocol layer's per-piece primitives, including proof verification.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Public key identifying a host
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostKey([u8; 32]);

impl HostKey {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Deterministic key derived from a seed, for simulations
    pub fn from_seed(seed: u64) -> Self {
        Self(*blake3::hash(&seed.to_le_bytes()).as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ed25519:{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostKey({})", hex::encode(&self.0[..8]))
    }
}

/// Merkle root of a stored piece
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PieceRoot([u8; 32]);

impl PieceRoot {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Root of `data` as computed by [`MemoryHost`]
    pub fn of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }
}

impl fmt::Display for PieceRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for PieceRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PieceRoot({})", self)
    }
}

/// Terms of the file contract the renter holds with a host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractTerms {
    pub contract_id: u64,
    /// Bumped by the contractor whenever the terms change
    pub version: u64,
    pub good_for_upload: bool,
    pub good_for_download: bool,
    /// Price per downloaded piece, in the smallest currency unit
    pub download_price: u64,
    /// Price per uploaded piece, in the smallest currency unit
    pub upload_price: u64,
}

impl ContractTerms {
    /// Terms that allow everything at no cost
    pub fn open(contract_id: u64) -> Self {
        Self {
            contract_id,
            version: 1,
            good_for_upload: true,
            good_for_download: true,
            download_price: 0,
            upload_price: 0,
        }
    }

    /// A host is usable while at least one direction is allowed
    pub fn is_usable(&self) -> bool {
        self.good_for_upload || self.good_for_download
    }
}

/// Per-piece primitives against one host
///
/// `write_piece` returns only after the host signed the contract revision
/// covering the new piece; the returned root is then durable.
#[async_trait]
pub trait HostConnection: Send + Sync {
    /// Fetch a piece and verify it against `root`
    async fn read_piece(&self, root: PieceRoot) -> Result<Bytes>;

    /// Store a piece, revising the contract
    async fn write_piece(&self, data: Bytes) -> Result<PieceRoot>;

    /// Check whether the host still stores `root`
    async fn has_piece(&self, root: PieceRoot) -> Result<bool>;
}

/// A host the renter may currently use
#[derive(Clone)]
pub struct UsableHost {
    pub key: HostKey,
    pub terms: ContractTerms,
    pub connection: Arc<dyn HostConnection>,
}

impl UsableHost {
    pub fn new(key: HostKey, terms: ContractTerms, connection: Arc<dyn HostConnection>) -> Self {
        Self {
            key,
            terms,
            connection,
        }
    }
}

impl fmt::Debug for UsableHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsableHost")
            .field("key", &self.key)
            .field("terms", &self.terms)
            .finish_non_exhaustive()
    }
}

/// In-memory host for simulations and tests
///
/// Roots are blake3 hashes. Reads and writes can be made to fail or to
/// take a fixed latency.
pub struct MemoryHost {
    key: HostKey,
    pieces: RwLock<HashMap<PieceRoot, Bytes>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    latency: Mutex<Duration>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemoryHost {
    pub fn new(key: HostKey) -> Self {
        Self {
            key,
            pieces: RwLock::new(HashMap::new()),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            latency: Mutex::new(Duration::ZERO),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    pub fn key(&self) -> HostKey {
        self.key
    }

    /// Make every subsequent read fail
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent write fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Delay applied to every operation
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Store a piece directly, bypassing the contract
    pub fn insert_piece(&self, data: Bytes) -> PieceRoot {
        let root = PieceRoot::of(&data);
        self.pieces.write().insert(root, data);
        root
    }

    /// Forget a piece, as a host losing data would
    pub fn remove_piece(&self, root: &PieceRoot) -> bool {
        self.pieces.write().remove(root).is_some()
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.read().len()
    }

    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    async fn delay(&self) {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn fault(&self, message: &str) -> Error {
        Error::HostFault {
            host: self.key,
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl HostConnection for MemoryHost {
    async fn read_piece(&self, root: PieceRoot) -> Result<Bytes> {
        self.delay().await;
        self.reads.fetch_add(1, Ordering::Relaxed);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(self.fault("read rejected"));
        }
        self.pieces
            .read()
            .get(&root)
            .cloned()
            .ok_or_else(|| self.fault("piece not stored"))
    }

    async fn write_piece(&self, data: Bytes) -> Result<PieceRoot> {
        self.delay().await;
        self.writes.fetch_add(1, Ordering::Relaxed);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(self.fault("revision rejected"));
        }
        Ok(self.insert_piece(data))
    }

    async fn has_piece(&self, root: PieceRoot) -> Result<bool> {
        self.delay().await;
        Ok(self.pieces.read().contains_key(&root))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_key_display() {
        let key = HostKey::new([0xab; 32]);
        assert_eq!(key.to_string(), "ed25519:abababababababab");
        assert_ne!(HostKey::from_seed(1), HostKey::from_seed(2));
    }

    #[test]
    fn test_contract_terms_usable() {
        let mut terms = ContractTerms::open(7);
        assert!(terms.is_usable());
        terms.good_for_upload = false;
        assert!(terms.is_usable());
        terms.good_for_download = false;
        assert!(!terms.is_usable());
    }

    #[tokio::test]
    async fn test_memory_host_round_trip() {
        let host = MemoryHost::new(HostKey::from_seed(3));
        let root = host.write_piece(Bytes::from_static(b"piece")).await.unwrap();
        assert_eq!(root, PieceRoot::of(b"piece"));
        assert!(host.has_piece(root).await.unwrap());
        assert_eq!(host.read_piece(root).await.unwrap(), Bytes::from_static(b"piece"));
        assert_eq!(host.write_count(), 1);
    }

    #[tokio::test]
    async fn test_memory_host_failures() {
        let host = MemoryHost::new(HostKey::from_seed(4));
        let root = host.insert_piece(Bytes::from_static(b"x"));

        host.set_fail_reads(true);
        assert!(matches!(
            host.read_piece(root).await,
            Err(Error::HostFault { .. })
        ));

        host.set_fail_writes(true);
        assert!(host.write_piece(Bytes::from_static(b"y")).await.is_err());

        host.set_fail_reads(false);
        assert!(host.remove_piece(&root));
        assert!(host.read_piece(root).await.is_err());
    }
}
