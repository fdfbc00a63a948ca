//! Chunk uploads
//!
//! A chunk is erasure coded into `n` pieces and offered to every worker.
//! Each host takes at most one piece; workers arriving while every piece is
//! taken wait on standby and are recalled when an upload fails. The chunk
//! finishes once all `n` pieces are durable or no worker is left to try.

pub(crate) mod chunk;

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use renter_ec::{ErasureEncoder, ErasureScheme};
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{Error, Result};
use crate::host::HostKey;
use crate::memory::MemoryManager;
use crate::metrics::RenterMetrics;
use crate::pool::WorkerPool;
use crate::types::{ChunkId, PieceLocation, Priority};

use self::chunk::UploadChunk;

/// Chunk contents to upload
#[derive(Debug, Clone)]
pub enum UploadSource {
    /// Raw chunk data, encoded before upload
    Data(Bytes),
    /// All `n` pieces, already encoded
    Pieces(Vec<Bytes>),
}

#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// Chunk identity, for logs and repair bookkeeping
    pub id: Option<ChunkId>,
    pub source: UploadSource,
    pub scheme: ErasureScheme,
    pub priority: Priority,
    /// Pieces already durable on hosts; they count toward the outcome
    pub existing: Vec<PieceLocation>,
    /// Hosts that must not receive a piece
    pub excluded: HashSet<HostKey>,
    /// Memory was reserved by the caller, as repairs do
    pub memory_preallocated: bool,
}

impl UploadRequest {
    pub fn new(data: Bytes, scheme: ErasureScheme) -> Self {
        Self {
            id: None,
            source: UploadSource::Data(data),
            scheme,
            priority: Priority::Normal,
            existing: Vec::new(),
            excluded: HashSet::new(),
            memory_preallocated: false,
        }
    }

    pub fn with_id(mut self, id: ChunkId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_existing(mut self, existing: Vec<PieceLocation>) -> Self {
        self.existing = existing;
        self
    }

    pub fn excluding(mut self, hosts: impl IntoIterator<Item = HostKey>) -> Self {
        self.excluded.extend(hosts);
        self
    }

    pub fn preallocated(mut self) -> Self {
        self.memory_preallocated = true;
        self
    }

    fn label(&self) -> String {
        self.id
            .as_ref()
            .map_or_else(|| "anonymous".to_string(), ToString::to_string)
    }

    /// Pieces still to store, counting each existing host once
    fn missing_pieces(&self) -> usize {
        let n = self.scheme.num_pieces();
        let mut indices = HashSet::new();
        let mut hosts = HashSet::new();
        for location in &self.existing {
            if location.index < n && !indices.contains(&location.index) && hosts.insert(location.host) {
                indices.insert(location.index);
            }
        }
        n - indices.len()
    }

    fn piece_size(&self) -> Result<usize> {
        match &self.source {
            UploadSource::Data(data) if data.is_empty() => {
                Err(Error::InvalidRequest("chunk data is empty".into()))
            }
            UploadSource::Data(data) => Ok(self.scheme.piece_size(data.len())),
            UploadSource::Pieces(pieces) => {
                if pieces.len() != self.scheme.num_pieces() {
                    return Err(Error::InvalidRequest(format!(
                        "expected {} pieces, got {}",
                        self.scheme.num_pieces(),
                        pieces.len()
                    )));
                }
                let size = pieces.first().map_or(0, Bytes::len);
                if size == 0 || pieces.iter().any(|p| p.len() != size) {
                    return Err(Error::InvalidRequest("pieces differ in size".into()));
                }
                Ok(size)
            }
        }
    }
}

/// Result of an upload, successful or not
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadOutcome {
    /// Durable pieces on distinct hosts, existing ones included
    pub pieces_confirmed: usize,
    pub min_pieces: usize,
    pub num_pieces: usize,
    pub piece_size: usize,
    /// Pieces stored by this upload
    pub new_placements: Vec<PieceLocation>,
}

impl UploadOutcome {
    /// At least `k` pieces are durable
    pub fn is_available(&self) -> bool {
        self.pieces_confirmed >= self.min_pieces
    }

    /// All `n` pieces are durable
    pub fn is_complete(&self) -> bool {
        self.pieces_confirmed >= self.num_pieces
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UploadStats {
    pub pieces_confirmed: usize,
    pub pieces_in_flight: usize,
    pub standby: usize,
    pub standby_recalls: usize,
    pub workers_remaining: usize,
    pub memory_held: u64,
    pub finished: bool,
}

/// Pending chunk upload
pub struct UploadHandle {
    chunk: Arc<UploadChunk>,
    rx: oneshot::Receiver<UploadOutcome>,
}

impl UploadHandle {
    /// Wait for the outcome, whatever it is
    pub async fn wait_outcome(self) -> Result<UploadOutcome> {
        self.rx.await.map_err(|_| Error::Cancelled)
    }

    /// Wait for the outcome; fewer than `k` durable pieces is an error
    pub async fn wait(self) -> Result<UploadOutcome> {
        let outcome = self.wait_outcome().await?;
        if outcome.is_available() {
            Ok(outcome)
        } else {
            Err(Error::InsufficientRedundancy {
                needed: outcome.min_pieces,
                available: outcome.pieces_confirmed,
            })
        }
    }

    pub fn stats(&self) -> UploadStats {
        self.chunk.stats()
    }
}

/// Entry point for chunk uploads
pub struct Uploader {
    pool: Arc<WorkerPool>,
    memory: MemoryManager,
    metrics: Arc<RenterMetrics>,
}

impl Uploader {
    pub fn new(pool: Arc<WorkerPool>, memory: MemoryManager, metrics: Arc<RenterMetrics>) -> Self {
        Self {
            pool,
            memory,
            metrics,
        }
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    /// Encode and start uploading; waits for memory unless preallocated
    pub async fn request(&self, request: UploadRequest) -> Result<UploadHandle> {
        let piece_size = request.piece_size()?;
        let n = request.scheme.num_pieces();
        if let Some(bad) = request.existing.iter().find(|p| p.index >= n) {
            return Err(Error::InvalidRequest(format!(
                "existing piece {} outside scheme of {} pieces",
                bad.index, n
            )));
        }

        let memory = if request.memory_preallocated {
            None
        } else {
            let amount = (request.missing_pieces() * piece_size) as u64;
            Some(self.memory.request_guard(amount, request.priority).await)
        };

        let label = request.label();
        let scheme = request.scheme;
        let pieces = match request.source {
            UploadSource::Pieces(pieces) => pieces,
            UploadSource::Data(data) => tokio::task::spawn_blocking(move || {
                ErasureEncoder::new(scheme).encode(&data)
            })
            .await??
            .into_iter()
            .map(Bytes::from)
            .collect(),
        };

        let workers = self.pool.workers();
        debug!(chunk = %label, workers = workers.len(), "Dispatching chunk upload");
        let (chunk, rx) = UploadChunk::new(
            label,
            scheme,
            pieces,
            &request.existing,
            request.excluded,
            request.priority,
            memory,
            self.metrics.clone(),
        );
        chunk.dispatch(&workers);
        Ok(UploadHandle { chunk, rx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use crate::host::{ContractTerms, MemoryHost, UsableHost};
    use std::time::Duration;

    struct Setup {
        hosts: Vec<Arc<MemoryHost>>,
        pool: Arc<WorkerPool>,
        uploader: Uploader,
        metrics: Arc<RenterMetrics>,
    }

    fn setup(count: usize) -> Setup {
        let metrics = Arc::new(RenterMetrics::new());
        let pool = Arc::new(WorkerPool::new(WorkerConfig::default(), metrics.clone()));
        let hosts: Vec<Arc<MemoryHost>> = (0..count)
            .map(|i| Arc::new(MemoryHost::new(HostKey::from_seed(500 + i as u64))))
            .collect();
        let usable: Vec<UsableHost> = hosts
            .iter()
            .enumerate()
            .map(|(i, h)| UsableHost::new(h.key(), ContractTerms::open(i as u64), h.clone()))
            .collect();
        pool.reconcile(&usable);
        let uploader = Uploader::new(
            pool.clone(),
            MemoryManager::new("upload", 1 << 20),
            metrics.clone(),
        );
        Setup {
            hosts,
            pool,
            uploader,
            metrics,
        }
    }

    fn data(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i % 199) as u8).collect::<Vec<u8>>())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_upload_places_one_piece_per_host() {
        let setup = setup(6);
        let scheme = ErasureScheme::new(2, 4).unwrap();

        let handle = setup
            .uploader
            .request(UploadRequest::new(data(1000), scheme))
            .await
            .unwrap();
        let outcome = handle.wait().await.unwrap();

        assert!(outcome.is_complete());
        assert_eq!(outcome.new_placements.len(), 6);
        let hosts: HashSet<_> = outcome.new_placements.iter().map(|p| p.host).collect();
        assert_eq!(hosts.len(), 6);
        for host in &setup.hosts {
            assert_eq!(host.piece_count(), 1);
        }
        assert_eq!(setup.uploader.memory().outstanding(), 0);
        assert_eq!(setup.metrics.stats().chunks_uploaded, 1);
        setup.pool.kill_all();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_upload_with_fewer_hosts_than_pieces() {
        let setup = setup(4);
        let scheme = ErasureScheme::new(2, 4).unwrap();

        let outcome = setup
            .uploader
            .request(UploadRequest::new(data(1000), scheme))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(outcome.pieces_confirmed, 4);
        assert!(outcome.is_available());
        assert!(!outcome.is_complete());
        setup.pool.kill_all();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_upload_below_k_fails() {
        let setup = setup(6);
        for host in &setup.hosts[1..] {
            host.set_fail_writes(true);
        }
        let scheme = ErasureScheme::new(2, 4).unwrap();

        let result = setup
            .uploader
            .request(UploadRequest::new(data(1000), scheme))
            .await
            .unwrap()
            .wait()
            .await;
        assert!(matches!(
            result,
            Err(Error::InsufficientRedundancy {
                needed: 2,
                available: 1
            })
        ));
        assert_eq!(setup.uploader.memory().outstanding(), 0);
        assert_eq!(setup.metrics.stats().chunks_upload_failed, 1);
        setup.pool.kill_all();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failed_piece_goes_to_standby_worker() {
        let setup = setup(7);
        for host in &setup.hosts {
            host.set_latency(Duration::from_millis(50));
        }
        setup.hosts[0].set_fail_writes(true);
        let scheme = ErasureScheme::new(2, 4).unwrap();

        let handle = setup
            .uploader
            .request(UploadRequest::new(data(600), scheme))
            .await
            .unwrap();
        let outcome = handle.wait().await.unwrap();

        // host 0 either failed and was replaced, or sat on standby
        assert!(outcome.is_complete());
        assert_eq!(setup.hosts[0].piece_count(), 0);
        assert!(setup.metrics.stats().standby_recalls <= 1);
        setup.pool.kill_all();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_repair_upload_skips_existing_hosts() {
        let setup = setup(6);
        let scheme = ErasureScheme::new(2, 4).unwrap();
        let chunk = data(500);
        let pieces = ErasureEncoder::new(scheme).encode(&chunk).unwrap();

        let existing: Vec<PieceLocation> = (0..3)
            .map(|i| PieceLocation {
                index: i,
                host: setup.hosts[i].key(),
                root: setup.hosts[i].insert_piece(Bytes::from(pieces[i].clone())),
            })
            .collect();

        let outcome = setup
            .uploader
            .request(UploadRequest::new(chunk, scheme).with_existing(existing.clone()))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(outcome.pieces_confirmed, 6);
        assert_eq!(outcome.new_placements.len(), 3);
        for placement in &outcome.new_placements {
            assert!(placement.index >= 3);
            assert!(existing.iter().all(|e| e.host != placement.host));
        }
        for host in &setup.hosts {
            assert_eq!(host.piece_count(), 1);
        }
        setup.pool.kill_all();
    }

    #[tokio::test]
    async fn test_excluded_hosts_and_bad_requests() {
        let setup = setup(3);
        let scheme = ErasureScheme::new(1, 2).unwrap();

        let outcome = setup
            .uploader
            .request(UploadRequest::new(data(10), scheme).excluding([setup.hosts[0].key()]))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(outcome.pieces_confirmed, 2);
        assert_eq!(setup.hosts[0].piece_count(), 0);

        let empty = setup
            .uploader
            .request(UploadRequest::new(Bytes::new(), scheme))
            .await;
        assert!(matches!(empty, Err(Error::InvalidRequest(_))));
        setup.pool.kill_all();
    }
}
