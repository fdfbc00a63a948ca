//! Chunk downloads
//!
//! [`Downloader::request`] reserves memory for `k + d` pieces, then hands
//! the chunk to every worker in the pool. See [`chunk`] for how workers are
//! admitted, held on standby and recalled.

pub(crate) mod chunk;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use renter_ec::ErasureScheme;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::debug;

use crate::config::DownloadConfig;
use crate::error::{Error, Result};
use crate::fs::FileSnapshot;
use crate::memory::MemoryManager;
use crate::metrics::RenterMetrics;
use crate::pool::WorkerPool;
use crate::types::{ChunkId, PieceLocation, Priority};
use crate::worker::DownloadProfile;

use self::chunk::DownloadChunk;

/// Where a chunk's pieces live
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkLayout {
    pub id: ChunkId,
    pub scheme: ErasureScheme,
    /// Chunk length before padding
    pub length: usize,
    /// Known piece locations; an index may appear on several hosts
    pub pieces: Vec<PieceLocation>,
}

impl ChunkLayout {
    /// Layout of chunk `index` of `file`
    pub fn from_file(file: &FileSnapshot, index: u64) -> Result<Self> {
        let chunk = file
            .chunks
            .get(index as usize)
            .ok_or_else(|| Error::NotFound(format!("{}#{}", file.path, index)))?;
        Ok(Self {
            id: ChunkId::new(file.path.clone(), index),
            scheme: file.scheme,
            length: file.chunk_len(index) as usize,
            pieces: chunk.pieces.clone(),
        })
    }

    pub fn piece_size(&self) -> usize {
        self.scheme.piece_size(self.length)
    }

    /// Distinct piece indices among `pieces`
    pub fn distinct_pieces(&self) -> usize {
        let mut seen = vec![false; self.scheme.num_pieces()];
        for location in &self.pieces {
            if let Some(slot) = seen.get_mut(location.index) {
                *slot = true;
            }
        }
        seen.into_iter().filter(|s| *s).count()
    }
}

/// Optional limits on which workers may fetch for a chunk
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerFilter {
    /// Reject workers whose average read latency is above this
    pub max_latency: Option<Duration>,
    /// Reject workers whose contract charges more per piece
    pub max_price: Option<u64>,
    /// Reject workers with more recent read failures
    pub max_recent_failures: Option<u32>,
}

impl WorkerFilter {
    pub(crate) fn accepts(&self, profile: &DownloadProfile) -> bool {
        let latency_ok = match (self.max_latency, profile.latency) {
            (Some(max), Some(latency)) => latency <= max,
            _ => true,
        };
        latency_ok
            && self.max_price.map_or(true, |max| profile.price <= max)
            && self
                .max_recent_failures
                .map_or(true, |max| profile.recent_failures <= max)
    }
}

/// A byte range of one chunk
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub chunk: ChunkLayout,
    /// Offset of the range within the chunk
    pub offset: usize,
    pub length: usize,
    pub priority: Priority,
    /// Memory was reserved by the caller, as repairs do
    pub memory_preallocated: bool,
    pub filter: Option<WorkerFilter>,
}

impl DownloadRequest {
    /// The whole chunk at normal priority
    pub fn whole(chunk: ChunkLayout) -> Self {
        let length = chunk.length;
        Self {
            chunk,
            offset: 0,
            length,
            priority: Priority::Normal,
            memory_preallocated: false,
            filter: None,
        }
    }

    pub fn range(chunk: ChunkLayout, offset: usize, length: usize) -> Self {
        Self {
            offset,
            length,
            ..Self::whole(chunk)
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn preallocated(mut self) -> Self {
        self.memory_preallocated = true;
        self
    }

    fn validate(&self) -> Result<()> {
        let end = self.offset.checked_add(self.length);
        if self.length == 0 || end.map_or(true, |end| end > self.chunk.length) {
            return Err(Error::InvalidRequest(format!(
                "range {}+{} outside chunk of {} bytes",
                self.offset, self.length, self.chunk.length
            )));
        }
        let n = self.chunk.scheme.num_pieces();
        if let Some(bad) = self.chunk.pieces.iter().find(|p| p.index >= n) {
            return Err(Error::InvalidRequest(format!(
                "piece index {} outside scheme of {} pieces",
                bad.index, n
            )));
        }
        Ok(())
    }
}

/// Progress of one chunk download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DownloadStats {
    pub pieces_completed: usize,
    pub pieces_in_flight: usize,
    pub max_in_flight: usize,
    pub standby_recalls: usize,
    pub workers_remaining: usize,
    pub memory_held: u64,
    /// No fetch in flight, recovery concluded, memory released
    pub done: bool,
}

/// Pending chunk download
pub struct DownloadHandle {
    chunk: Arc<DownloadChunk>,
    rx: oneshot::Receiver<Result<Bytes>>,
}

impl DownloadHandle {
    /// Wait for the requested bytes
    pub async fn wait(self) -> Result<Bytes> {
        self.rx.await.unwrap_or(Err(Error::Cancelled))
    }

    /// Stop waiting; fetches already running finish in the background
    pub fn cancel(&self) {
        self.chunk.cancel();
    }

    pub fn stats(&self) -> DownloadStats {
        self.chunk.stats()
    }

    /// Resolves once every fetch has drained and memory is released
    pub async fn wait_done(&self) {
        let mut done = self.chunk.subscribe_done();
        let _ = done.wait_for(|d| *d).await;
    }
}

/// Memory a download reserves: `k + d` pieces, at most `n`
pub fn estimate_memory(layout: &ChunkLayout, overdrive: usize) -> u64 {
    let pieces = (layout.scheme.min_pieces() + overdrive).min(layout.scheme.num_pieces());
    (pieces * layout.piece_size()) as u64
}

/// Entry point for chunk downloads
pub struct Downloader {
    pool: Arc<WorkerPool>,
    memory: MemoryManager,
    config: DownloadConfig,
    metrics: Arc<RenterMetrics>,
}

impl Downloader {
    pub fn new(
        pool: Arc<WorkerPool>,
        memory: MemoryManager,
        config: DownloadConfig,
        metrics: Arc<RenterMetrics>,
    ) -> Self {
        Self {
            pool,
            memory,
            config,
            metrics,
        }
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    /// Start downloading; waits for memory unless it was preallocated
    pub async fn request(&self, request: DownloadRequest) -> Result<DownloadHandle> {
        request.validate()?;
        let memory = if request.memory_preallocated {
            None
        } else {
            let amount = estimate_memory(&request.chunk, self.config.overdrive);
            Some(self.memory.request_guard(amount, request.priority).await)
        };

        let workers = self.pool.workers();
        debug!(
            chunk = %request.chunk.id,
            offset = request.offset,
            length = request.length,
            workers = workers.len(),
            "Dispatching chunk download"
        );
        let (chunk, rx) = DownloadChunk::new(
            request,
            self.config.overdrive,
            self.config.piece_redundancy,
            memory,
            self.metrics.clone(),
        );
        chunk.dispatch(&workers);
        Ok(DownloadHandle { chunk, rx })
    }
}
